//! 本地备份目录：命名、写入、列出、统计、删除与完整性校验

use crate::constants::backup;
use crate::error::{Result, VaultError};
use crate::retention::{ArchiveEntry, list_archives};
use crate::web::ArchiveFormat;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

/// 写入中的临时文件，未完成就被丢弃时删除
///
/// 文件名以 `.` 开头、以 `.partial` 结尾，不会被列表和保留策略当作备份。
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub(crate) fn new(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            path: target.with_file_name(format!(".{name}.partial")),
            armed: true,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// 已改名到最终位置，不再删除
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// 生成备份文件名：`<前缀>_<ISO8601 时间，':' 与 '.' 替换为 '-'>.zip`
pub fn archive_filename(prefix: &str, now: DateTime<Utc>) -> String {
    let timestamp = now
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
        .replace([':', '.'], "-");
    format!("{prefix}_{timestamp}{}", backup::BACKUP_EXTENSION)
}

/// 把用户给的备份名清理为 `[A-Za-z0-9_-]`，清理后为空时返回 None
pub fn sanitize_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// 已写入本地的备份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArchive {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
}

/// 备份文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFile {
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl From<ArchiveEntry> for BackupFile {
    fn from(entry: ArchiveEntry) -> Self {
        Self {
            modified: entry.modified_at(),
            filename: entry.filename,
            size: entry.size,
        }
    }
}

/// 备份目录统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageStats {
    pub count: usize,
    pub total_size: u64,
    pub average_size: u64,
    pub oldest: Option<BackupFile>,
    pub newest: Option<BackupFile>,
}

/// 归档完整性校验结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveCheck {
    pub filename: String,
    pub format: String,
    pub entries: usize,
}

/// 本地备份目录
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            VaultError::persistence(format!(
                "cannot create backup directory {}: {e}",
                self.dir.display()
            ))
        })
    }

    /// 写入备份数据，写入后为 0 字节时视为失败并删除
    ///
    /// 先写入同目录下的临时文件，完成后再改名，中途取消不会留下截断的备份。
    pub async fn save(&self, filename: &str, bytes: &[u8]) -> Result<StoredArchive> {
        self.ensure_dir().await?;
        let path = self.path_for(filename);
        let partial = PartialFile::new(&path);
        let write_error =
            |e: std::io::Error| VaultError::persistence(format!("cannot write {}: {e}", path.display()));

        let mut file = tokio::fs::File::create(partial.path())
            .await
            .map_err(write_error)?;
        file.write_all(bytes).await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;
        drop(file);

        tokio::fs::rename(partial.path(), &path)
            .await
            .map_err(write_error)?;
        partial.disarm();
        self.stat_archive(path).await
    }

    /// 检查已落盘的备份文件
    pub async fn stat_archive(&self, path: PathBuf) -> Result<StoredArchive> {
        let size = tokio::fs::metadata(&path).await?.len();
        if size == 0 {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(VaultError::validation("backup file is empty"));
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(StoredArchive {
            path,
            filename,
            size,
        })
    }

    /// 按修改时间从新到旧列出备份
    pub async fn list_backups(&self) -> Result<Vec<BackupFile>> {
        let dir = self.dir.clone();
        let entries = tokio::task::spawn_blocking(move || list_archives(&dir)).await??;
        Ok(entries.into_iter().map(BackupFile::from).collect())
    }

    pub async fn stats(&self) -> Result<BackupStorageStats> {
        let backups = self.list_backups().await?;
        if backups.is_empty() {
            return Ok(BackupStorageStats::default());
        }

        let count = backups.len();
        let total_size: u64 = backups.iter().map(|b| b.size).sum();
        Ok(BackupStorageStats {
            count,
            total_size,
            average_size: total_size / count as u64,
            newest: backups.first().cloned(),
            oldest: backups.last().cloned(),
        })
    }

    /// 删除指定备份，拒绝包含路径成分的文件名
    pub async fn delete_backup(&self, filename: &str) -> Result<()> {
        let path = self.resolve(filename)?;
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::persistence(format!("backup not found: {filename}"))
            } else {
                VaultError::persistence(format!("cannot delete {filename}: {e}"))
            }
        })?;
        info!("已删除备份: {}", filename);
        Ok(())
    }

    /// 校验备份归档能否完整读取（zip 或 gzip+tar）
    pub async fn verify_backup(&self, filename: &str) -> Result<ArchiveCheck> {
        let path = self.resolve(filename)?;
        if !path.is_file() {
            return Err(VaultError::persistence(format!("backup not found: {filename}")));
        }

        let filename = filename.to_string();
        tokio::task::spawn_blocking(move || {
            let mut header = [0u8; 512];
            let read = File::open(&path)?.read(&mut header)?;
            let format = ArchiveFormat::detect(&header[..read]);

            let entries = match format {
                ArchiveFormat::Zip => count_zip_entries(&path)?,
                ArchiveFormat::Gzip => count_tar_gz_entries(&path)?,
                other => {
                    return Err(VaultError::validation(format!(
                        "unsupported archive format: {other}"
                    )));
                }
            };

            Ok(ArchiveCheck {
                filename,
                format: format.to_string(),
                entries,
            })
        })
        .await?
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        let invalid = filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename.contains("..")
            || !filename.ends_with(backup::BACKUP_EXTENSION);
        if invalid {
            return Err(VaultError::invalid_config(format!(
                "invalid backup filename: {filename}"
            )));
        }
        Ok(self.dir.join(filename))
    }
}

fn count_zip_entries(path: &Path) -> Result<usize> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        std::io::copy(&mut entry, &mut std::io::sink())?;
    }
    Ok(archive.len())
}

fn count_tar_gz_entries(path: &Path) -> Result<usize> {
    let decoder = flate2::read::GzDecoder::new(File::open(path)?);
    let mut archive = tar::Archive::new(decoder);
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        std::io::copy(&mut entry, &mut std::io::sink())?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_archive_filename() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 3, 0, 5).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(
            archive_filename(backup::BACKUP_PREFIX, now),
            "pi-hole_backup_2024-03-09T03-00-05-042Z.zip"
        );
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("weekly backup").as_deref(), Some("weekly_backup"));
        assert_eq!(sanitize_name("../../etc").as_deref(), Some("etc"));
        assert_eq!(sanitize_name("pre-upgrade_1").as_deref(), Some("pre-upgrade_1"));
        assert_eq!(sanitize_name("  "), None);
    }

    #[tokio::test]
    async fn test_save_rejects_empty() {
        let temp_dir = tempdir().unwrap();
        let store = BackupStore::new(temp_dir.path().join("backups"));

        let err = store.save("empty.zip", b"").await.unwrap_err();
        assert!(matches!(err, VaultError::ProtocolValidation(_)));
        assert!(!store.path_for("empty.zip").exists());

        let stored = store.save("ok.zip", b"PK\x03\x04").await.unwrap();
        assert_eq!(stored.size, 4);
        assert_eq!(stored.filename, "ok.zip");
    }

    #[tokio::test]
    async fn test_abandoned_save_leaves_no_archive() {
        let temp_dir = tempdir().unwrap();
        let store = BackupStore::new(temp_dir.path());
        let target = store.path_for("pi-hole_backup_1.zip");

        {
            let partial = PartialFile::new(&target);
            assert_eq!(
                partial.path(),
                temp_dir.path().join(".pi-hole_backup_1.zip.partial")
            );
            std::fs::write(partial.path(), b"PK\x03").unwrap();
            assert!(store.list_backups().await.unwrap().is_empty());
        }
        assert!(std::fs::read_dir(temp_dir.path()).unwrap().next().is_none());

        store.save("pi-hole_backup_1.zip", b"PK\x03\x04").await.unwrap();
        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["pi-hole_backup_1.zip"]);
    }

    #[tokio::test]
    async fn test_delete_rejects_traversal() {
        let temp_dir = tempdir().unwrap();
        let store = BackupStore::new(temp_dir.path());

        for name in ["../secret.zip", "a/b.zip", "config.json", ""] {
            let err = store.delete_backup(name).await.unwrap_err();
            assert!(matches!(err, VaultError::InvalidConfig(_)), "{name}");
        }

        let err = store.delete_backup("missing.zip").await.unwrap_err();
        assert!(err.to_string().contains("backup not found"));
    }

    #[tokio::test]
    async fn test_list_stats_and_verify() {
        let temp_dir = tempdir().unwrap();
        let store = BackupStore::new(temp_dir.path());

        // 有效的 zip
        {
            let file = File::create(store.path_for("good.zip")).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("etc/pihole/gravity.db", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"data").unwrap();
            writer.finish().unwrap();
        }
        // gzip 压缩的 tar
        {
            let file = File::create(store.path_for("legacy.zip")).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "adlist.json", &b"[{}]"[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        std::fs::write(store.path_for("broken.zip"), b"not an archive at all").unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.count, 3);
        assert!(stats.newest.is_some() && stats.oldest.is_some());

        let check = store.verify_backup("good.zip").await.unwrap();
        assert_eq!(check.format, "zip");
        assert_eq!(check.entries, 1);

        let check = store.verify_backup("legacy.zip").await.unwrap();
        assert_eq!(check.format, "gzip");
        assert_eq!(check.entries, 1);

        assert!(store.verify_backup("broken.zip").await.is_err());

        store.delete_backup("broken.zip").await.unwrap();
        assert_eq!(store.list_backups().await.unwrap().len(), 2);
    }
}
