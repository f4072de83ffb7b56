//! 备份文件轮转：只保留最新的 N 个归档

use crate::constants::backup;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 备份目录中的一个归档文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub modified: SystemTime,
}

impl ArchiveEntry {
    pub fn modified_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.modified)
    }
}

/// 一次轮转的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub kept: usize,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

/// 列出目录（不递归）中的 `.zip` 归档，按修改时间从新到旧排序，
/// 修改时间相同时按文件名倒序。目录不存在时返回空列表。
pub fn list_archives(directory: &Path) -> Result<Vec<ArchiveEntry>> {
    if !directory.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(directory).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().to_string();
        if !filename.ends_with(backup::BACKUP_EXTENSION) {
            continue;
        }
        let metadata = entry.metadata()?;
        entries.push(ArchiveEntry {
            path: entry.path().to_path_buf(),
            filename,
            size: metadata.len(),
            modified: metadata.modified()?,
        });
    }

    entries.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.filename.cmp(&a.filename))
    });
    Ok(entries)
}

/// 备份保留策略
#[derive(Debug, Clone, Copy)]
pub struct RetentionManager {
    max_count: usize,
}

impl RetentionManager {
    /// `max_count` 为 0 表示不做清理
    pub fn new(max_count: usize) -> Self {
        Self { max_count }
    }

    /// 删除排在第 `max_count` 位之后的归档
    ///
    /// 单个文件删除失败只记录日志，继续处理剩余文件。
    pub fn enforce(&self, directory: &Path) -> Result<RetentionReport> {
        let archives = list_archives(directory)?;
        if self.max_count == 0 || archives.len() <= self.max_count {
            debug!(
                count = archives.len(),
                max = self.max_count,
                "备份数量未超过上限，无需清理"
            );
            return Ok(RetentionReport {
                kept: archives.len(),
                ..Default::default()
            });
        }

        let mut report = RetentionReport {
            kept: self.max_count,
            ..Default::default()
        };
        for archive in archives.into_iter().skip(self.max_count) {
            match fs::remove_file(&archive.path) {
                Ok(()) => {
                    info!("已删除旧备份: {}", archive.filename);
                    report.removed.push(archive.filename);
                }
                Err(e) => {
                    warn!("删除旧备份失败 {}: {}", archive.filename, e);
                    report.failed.push(archive.filename);
                }
            }
        }

        Ok(report)
    }
}
