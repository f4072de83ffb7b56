//! 备份任务记录
//!
//! 记录保存在单个 JSON 数组文件中，每次修改整体重写：
//! 先写同目录下的临时文件再重命名替换，进程内的写入由互斥锁串行化。

use crate::constants::jobs;
use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

static LAST_JOB_MILLIS: AtomicU64 = AtomicU64::new(0);

/// 生成任务 ID：`backup_<毫秒时间戳>`，进程内严格递增
pub fn next_job_id() -> String {
    let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let previous = LAST_JOB_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    format!("{}{}", jobs::JOB_ID_PREFIX, now.max(previous + 1))
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    #[serde(alias = "completed")]
    Success,
    #[serde(alias = "failed")]
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务的附加信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// 一条任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub message: String,
    #[serde(flatten)]
    pub extra: JobExtra,
}

/// 任务统计
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub running: usize,
    /// 成功率（百分比，保留两位小数）
    pub success_rate: f64,
    pub last_run: Option<DateTime<Utc>>,
}

/// 任务记录簿
#[derive(Debug)]
pub struct JobLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 新增或按 ID 原位替换一条记录，随后只保留最近的 100 条
    pub async fn upsert(
        &self,
        id: &str,
        status: JobStatus,
        message: impl Into<String>,
        extra: JobExtra,
    ) -> Result<JobRecord> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;

        let record = JobRecord {
            id: id.to_string(),
            timestamp: Utc::now(),
            status,
            message: message.into(),
            extra,
        };

        match records.iter_mut().find(|r| r.id == id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }

        if records.len() > jobs::MAX_JOB_RECORDS {
            let overflow = records.len() - jobs::MAX_JOB_RECORDS;
            records.drain(..overflow);
        }

        self.write_records(records).await?;
        debug!(job_id = %id, status = %status, "任务记录已更新");
        Ok(record)
    }

    /// 按存储顺序返回全部记录（最新的在最后）
    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        let _guard = self.lock.lock().await;
        self.read_records().await
    }

    /// 按时间倒序返回最近的记录
    pub async fn list_recent(&self, limit: Option<usize>) -> Result<Vec<JobRecord>> {
        let mut records = self.list().await?;
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.list().await?.into_iter().find(|r| r.id == id))
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_records(Vec::new()).await
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let records = self.list().await?;
        let count = |status: JobStatus| records.iter().filter(|r| r.status == status).count();

        let total = records.len();
        let successful = count(JobStatus::Success);
        let success_rate = if total == 0 {
            0.0
        } else {
            (successful as f64 / total as f64 * 10000.0).round() / 100.0
        };

        Ok(JobStats {
            total,
            successful,
            failed: count(JobStatus::Error),
            running: count(JobStatus::Running),
            success_rate,
            last_run: records.iter().map(|r| r.timestamp).max(),
        })
    }

    async fn read_records(&self) -> Result<Vec<JobRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            VaultError::persistence(format!(
                "job ledger {} is corrupted: {e}",
                self.path.display()
            ))
        })
    }

    async fn write_records(&self, records: Vec<JobRecord>) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &records)).await?
    }
}

fn write_atomic(path: &Path, records: &[JobRecord]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let content = serde_json::to_vec_pretty(records)?;
    let mut temp = NamedTempFile::new_in(&dir)?;
    temp.write_all(&content)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| VaultError::persistence(format!("cannot replace job ledger: {}", e.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_job_ids_strictly_increase() {
        let ids: Vec<u64> = (0..50)
            .map(|_| {
                next_job_id()
                    .trim_start_matches(jobs::JOB_ID_PREFIX)
                    .parse()
                    .unwrap()
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_id() {
        let temp_dir = tempdir().unwrap();
        let ledger = JobLedger::new(temp_dir.path().join("jobs.json"));

        ledger
            .upsert("backup_1", JobStatus::Running, "Backup started", JobExtra::default())
            .await
            .unwrap();
        ledger
            .upsert("backup_2", JobStatus::Running, "Backup started", JobExtra::default())
            .await
            .unwrap();
        let extra = JobExtra {
            filename: Some("pi-hole_backup_x.zip".to_string()),
            size: Some(5000),
            method: Some("web".to_string()),
            duration_seconds: Some(1.5),
        };
        ledger
            .upsert("backup_1", JobStatus::Success, "Backup completed", extra.clone())
            .await
            .unwrap();
        ledger
            .upsert("backup_1", JobStatus::Success, "Backup completed", extra.clone())
            .await
            .unwrap();

        let records = ledger.list().await.unwrap();
        assert_eq!(records.len(), 2);
        // 原位替换，不改变顺序
        assert_eq!(records[0].id, "backup_1");
        assert_eq!(records[0].status, JobStatus::Success);
        assert_eq!(records[0].extra, extra);
        assert_eq!(records[1].id, "backup_2");
    }

    #[tokio::test]
    async fn test_ledger_keeps_last_hundred() {
        let temp_dir = tempdir().unwrap();
        let ledger = JobLedger::new(temp_dir.path().join("jobs.json"));

        for i in 0..105 {
            ledger
                .upsert(&format!("backup_{i}"), JobStatus::Error, "failed", JobExtra::default())
                .await
                .unwrap();
        }

        let records = ledger.list().await.unwrap();
        assert_eq!(records.len(), jobs::MAX_JOB_RECORDS);
        assert_eq!(records.first().unwrap().id, "backup_5");
        assert_eq!(records.last().unwrap().id, "backup_104");
    }

    #[tokio::test]
    async fn test_legacy_status_names_and_stats() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("jobs.json");
        std::fs::write(
            &path,
            r#"[
                {"id":"backup_1","timestamp":"2024-01-01T03:00:00Z","status":"completed","message":"ok","filename":"a.zip","size":10,"method":"ssh"},
                {"id":"backup_2","timestamp":"2024-01-02T03:00:00Z","status":"failed","message":"boom"},
                {"id":"backup_3","timestamp":"2024-01-03T03:00:00Z","status":"success","message":"ok"}
            ]"#,
        )
        .unwrap();

        let ledger = JobLedger::new(&path);
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.success_rate, 66.67);

        let recent = ledger.list_recent(Some(2)).await.unwrap();
        assert_eq!(recent[0].id, "backup_3");
        assert_eq!(recent[1].id, "backup_2");

        ledger.clear().await.unwrap();
        assert!(ledger.list().await.unwrap().is_empty());
        assert_eq!(ledger.stats().await.unwrap().success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let temp_dir = tempdir().unwrap();
        let ledger = JobLedger::new(temp_dir.path().join("nested").join("jobs.json"));
        assert!(ledger.list().await.unwrap().is_empty());

        ledger
            .upsert("backup_1", JobStatus::Running, "Backup started", JobExtra::default())
            .await
            .unwrap();
        assert!(ledger.path().exists());
    }
}
