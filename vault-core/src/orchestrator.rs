//! 备份流程编排
//!
//! 一次备份：登记任务 -> 按连接方式采集 -> 落盘 -> 轮转 -> 更新任务 -> 通知钩子。
//! 所有错误都转换为失败的 [`BackupOutcome`]，不会向调用方传播。

use crate::config::{AppConfig, BackupSettings, Strategy};
use crate::connection::ConnectionConfig;
use crate::constants::backup;
use crate::error::{Result, VaultError};
use crate::hooks::{BackupFailed, BackupHooks, BackupSucceeded, LoggingHooks};
use crate::jobs::{JobExtra, JobLedger, JobStatus, next_job_id};
use crate::retention::RetentionManager;
use crate::scheduler::BackupTask;
use crate::ssh::ShellAcquisitionClient;
use crate::storage::{BackupStore, StoredArchive, archive_filename, sanitize_name};
use crate::web::WebAcquisitionClient;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// 实际产出备份的采集方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMethod {
    Ssh,
    Web,
}

impl AcquisitionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionMethod::Ssh => "ssh",
            AcquisitionMethod::Web => "web",
        }
    }
}

impl std::fmt::Display for AcquisitionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次备份的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub success: bool,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<AcquisitionMethod>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 单项连通性检查结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub success: bool,
    pub message: String,
}

impl CheckResult {
    fn from_result(result: Result<String>) -> Self {
        match result {
            Ok(message) => Self {
                success: true,
                message,
            },
            Err(e) => Self {
                success: false,
                message: e.user_message(),
            },
        }
    }
}

/// 连接测试报告，混合模式下两项都成功才算成功
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub host: String,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web: Option<CheckResult>,
    pub success: bool,
}

/// 一次备份所需的全部输入
struct BackupPlan {
    connection: ConnectionConfig,
    store: BackupStore,
    max_backups: usize,
    prefix: String,
    description: Option<String>,
}

impl BackupPlan {
    fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            connection: ConnectionConfig::from_app_config(config)?,
            store: BackupStore::new(config.get_backup_dir()),
            max_backups: config.backup.max_backups,
            prefix: backup::BACKUP_PREFIX.to_string(),
            description: None,
        })
    }
}

struct Completed {
    stored: StoredArchive,
    method: AcquisitionMethod,
}

/// 备份编排器
pub struct BackupOrchestrator {
    ledger: Arc<JobLedger>,
    hooks: Arc<dyn BackupHooks>,
    run_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl BackupOrchestrator {
    pub fn new(ledger: Arc<JobLedger>) -> Self {
        Self {
            ledger,
            hooks: Arc::new(LoggingHooks),
            run_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn BackupHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// 使用外部的关闭信号，取消时中止进行中的采集
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 是否有备份正在进行
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// 按应用配置执行一次备份，已有备份进行时等待其结束
    pub async fn run_backup(&self, config: &AppConfig) -> BackupOutcome {
        let _guard = self.run_lock.lock().await;
        self.execute(BackupPlan::from_config(config)).await
    }

    /// 使用临时指定的连接与存储执行一次备份
    ///
    /// `name` 清理后替换文件名前缀，`description` 附加到任务消息。
    pub async fn run_backup_with_connection(
        &self,
        connection: &ConnectionConfig,
        storage: &BackupSettings,
        name: Option<&str>,
        description: Option<&str>,
    ) -> BackupOutcome {
        let plan = BackupPlan {
            connection: connection.clone(),
            store: BackupStore::new(&storage.destination_path),
            max_backups: storage.max_backups,
            prefix: name
                .and_then(sanitize_name)
                .unwrap_or_else(|| backup::BACKUP_PREFIX.to_string()),
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        };

        let _guard = self.run_lock.lock().await;
        self.execute(Ok(plan)).await
    }

    /// 定时触发：每次重新读取配置文件；已有备份进行时跳过本次，返回 None
    ///
    /// `backup_dir` 不为空时覆盖配置中的备份目录。
    pub async fn run_scheduled(
        &self,
        config_path: &Path,
        backup_dir: Option<&Path>,
    ) -> Option<BackupOutcome> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("上一次备份仍在进行，跳过本次定时备份");
            return None;
        };

        let plan = AppConfig::load_from_file(config_path).and_then(|mut config| {
            if let Some(dir) = backup_dir {
                config.backup.destination_path = dir.to_path_buf();
            }
            BackupPlan::from_config(&config)
        });
        Some(self.execute(plan).await)
    }

    #[instrument(skip_all)]
    async fn execute(&self, plan: Result<BackupPlan>) -> BackupOutcome {
        let job_id = next_job_id();
        let started = Instant::now();
        let host = plan
            .as_ref()
            .map(|p| p.connection.display_host())
            .unwrap_or_default();
        let description = plan.as_ref().ok().and_then(|p| p.description.clone());

        self.record(&job_id, JobStatus::Running, "Backup started", JobExtra::default())
            .await;

        let result = match plan {
            Ok(plan) => {
                info!(
                    job_id = %job_id,
                    host = %host,
                    strategy = %plan.connection.strategy(),
                    "开始备份"
                );
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => Err(VaultError::Cancelled),
                    result = self.perform(&plan) => result,
                }
            }
            Err(e) => Err(e),
        };

        let duration_seconds = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;

        match result {
            Ok(Completed { stored, method }) => {
                let message = match &description {
                    Some(description) => format!("Backup completed successfully: {description}"),
                    None => "Backup completed successfully".to_string(),
                };
                let extra = JobExtra {
                    filename: Some(stored.filename.clone()),
                    size: Some(stored.size),
                    method: Some(method.to_string()),
                    duration_seconds: Some(duration_seconds),
                };
                self.record(&job_id, JobStatus::Success, message, extra).await;

                let event = BackupSucceeded {
                    filename: stored.filename.clone(),
                    size: stored.size,
                    duration_seconds,
                    host,
                };
                self.notify(|hooks| hooks.on_success(&event));

                BackupOutcome {
                    success: true,
                    job_id,
                    filename: Some(stored.filename),
                    size: Some(stored.size),
                    method: Some(method),
                    duration_seconds,
                    error: None,
                }
            }
            Err(e) => {
                let message = e.user_message();
                error!(job_id = %job_id, host = %host, "备份失败: {}", message);

                let extra = JobExtra {
                    duration_seconds: Some(duration_seconds),
                    ..Default::default()
                };
                self.record(&job_id, JobStatus::Error, message.clone(), extra)
                    .await;

                let event = BackupFailed {
                    error: message.clone(),
                    host,
                };
                self.notify(|hooks| hooks.on_failure(&event));

                BackupOutcome {
                    success: false,
                    job_id,
                    filename: None,
                    size: None,
                    method: None,
                    duration_seconds,
                    error: Some(message),
                }
            }
        }
    }

    async fn perform(&self, plan: &BackupPlan) -> Result<Completed> {
        plan.store.ensure_dir().await?;
        let filename = archive_filename(&plan.prefix, Utc::now());
        let connection = &plan.connection;

        let completed = match connection.strategy() {
            Strategy::Web => Completed {
                stored: acquire_via_web(connection, &plan.store, &filename).await?,
                method: AcquisitionMethod::Web,
            },
            Strategy::Ssh => Completed {
                stored: self.acquire_via_ssh(connection, &plan.store, &filename).await?,
                method: AcquisitionMethod::Ssh,
            },
            Strategy::Hybrid => {
                let (stored, method) = with_ssh_fallback(
                    acquire_via_web(connection, &plan.store, &filename),
                    || self.acquire_via_ssh(connection, &plan.store, &filename),
                )
                .await?;
                Completed { stored, method }
            }
        };

        info!(
            filename = %completed.stored.filename,
            size = completed.stored.size,
            method = %completed.method,
            "备份文件已保存"
        );

        let retention = RetentionManager::new(plan.max_backups);
        let dir = plan.store.dir().to_path_buf();
        match tokio::task::spawn_blocking(move || retention.enforce(&dir)).await {
            Ok(Ok(report)) if !report.removed.is_empty() => {
                info!(removed = report.removed.len(), kept = report.kept, "已清理旧备份");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("清理旧备份失败: {}", e),
            Err(e) => warn!("清理旧备份失败: {}", e),
        }

        Ok(completed)
    }

    async fn acquire_via_ssh(
        &self,
        connection: &ConnectionConfig,
        store: &BackupStore,
        filename: &str,
    ) -> Result<StoredArchive> {
        let target = connection
            .ssh()
            .ok_or_else(|| VaultError::invalid_config("ssh settings are missing"))?;
        let path = store.path_for(filename);
        let archive = ShellAcquisitionClient::new(target)
            .with_cancellation(self.shutdown.clone())
            .acquire(&path)
            .await?;
        store.stat_archive(archive.local_path).await
    }

    /// 测试连接，不写任务记录
    pub async fn test_connection(&self, connection: &ConnectionConfig) -> ConnectionReport {
        let ssh = match connection.ssh() {
            Some(target) => {
                let result = ShellAcquisitionClient::new(target)
                    .test_connection()
                    .await
                    .map(|path| format!("SSH connection successful, pihole-FTL found at {path}"));
                Some(CheckResult::from_result(result))
            }
            None => None,
        };

        let web = match connection.web() {
            Some(target) => Some(CheckResult::from_result(test_web(target).await)),
            None => None,
        };

        let success = [&ssh, &web]
            .into_iter()
            .flatten()
            .all(|check| check.success);

        ConnectionReport {
            host: connection.host().to_string(),
            strategy: connection.strategy(),
            ssh,
            web,
            success,
        }
    }

    async fn record(
        &self,
        job_id: &str,
        status: JobStatus,
        message: impl Into<String>,
        extra: JobExtra,
    ) {
        if let Err(e) = self.ledger.upsert(job_id, status, message, extra).await {
            warn!(job_id = %job_id, "写入任务记录失败: {}", e);
        }
    }

    fn notify(&self, call: impl FnOnce(&dyn BackupHooks)) {
        let hooks = self.hooks.as_ref();
        if catch_unwind(AssertUnwindSafe(|| call(hooks))).is_err() {
            warn!("备份通知钩子执行时发生 panic");
        }
    }
}

async fn acquire_via_web(
    connection: &ConnectionConfig,
    store: &BackupStore,
    filename: &str,
) -> Result<StoredArchive> {
    let target = connection
        .web()
        .ok_or_else(|| VaultError::invalid_config("web settings are missing"))?;
    let client = WebAcquisitionClient::new(target)?;
    let archive = client.acquire().await?;
    store.save(filename, &archive.bytes).await
}

/// 混合模式：先走 Web，失败后改用 SSH
///
/// 本地持久化失败直接返回，换成 SSH 也无法写入同一目录。
async fn with_ssh_fallback<T, W, S>(
    web: W,
    ssh: impl FnOnce() -> S,
) -> Result<(T, AcquisitionMethod)>
where
    W: Future<Output = Result<T>>,
    S: Future<Output = Result<T>>,
{
    let web_error = match web.await {
        Ok(stored) => return Ok((stored, AcquisitionMethod::Web)),
        Err(e @ VaultError::Persistence(_)) => return Err(e),
        Err(e) => e,
    };

    warn!("Web 备份失败，改用 SSH: {}", web_error.user_message());
    let stored = ssh().await.map_err(|ssh_error| {
        VaultError::connection(format!(
            "web backup failed ({}); ssh fallback failed ({})",
            web_error.user_message(),
            ssh_error.user_message()
        ))
    })?;
    Ok((stored, AcquisitionMethod::Ssh))
}

async fn test_web(target: crate::connection::WebTarget<'_>) -> Result<String> {
    let client = WebAcquisitionClient::new(target)?;
    client.test_web_connection().await?;
    let session = client.authenticate().await?;
    Ok(format!(
        "Web connection successful, authenticated via {}",
        session.method().as_str()
    ))
}

/// 定时任务：每次触发时按配置文件执行一次备份
pub struct ConfigBackedTask {
    orchestrator: Arc<BackupOrchestrator>,
    config_path: PathBuf,
    backup_dir: Option<PathBuf>,
}

impl ConfigBackedTask {
    pub fn new(orchestrator: Arc<BackupOrchestrator>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            config_path: config_path.into(),
            backup_dir: None,
        }
    }

    pub fn with_backup_dir(mut self, backup_dir: Option<PathBuf>) -> Self {
        self.backup_dir = backup_dir;
        self
    }
}

impl BackupTask for ConfigBackedTask {
    fn run(&self) -> BoxFuture<'_, Option<BackupOutcome>> {
        Box::pin(
            self.orchestrator
                .run_scheduled(&self.config_path, self.backup_dir.as_deref()),
        )
    }
}
