use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vault_core::Result;
use vault_core::config::AppConfig;
use vault_core::constants::data;
use vault_core::jobs::JobLedger;
use vault_core::orchestrator::{BackupOrchestrator, ConfigBackedTask};
use vault_core::scheduler::{Scheduler, SchedulerState};
use vault_core::storage::BackupStore;

use crate::cli::Commands;
use crate::commands;

pub struct CliApp {
    pub config: AppConfig,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub backup_dir_override: Option<PathBuf>,
    pub ledger: Arc<JobLedger>,
    pub orchestrator: Arc<BackupOrchestrator>,
    pub scheduler: Scheduler,
    pub store: BackupStore,
    pub shutdown: CancellationToken,
}

impl CliApp {
    /// 从数据目录加载配置并初始化各组件
    ///
    /// `backup_dir` 覆盖配置文件中的备份目录，不会写回配置文件。
    pub fn new(data_dir: &Path, backup_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = AppConfig::locate_config_file(data_dir)
            .unwrap_or_else(|| data_dir.join(data::CONFIG_FILE_NAME));
        let mut config = AppConfig::load_from_file(&config_path)?;
        if let Some(dir) = &backup_dir {
            config.backup.destination_path = dir.clone();
        }
        debug!("使用配置文件: {}", config_path.display());

        let shutdown = CancellationToken::new();
        let ledger = Arc::new(JobLedger::new(data_dir.join(data::JOBS_FILE_NAME)));
        let orchestrator = Arc::new(
            BackupOrchestrator::new(ledger.clone()).with_shutdown(shutdown.child_token()),
        );
        let task = ConfigBackedTask::new(orchestrator.clone(), config_path.clone())
            .with_backup_dir(backup_dir.clone());
        let scheduler = Scheduler::new(Arc::new(task)).with_shutdown(shutdown.child_token());
        let store = BackupStore::new(config.get_backup_dir());

        Ok(Self {
            config,
            config_path,
            data_dir: data_dir.to_path_buf(),
            backup_dir_override: backup_dir,
            ledger,
            orchestrator,
            scheduler,
            store,
            shutdown,
        })
    }

    /// 保存配置并按新的定时设置重建触发器
    pub async fn save_config(&mut self) -> Result<SchedulerState> {
        // 命令行覆盖的备份目录不写入配置文件
        let mut persisted = self.config.clone();
        if self.backup_dir_override.is_some() {
            if let Ok(on_disk) = AppConfig::load_from_file(&self.config_path) {
                persisted.backup.destination_path = on_disk.backup.destination_path;
            }
        }
        persisted.save_to_file(&self.config_path)?;
        self.config.created_at = persisted.created_at;
        self.config.updated_at = persisted.updated_at;

        self.scheduler.initialize(&self.config.schedule).await
    }

    /// 重新读取配置文件，返回配置是否有变化
    pub fn reload_config(&mut self) -> Result<bool> {
        let mut config = AppConfig::load_from_file(&self.config_path)?;
        if let Some(dir) = &self.backup_dir_override {
            config.backup.destination_path = dir.clone();
        }
        let changed = config.updated_at != self.config.updated_at
            || config.schedule != self.config.schedule;
        if config.get_backup_dir() != self.store.dir() {
            warn!(
                "备份目录已变更: {} -> {}",
                self.store.dir().display(),
                config.get_backup_dir().display()
            );
            self.store = BackupStore::new(config.get_backup_dir());
        }
        self.config = config;
        Ok(changed)
    }

    /// 运行应用命令
    pub async fn run_command(&mut self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Init { .. } => Ok(()), // 已经在 main.rs 中处理
            Commands::Run {
                name,
                description,
                json,
            } => commands::run_backup(self, name.as_deref(), description.as_deref(), json).await,
            Commands::Daemon => commands::run_daemon(self).await,
            Commands::TestConnection => commands::run_test_connection(self).await,
            Commands::Status { remote } => commands::run_status(self, remote).await,
            Commands::ListBackups => commands::run_list_backups(self).await,
            Commands::BackupStats => commands::run_backup_stats(self).await,
            Commands::DeleteBackup { filename } => commands::run_delete_backup(self, &filename).await,
            Commands::VerifyBackup { filename } => commands::run_verify_backup(self, &filename).await,
            Commands::Jobs(jobs_cmd) => commands::handle_jobs_command(self, jobs_cmd).await,
            Commands::Schedule(schedule_cmd) => {
                commands::handle_schedule_command(self, schedule_cmd).await
            }
        }
    }
}
