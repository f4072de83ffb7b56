use crate::constants::{backup, cron, data, ssh, web};
use crate::error::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 应用配置结构
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    // 标量字段需排在表结构之前，TOML 序列化要求如此
    #[serde(default)]
    pub ssh_key_deployed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pihole: Option<PiholeSettings>,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// 备份目标的连接方式
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Ssh,
    Web,
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Ssh => "ssh",
            Strategy::Web => "web",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pi-hole 连接配置（持久化形态，字段较松散，使用前需转换为 [`crate::connection::ConnectionConfig`]）
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PiholeSettings {
    pub host: String,
    #[serde(default)]
    pub connection_method: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_password: Option<String>,
}

fn default_ssh_port() -> u16 {
    ssh::DEFAULT_PORT
}

fn default_web_port() -> u16 {
    web::DEFAULT_HTTP_PORT
}

/// 备份存储配置
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BackupSettings {
    #[serde(default = "backup::get_default_storage_dir")]
    pub destination_path: PathBuf,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_max_backups() -> usize {
    backup::DEFAULT_MAX_BACKUPS
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            destination_path: backup::get_default_storage_dir(),
            max_backups: backup::DEFAULT_MAX_BACKUPS,
        }
    }
}

/// 定时备份配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cron_expression: Some(cron::DEFAULT_BACKUP_CRON.to_string()),
            timezone: Some(cron::DEFAULT_TIMEZONE.to_string()),
        }
    }
}

impl AppConfig {
    /// 在数据目录中查找配置文件
    /// 按优先级查找：config.json -> config.toml
    pub fn locate_config_file(data_dir: &Path) -> Option<PathBuf> {
        [data::CONFIG_FILE_NAME, "config.toml"]
            .iter()
            .map(|name| data_dir.join(name))
            .find(|path| path.exists())
    }

    /// 在数据目录中查找并加载配置文件
    pub fn find_and_load_config(data_dir: &Path) -> Result<Self> {
        match Self::locate_config_file(data_dir) {
            Some(path) => {
                tracing::debug!("找到配置文件: {}", path.display());
                Self::load_from_file(&path)
            }
            None => Err(VaultError::ConfigNotFound(
                data_dir.join(data::CONFIG_FILE_NAME).display().to_string(),
            )),
        }
    }

    /// 从指定文件加载配置，按扩展名选择 JSON 或 TOML
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VaultError::ConfigNotFound(path.display().to_string()));
        }

        let content = fs::read_to_string(path)?;
        let config = if is_toml(path) {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        Ok(config)
    }

    /// 保存配置到文件，刷新 `updatedAt`（首次保存时同时写入 `createdAt`）
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let now = Utc::now();
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)?
        } else {
            serde_json::to_string_pretty(self)?
        };
        fs::write(path, content)?;
        Ok(())
    }

    /// 确保备份目录存在
    pub fn ensure_backup_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.backup.destination_path)?;
        Ok(())
    }

    /// 获取备份目录路径
    pub fn get_backup_dir(&self) -> &Path {
        &self.backup.destination_path
    }

    /// 是否已配置备份目标
    pub fn is_configured(&self) -> bool {
        self.pihole
            .as_ref()
            .is_some_and(|p| !p.host.trim().is_empty())
    }

    /// 已部署且可用的 SSH 私钥路径
    pub fn deployed_key_path(&self) -> Option<&Path> {
        if self.ssh_key_deployed {
            self.ssh_key_path.as_deref()
        } else {
            None
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_original_json_shape() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "pihole": {"host": "10.0.0.5", "connectionMethod": "web", "webPassword": "secret"},
                "backup": {"destinationPath": "/app/backups", "maxBackups": 5},
                "schedule": {"enabled": true, "cronExpression": "0 3 * * *", "timezone": "GMT+3"},
                "message": "Default configuration"
            }"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        let pihole = config.pihole.as_ref().unwrap();
        assert_eq!(pihole.connection_method, Strategy::Web);
        assert_eq!(pihole.port, 22);
        assert_eq!(pihole.web_port, 80);
        assert_eq!(config.backup.max_backups, 5);
        assert_eq!(config.schedule.timezone.as_deref(), Some("GMT+3"));
        assert!(config.is_configured());
        assert!(config.deployed_key_path().is_none());
    }

    #[test]
    fn test_save_and_reload_toml() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.backup.max_backups = 3;
        config.save_to_file(&path).unwrap();
        assert!(config.created_at.is_some());

        let loaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.backup.max_backups, 3);
        assert_eq!(loaded.schedule, ScheduleConfig::default());
        assert!(!loaded.is_configured());
    }

    #[test]
    fn test_missing_config() {
        let temp_dir = tempdir().unwrap();
        let err = AppConfig::find_and_load_config(temp_dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::ConfigNotFound(_)));
    }
}
