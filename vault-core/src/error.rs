use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("连接失败: {0}")]
    Connection(String),

    #[error("认证失败: {0}")]
    Authentication(String),

    #[error("备份数据校验失败: {0}")]
    ProtocolValidation(String),

    #[error("远程命令执行失败: {0}")]
    Command(String),

    #[error("备份文件写入失败: {0}")]
    Persistence(String),

    #[error("定时配置错误: {0}")]
    ScheduleConfig(String),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("配置文件未找到: {0}")]
    ConfigNotFound(String),

    #[error("备份已取消")]
    Cancelled,

    #[error("配置解析错误: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP 请求错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SSH 错误: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("任务执行错误: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("ZIP 文件错误: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("目录遍历错误: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl From<toml::ser::Error> for VaultError {
    fn from(err: toml::ser::Error) -> Self {
        VaultError::InvalidConfig(err.to_string())
    }
}

impl VaultError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ProtocolValidation(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::ScheduleConfig(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// 面向用户的简短错误信息（写入任务记录与返回结果）
    ///
    /// 采集层错误自带上下文，直接使用内部消息，避免重复的分类前缀。
    pub fn user_message(&self) -> String {
        match self {
            VaultError::Connection(msg)
            | VaultError::Authentication(msg)
            | VaultError::ProtocolValidation(msg)
            | VaultError::Command(msg)
            | VaultError::Persistence(msg)
            | VaultError::ScheduleConfig(msg)
            | VaultError::InvalidConfig(msg) => msg.clone(),
            VaultError::Cancelled => "backup cancelled".to_string(),
            other => other.to_string(),
        }
    }
}
