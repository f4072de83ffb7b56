//! 备份完成后的通知钩子
//!
//! 通知渠道（邮件、聊天 webhook 等）在核心之外实现，这里只定义边界。
//! 钩子在任务记录更新之后调用，钩子内部的失败不影响备份结果。

use serde::Serialize;
use tracing::{info, warn};

/// 备份成功事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSucceeded {
    pub filename: String,
    pub size: u64,
    pub duration_seconds: f64,
    pub host: String,
}

/// 备份失败事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFailed {
    pub error: String,
    pub host: String,
}

/// 备份结果通知
pub trait BackupHooks: Send + Sync {
    fn on_success(&self, event: &BackupSucceeded);

    fn on_failure(&self, event: &BackupFailed);
}

/// 默认实现：只写日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

impl BackupHooks for LoggingHooks {
    fn on_success(&self, event: &BackupSucceeded) {
        info!(
            host = %event.host,
            filename = %event.filename,
            size = event.size,
            duration_seconds = event.duration_seconds,
            "备份成功"
        );
    }

    fn on_failure(&self, event: &BackupFailed) {
        warn!(host = %event.host, error = %event.error, "备份失败");
    }
}
