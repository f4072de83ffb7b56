use crate::app::CliApp;
use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use vault_core::Result as CoreResult;
use vault_core::scheduler::SchedulerState;

/// 配置文件变更检查间隔
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// 退出时等待进行中备份的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

fn config_modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn report_initialize(result: CoreResult<SchedulerState>) {
    match result {
        Ok(SchedulerState::Scheduled) => info!("⏰ 定时备份已就绪"),
        Ok(_) => info!("⏸️  定时备份未启用，等待配置变更"),
        Err(e) => error!("❌ 定时配置无效: {}", e),
    }
}

/// 前台运行调度器，直到收到 Ctrl-C
///
/// 配置文件变化时重新读取并重建触发器。
pub async fn run_daemon(app: &mut CliApp) -> Result<()> {
    info!("🚀 启动 Pi-hole Vault 定时备份");
    info!("   配置文件: {}", app.config_path.display());
    if !app.config.is_configured() {
        warn!("⚠️  尚未配置 Pi-hole 连接，定时备份将记录为失败");
    }

    report_initialize(app.scheduler.initialize(&app.config.schedule).await);

    let mut last_modified = config_modified(&app.config_path);
    let mut ticker = tokio::time::interval(CONFIG_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("🛑 收到退出信号");
                break;
            }
            _ = ticker.tick() => {
                let modified = config_modified(&app.config_path);
                if modified == last_modified {
                    continue;
                }
                last_modified = modified;

                match app.reload_config() {
                    Ok(true) => {
                        info!("🔄 配置文件已变更，重新初始化定时任务");
                        report_initialize(app.scheduler.initialize(&app.config.schedule).await);
                    }
                    Ok(false) => {}
                    Err(e) => warn!("⚠️  重新读取配置失败，保持当前定时任务: {}", e),
                }
            }
        }
    }

    app.scheduler.shutdown().await;
    app.shutdown.cancel();

    // 取消后等待进行中的备份写完任务记录
    let started = Instant::now();
    while app.orchestrator.is_running() && started.elapsed() < SHUTDOWN_GRACE {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if app.orchestrator.is_running() {
        warn!("⚠️  进行中的备份未能在退出前结束");
    }

    info!("👋 已退出");
    Ok(())
}
