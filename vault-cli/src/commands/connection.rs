use crate::app::CliApp;
use crate::utils::format_size;
use anyhow::{Result, bail};
use tracing::{error, info, warn};
use vault_core::connection::ConnectionConfig;
use vault_core::orchestrator::CheckResult;
use vault_core::scheduler;
use vault_core::ssh::ShellAcquisitionClient;

fn show_check(label: &str, check: &Option<CheckResult>) {
    match check {
        Some(check) if check.success => info!("   ✅ {}: {}", label, check.message),
        Some(check) => error!("   ❌ {}: {}", label, check.message),
        None => {}
    }
}

/// 按配置的连接方式测试连接
pub async fn run_test_connection(app: &CliApp) -> Result<()> {
    let connection = ConnectionConfig::from_app_config(&app.config)?;
    info!("🔌 测试连接: {} ({})", connection.host(), connection.strategy());

    let report = app.orchestrator.test_connection(&connection).await;
    show_check("SSH", &report.ssh);
    show_check("Web", &report.web);

    if !report.success {
        bail!("connection test failed for {}", report.host);
    }
    info!("✅ 连接正常");
    Ok(())
}

/// 显示配置、定时任务、任务记录与备份目录的状态
pub async fn run_status(app: &CliApp, remote: bool) -> Result<()> {
    info!("🛡️  Pi-hole Vault 状态");
    info!("==================");
    info!("配置文件: {}", app.config_path.display());

    match &app.config.pihole {
        Some(pihole) if app.config.is_configured() => {
            info!("备份目标: {} ({})", pihole.host, pihole.connection_method);
        }
        _ => warn!("⚠️  尚未配置 Pi-hole 连接"),
    }
    info!(
        "备份目录: {} (保留 {} 个)",
        app.store.dir().display(),
        app.config.backup.max_backups
    );

    info!("⏰ 定时备份");
    let schedule = &app.config.schedule;
    if schedule.enabled {
        info!(
            "   表达式: {} ({})",
            schedule.cron_expression.as_deref().unwrap_or("-"),
            schedule.timezone.as_deref().unwrap_or("UTC")
        );
        match scheduler::next_runs(schedule, 1) {
            Ok(runs) => {
                if let Some(next) = runs.first() {
                    info!("   下次运行: {}", next.to_rfc3339());
                }
            }
            Err(e) => warn!("   ⚠️  定时配置无效: {}", e),
        }
    } else {
        info!("   未启用");
    }

    info!("📝 任务记录");
    let stats = app.ledger.stats().await?;
    info!(
        "   共 {} 次，成功 {}，失败 {}，进行中 {}，成功率 {}%",
        stats.total, stats.successful, stats.failed, stats.running, stats.success_rate
    );
    if let Some(last) = app.ledger.list_recent(Some(1)).await?.first() {
        info!(
            "   最近一次: {} [{}] {}",
            last.timestamp.to_rfc3339(),
            last.status,
            last.message
        );
    }

    let backups = app.store.stats().await?;
    info!(
        "📦 本地备份: {} 个，共 {}",
        backups.count,
        format_size(backups.total_size)
    );

    if remote {
        show_remote_status(app).await?;
    }
    Ok(())
}

async fn show_remote_status(app: &CliApp) -> Result<()> {
    let connection = ConnectionConfig::from_app_config(&app.config)?;
    let Some(target) = connection.ssh() else {
        warn!("⚠️  当前连接方式不包含 SSH，无法查询远程状态");
        return Ok(());
    };

    info!("🌐 远程 Pi-hole 状态");
    let status = ShellAcquisitionClient::new(target).remote_status().await?;
    for line in status.status.lines().filter(|l| !l.trim().is_empty()) {
        info!("   {}", line.trim());
    }
    for line in status.version.lines().filter(|l| !l.trim().is_empty()) {
        info!("   {}", line.trim());
    }
    Ok(())
}
