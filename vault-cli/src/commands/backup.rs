use crate::app::CliApp;
use crate::utils::format_size;
use anyhow::{Result, bail};
use tracing::{error, info, warn};
use vault_core::connection::ConnectionConfig;

/// 立即执行一次备份
pub async fn run_backup(
    app: &CliApp,
    name: Option<&str>,
    description: Option<&str>,
    json: bool,
) -> Result<()> {
    if !app.config.is_configured() {
        error!("❌ 尚未配置 Pi-hole 连接");
        info!("👉 请先运行 'vault-cli init --host <地址>' 或编辑 {}", app.config_path.display());
        bail!("Pi-hole configuration not found");
    }

    info!("💾 创建 Pi-hole 备份");
    info!("===============");

    // 连接配置无效时走 run_backup，由它记录失败的任务
    let outcome = match ConnectionConfig::from_app_config(&app.config) {
        Ok(connection) if name.is_some() || description.is_some() => {
            app.orchestrator
                .run_backup_with_connection(&connection, &app.config.backup, name, description)
                .await
        }
        _ => app.orchestrator.run_backup(&app.config).await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }

    if let Some(err) = &outcome.error {
        error!("❌ 备份失败: {}", err);
        info!("📝 任务ID: {}", outcome.job_id);
        bail!("backup failed: {err}");
    }

    info!("✅ 备份完成");
    if let Some(filename) = &outcome.filename {
        info!("   文件: {}", app.store.path_for(filename).display());
    }
    if let Some(size) = outcome.size {
        info!("   大小: {}", format_size(size));
    }
    if let Some(method) = outcome.method {
        info!("   方式: {}", method);
    }
    info!("   耗时: {:.2} 秒", outcome.duration_seconds);
    info!("   任务ID: {}", outcome.job_id);
    Ok(())
}

/// 列出所有备份
pub async fn run_list_backups(app: &CliApp) -> Result<()> {
    let backups = app.store.list_backups().await?;
    if backups.is_empty() {
        info!("📦 暂无备份 ({})", app.store.dir().display());
        return Ok(());
    }

    info!("📦 备份列表 ({})", app.store.dir().display());
    info!("{:<50} {:>10} {:<20}", "文件名", "大小", "修改时间");
    info!("{}", "-".repeat(84));
    for backup in &backups {
        info!(
            "{:<50} {:>10} {:<20}",
            backup.filename,
            format_size(backup.size),
            backup.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    info!("共 {} 个备份", backups.len());
    Ok(())
}

/// 备份目录统计
pub async fn run_backup_stats(app: &CliApp) -> Result<()> {
    let stats = app.store.stats().await?;
    info!("📊 备份统计 ({})", app.store.dir().display());
    info!("   数量: {}", stats.count);
    info!("   总大小: {}", format_size(stats.total_size));
    info!("   平均大小: {}", format_size(stats.average_size));
    if let Some(newest) = &stats.newest {
        info!("   最新: {} ({})", newest.filename, newest.modified.to_rfc3339());
    }
    if let Some(oldest) = &stats.oldest {
        info!("   最早: {} ({})", oldest.filename, oldest.modified.to_rfc3339());
    }
    Ok(())
}

pub async fn run_delete_backup(app: &CliApp, filename: &str) -> Result<()> {
    app.store.delete_backup(filename).await?;
    info!("🗑️  已删除: {}", filename);
    Ok(())
}

/// 校验备份能否完整解压
pub async fn run_verify_backup(app: &CliApp, filename: &str) -> Result<()> {
    match app.store.verify_backup(filename).await {
        Ok(check) => {
            info!("✅ {} 校验通过", check.filename);
            info!("   格式: {}", check.format);
            info!("   条目数: {}", check.entries);
            Ok(())
        }
        Err(e) => {
            warn!("⚠️  {} 校验失败", filename);
            Err(e.into())
        }
    }
}
