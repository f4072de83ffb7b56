use crate::app::CliApp;
use crate::cli::JobsCommand;
use crate::utils::format_size;
use anyhow::Result;
use tracing::info;

pub async fn handle_jobs_command(app: &CliApp, cmd: JobsCommand) -> Result<()> {
    match cmd {
        JobsCommand::List { limit } => list_jobs(app, limit).await,
        JobsCommand::Stats => show_stats(app).await,
        JobsCommand::Clear => {
            app.ledger.clear().await?;
            info!("🧹 任务记录已清空");
            Ok(())
        }
    }
}

async fn list_jobs(app: &CliApp, limit: Option<usize>) -> Result<()> {
    let records = app.ledger.list_recent(limit).await?;
    if records.is_empty() {
        info!("📝 暂无任务记录");
        return Ok(());
    }

    for record in &records {
        let mut line = format!(
            "{} {:<8} {:<22} {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.status,
            record.id,
            record.message
        );
        if let Some(filename) = &record.extra.filename {
            line.push_str(&format!(" | {filename}"));
        }
        if let Some(size) = record.extra.size {
            line.push_str(&format!(" ({})", format_size(size)));
        }
        if let Some(method) = &record.extra.method {
            line.push_str(&format!(" via {method}"));
        }
        info!("{}", line);
    }
    Ok(())
}

async fn show_stats(app: &CliApp) -> Result<()> {
    let stats = app.ledger.stats().await?;
    info!("📊 任务统计");
    info!("   总数: {}", stats.total);
    info!("   成功: {}", stats.successful);
    info!("   失败: {}", stats.failed);
    info!("   进行中: {}", stats.running);
    info!("   成功率: {}%", stats.success_rate);
    if let Some(last_run) = stats.last_run {
        info!("   最近运行: {}", last_run.to_rfc3339());
    }
    Ok(())
}
