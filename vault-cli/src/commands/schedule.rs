use crate::app::CliApp;
use crate::cli::ScheduleCommand;
use anyhow::Result;
use chrono::DateTime;
use chrono_tz::Tz;
use tracing::{info, warn};
use vault_core::scheduler::{self, SchedulerState};

pub async fn handle_schedule_command(app: &mut CliApp, cmd: ScheduleCommand) -> Result<()> {
    match cmd {
        ScheduleCommand::Validate {
            expression,
            timezone,
        } => {
            let runs = scheduler::validate(&expression, timezone.as_deref())?;
            info!("✅ cron 表达式有效: {}", expression);
            show_runs(&runs);
            Ok(())
        }
        ScheduleCommand::NextRuns { count } => {
            if !app.config.schedule.enabled {
                warn!("⚠️  定时备份未启用，以下为启用后的运行时间");
            }
            let runs = scheduler::next_runs(&app.config.schedule, count)?;
            show_runs(&runs);
            Ok(())
        }
        ScheduleCommand::Enable => set_enabled(app, true).await,
        ScheduleCommand::Disable => set_enabled(app, false).await,
        ScheduleCommand::Set {
            expression,
            timezone,
        } => {
            // 先校验再写入，避免保存无效配置
            let effective_tz = timezone
                .as_deref()
                .or(app.config.schedule.timezone.as_deref());
            scheduler::validate(&expression, effective_tz)?;

            app.config.schedule.cron_expression = Some(expression.trim().to_string());
            if timezone.is_some() {
                app.config.schedule.timezone = timezone;
            }
            let state = app.save_config().await?;
            info!("✅ 定时配置已保存");
            report_state(app, state);
            Ok(())
        }
    }
}

async fn set_enabled(app: &mut CliApp, enabled: bool) -> Result<()> {
    app.config.schedule.enabled = enabled;
    let state = app.save_config().await?;
    if enabled {
        info!("✅ 定时备份已启用");
    } else {
        info!("⏸️  定时备份已禁用");
    }
    report_state(app, state);
    Ok(())
}

fn report_state(app: &CliApp, state: SchedulerState) {
    info!("   调度器状态: {}", state.as_str());
    if state == SchedulerState::Scheduled {
        if let Ok(runs) = scheduler::next_runs(&app.config.schedule, 1) {
            if let Some(next) = runs.first() {
                info!("   下次运行: {}", next.to_rfc3339());
            }
        }
        info!("💡 定时备份由 'vault-cli daemon' 执行");
    }
}

fn show_runs(runs: &[DateTime<Tz>]) {
    info!("接下来的运行时间:");
    for (i, run) in runs.iter().enumerate() {
        info!("   {}. {}", i + 1, run.format("%Y-%m-%d %H:%M:%S %Z"));
    }
}
