//! 定时备份调度
//!
//! 只有一个名为 `backup` 的触发器。配置中的 cron 表达式为标准 5 段格式，
//! 时区可以是 IANA 名称，也可以是用户输入的 `GMT+3` 这类偏移。

use crate::config::ScheduleConfig;
use crate::constants::cron as cron_consts;
use crate::error::{Result, VaultError};
use crate::orchestrator::BackupOutcome;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures::future::BoxFuture;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 每次触发时执行的任务
///
/// 返回 None 表示本次被跳过（例如上一次备份仍在进行）。
pub trait BackupTask: Send + Sync + 'static {
    fn run(&self) -> BoxFuture<'_, Option<BackupOutcome>>;
}

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Uninitialized,
    Scheduled,
    Stopped,
}

impl SchedulerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Uninitialized => "uninitialized",
            SchedulerState::Scheduled => "scheduled",
            SchedulerState::Stopped => "stopped",
        }
    }
}

/// 调度器当前信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub task: Option<String>,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub next_run: Option<String>,
}

/// 把 `GMT+3` 这类偏移转换为 POSIX 时区名
///
/// `Etc/GMT` 时区的符号与直觉相反：`GMT+3` 对应 `Etc/GMT-3`。
/// 无法识别的输入一律视为 UTC。
pub fn convert_gmt_offset_to_timezone(input: &str) -> String {
    const UTC: &str = "UTC";

    let Some(offset) = input.trim().strip_prefix("GMT") else {
        return UTC.to_string();
    };
    let offset = offset.trim();
    if offset.is_empty() {
        return UTC.to_string();
    }

    match leading_integer(offset) {
        Some(0) | None => UTC.to_string(),
        Some(hours) => {
            let negated = -hours;
            let sign = if negated < 0 { '-' } else { '+' };
            format!("Etc/GMT{sign}{}", negated.abs())
        }
    }
}

/// 取开头的带符号整数，忽略其后的内容：`+05:30` 得到 5
fn leading_integer(input: &str) -> Option<i32> {
    let (negative, rest) = match input.as_bytes().first()? {
        b'-' => (true, &input[1..]),
        b'+' => (false, &input[1..]),
        _ => (false, input),
    };
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let hours: i32 = rest[..end].parse().ok()?;
    Some(if negative { -hours } else { hours })
}

/// 解析配置中的时区：`GMT` 开头的走偏移转换，其余按 IANA 名称解析
pub fn resolve_timezone(timezone: Option<&str>) -> Result<Tz> {
    let raw = timezone
        .map(str::trim)
        .filter(|tz| !tz.is_empty())
        .unwrap_or(cron_consts::DEFAULT_TIMEZONE);

    let name = if raw.starts_with("GMT") {
        convert_gmt_offset_to_timezone(raw)
    } else {
        raw.to_string()
    };

    Tz::from_str(&name).map_err(|_| VaultError::schedule(format!("unknown timezone: {raw}")))
}

/// 解析 cron 表达式
///
/// 5 段表达式补上秒字段 `0`；6 段表达式视为已带秒字段。
/// 星期字段按标准 cron 的 0-7（0 与 7 都是周日）解释。
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let mut fields: Vec<String> = expression
        .split_whitespace()
        .map(str::to_string)
        .collect();
    match fields.len() {
        cron_consts::CRON_FIELDS_COUNT => fields.insert(0, "0".to_string()),
        cron_consts::CRON_FIELDS_WITH_SECONDS => {}
        n => {
            return Err(VaultError::schedule(format!(
                "invalid cron expression '{expression}': expected 5 or 6 fields, got {n}"
            )));
        }
    }

    let invalid = |e: &dyn std::fmt::Display| {
        VaultError::schedule(format!("invalid cron expression '{expression}': {e}"))
    };
    fields[5] = normalize_day_of_week(&fields[5]).map_err(|e| invalid(&e))?;

    Schedule::from_str(&fields.join(" ")).map_err(|e| invalid(&e))
}

/// 标准 cron 的星期（周日为 0 或 7）转换为 1-7（周日为 1）
fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    let shift = |value: u32| -> std::result::Result<u32, String> {
        match value {
            0 | 7 => Ok(1),
            1..=6 => Ok(value + 1),
            _ => Err(format!("day of week out of range: {value}")),
        }
    };

    let mut parts = Vec::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (part, None),
        };

        let numeric = |s: &str| s.parse::<u32>().ok();
        let converted = match base.split_once('-') {
            Some((start, end)) => match (numeric(start), numeric(end)) {
                (Some(start), Some(end)) if end == 7 && start > 0 => {
                    // 以周日结尾的区间展开为列表，避免出现 "6-1" 这样的逆序区间
                    let step = step
                        .map(|s| s.parse::<usize>().map_err(|_| format!("invalid step: {s}")))
                        .transpose()?
                        .unwrap_or(1);
                    let mut days = (start..=end)
                        .step_by(step.max(1))
                        .map(shift)
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    days.sort_unstable();
                    days.dedup();
                    parts.push(
                        days.iter()
                            .map(u32::to_string)
                            .collect::<Vec<_>>()
                            .join(","),
                    );
                    continue;
                }
                (Some(start), Some(end)) => {
                    let end = if end == 7 { 7 } else { shift(end)? };
                    format!("{}-{}", shift(start)?, end)
                }
                _ => base.to_string(),
            },
            None => match numeric(base) {
                Some(value) => shift(value)?.to_string(),
                None => base.to_string(),
            },
        };

        parts.push(match step {
            Some(step) => format!("{converted}/{step}"),
            None => converted,
        });
    }

    Ok(parts.join(","))
}

/// 计算配置的后续 n 次运行时间
pub fn next_runs(config: &ScheduleConfig, count: usize) -> Result<Vec<DateTime<Tz>>> {
    let expression = config
        .cron_expression
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| VaultError::schedule("cron expression is not configured"))?;
    let schedule = parse_cron(expression)?;
    let timezone = resolve_timezone(config.timezone.as_deref())?;
    Ok(schedule.upcoming(timezone).take(count).collect())
}

/// 校验 cron 表达式与时区，返回后续 5 次运行时间
pub fn validate(expression: &str, timezone: Option<&str>) -> Result<Vec<DateTime<Tz>>> {
    let config = ScheduleConfig {
        enabled: true,
        cron_expression: Some(expression.to_string()),
        timezone: timezone.map(str::to_string),
    };
    next_runs(&config, cron_consts::VALIDATE_PREVIEW_RUNS)
}

struct Trigger {
    name: &'static str,
    schedule: Schedule,
    timezone: Tz,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Trigger {
    fn destroy(self) {
        self.cancel.cancel();
        self.handle.abort();
        debug!(task = self.name, "已销毁定时触发器");
    }
}

struct SchedulerInner {
    state: SchedulerState,
    trigger: Option<Trigger>,
    last_config: Option<ScheduleConfig>,
}

/// 定时备份调度器
pub struct Scheduler {
    task: Arc<dyn BackupTask>,
    inner: Mutex<SchedulerInner>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(task: Arc<dyn BackupTask>) -> Self {
        Self {
            task,
            inner: Mutex::new(SchedulerInner {
                state: SchedulerState::Uninitialized,
                trigger: None,
                last_config: None,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// 关联外部关闭信号，信号触发时触发器随之退出
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// 按配置重建触发器
    ///
    /// 未启用或缺少表达式时保持停止；表达式或时区无效时记录日志、保持停止并返回错误。
    pub async fn initialize(&self, config: &ScheduleConfig) -> Result<SchedulerState> {
        let mut inner = self.inner.lock().await;
        if let Some(trigger) = inner.trigger.take() {
            trigger.destroy();
        }
        inner.last_config = Some(config.clone());
        inner.state = SchedulerState::Stopped;

        let expression = config
            .cron_expression
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());
        let Some(expression) = expression.filter(|_| config.enabled) else {
            info!("定时备份未启用");
            return Ok(SchedulerState::Stopped);
        };

        let schedule = parse_cron(expression).inspect_err(|e| {
            error!("cron 表达式无效，定时备份保持停止: {}", e);
        })?;
        let timezone = resolve_timezone(config.timezone.as_deref()).inspect_err(|e| {
            error!("时区无效，定时备份保持停止: {}", e);
        })?;

        let paused = Arc::new(AtomicBool::new(false));
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(trigger_loop(
            self.task.clone(),
            schedule.clone(),
            timezone,
            paused.clone(),
            cancel.clone(),
        ));

        info!(
            cron = %expression,
            timezone = %timezone.name(),
            next_run = ?schedule.upcoming(timezone).next(),
            "定时备份已启动"
        );

        inner.trigger = Some(Trigger {
            name: cron_consts::BACKUP_TASK_NAME,
            schedule,
            timezone,
            paused,
            cancel,
            handle,
        });
        inner.state = SchedulerState::Scheduled;
        Ok(SchedulerState::Scheduled)
    }

    /// 暂停触发器（不销毁）
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(trigger) = &inner.trigger {
            trigger.paused.store(true, Ordering::SeqCst);
            info!(task = trigger.name, "定时备份已暂停");
        }
        if inner.state != SchedulerState::Uninitialized || inner.trigger.is_some() {
            inner.state = SchedulerState::Stopped;
        }
    }

    /// 恢复触发器；尚无触发器时用上一次的配置重新初始化
    pub async fn start(&self) -> Result<SchedulerState> {
        let last_config = {
            let mut inner = self.inner.lock().await;
            if let Some(trigger) = &inner.trigger {
                trigger.paused.store(false, Ordering::SeqCst);
                info!(task = trigger.name, "定时备份已恢复");
                inner.state = SchedulerState::Scheduled;
                return Ok(SchedulerState::Scheduled);
            }
            inner.last_config.clone()
        };

        match last_config {
            Some(config) => self.initialize(&config).await,
            None => Err(VaultError::schedule("scheduler has not been initialized")),
        }
    }

    /// 销毁触发器
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(trigger) = inner.trigger.take() {
            trigger.destroy();
        }
        if inner.state != SchedulerState::Uninitialized {
            inner.state = SchedulerState::Stopped;
        }
    }

    pub async fn state(&self) -> SchedulerState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> SchedulerStatus {
        let inner = self.inner.lock().await;
        let config = inner.last_config.as_ref();
        let next_run = match (&inner.trigger, inner.state) {
            (Some(trigger), SchedulerState::Scheduled) => trigger
                .schedule
                .upcoming(trigger.timezone)
                .next()
                .map(|t| t.to_rfc3339()),
            _ => None,
        };

        SchedulerStatus {
            state: inner.state,
            task: inner.trigger.as_ref().map(|t| t.name.to_string()),
            cron_expression: config.and_then(|c| c.cron_expression.clone()),
            timezone: inner
                .trigger
                .as_ref()
                .map(|t| t.timezone.name().to_string()),
            next_run,
        }
    }
}

async fn trigger_loop(
    task: Arc<dyn BackupTask>,
    schedule: Schedule,
    timezone: Tz,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut last_fire: Option<DateTime<Tz>> = None;

    loop {
        let now = Utc::now().with_timezone(&timezone);
        let anchor = last_fire.map_or(now, |last| last.max(now));
        let Some(next) = schedule.after(&anchor).next() else {
            warn!("cron 表达式没有后续运行时间，触发器退出");
            return;
        };

        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        if paused.load(Ordering::SeqCst) {
            debug!(scheduled_at = %next, "定时备份已暂停，跳过本次触发");
            continue;
        }

        let task = task.clone();
        let run = tokio::spawn(async move { task.run().await });
        tokio::spawn(async move {
            match run.await {
                Ok(Some(outcome)) if outcome.success => info!(
                    job_id = %outcome.job_id,
                    filename = ?outcome.filename,
                    "定时备份完成"
                ),
                Ok(Some(outcome)) => warn!(
                    job_id = %outcome.job_id,
                    error = ?outcome.error,
                    "定时备份失败"
                ),
                Ok(None) => {}
                Err(e) => error!("定时备份任务异常退出: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::sync::atomic::AtomicUsize;

    struct CountingTask {
        runs: AtomicUsize,
    }

    impl BackupTask for CountingTask {
        fn run(&self) -> BoxFuture<'_, Option<BackupOutcome>> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                None
            })
        }
    }

    struct PanickingTask;

    impl BackupTask for PanickingTask {
        fn run(&self) -> BoxFuture<'_, Option<BackupOutcome>> {
            Box::pin(async {
                let outcome: Option<BackupOutcome> = None;
                if outcome.is_none() {
                    panic!("task failure");
                }
                outcome
            })
        }
    }

    fn counting() -> Arc<CountingTask> {
        Arc::new(CountingTask {
            runs: AtomicUsize::new(0),
        })
    }

    fn every_second() -> ScheduleConfig {
        ScheduleConfig {
            enabled: true,
            cron_expression: Some("* * * * * *".to_string()),
            timezone: Some("UTC".to_string()),
        }
    }

    #[test]
    fn test_gmt_offset_conversion() {
        assert_eq!(convert_gmt_offset_to_timezone("GMT+3"), "Etc/GMT-3");
        assert_eq!(convert_gmt_offset_to_timezone("GMT-5"), "Etc/GMT+5");
        assert_eq!(convert_gmt_offset_to_timezone("GMT+0"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("GMT-0"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("GMT0"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("GMT"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("GMT+abc"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("GMT+05:30"), "Etc/GMT-5");
        assert_eq!(convert_gmt_offset_to_timezone("GMT+3.5"), "Etc/GMT-3");
        assert_eq!(convert_gmt_offset_to_timezone("GMT-03:00"), "Etc/GMT+3");
        assert_eq!(convert_gmt_offset_to_timezone("GMT10"), "Etc/GMT-10");
        assert_eq!(convert_gmt_offset_to_timezone("GMT+"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("GMT+00:30"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("Europe/Paris"), "UTC");
        assert_eq!(convert_gmt_offset_to_timezone("UTC+3"), "UTC");
    }

    #[test]
    fn test_resolve_timezone() {
        assert_eq!(resolve_timezone(Some("GMT+3")).unwrap(), Tz::Etc__GMTMinus3);
        assert_eq!(resolve_timezone(Some("Europe/Berlin")).unwrap(), Tz::Europe__Berlin);
        assert_eq!(resolve_timezone(None).unwrap(), Tz::UTC);
        assert!(matches!(
            resolve_timezone(Some("Mars/Olympus")),
            Err(VaultError::ScheduleConfig(_))
        ));
    }

    #[test]
    fn test_day_of_week_normalization() {
        assert_eq!(normalize_day_of_week("*").unwrap(), "*");
        assert_eq!(normalize_day_of_week("0").unwrap(), "1");
        assert_eq!(normalize_day_of_week("7").unwrap(), "1");
        assert_eq!(normalize_day_of_week("1-5").unwrap(), "2-6");
        assert_eq!(normalize_day_of_week("0,6").unwrap(), "1,7");
        assert_eq!(normalize_day_of_week("5-7").unwrap(), "1,6,7");
        assert_eq!(normalize_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(normalize_day_of_week("9").is_err());
    }

    #[test]
    fn test_parse_cron() {
        // 周一到周五 03:30
        let schedule = parse_cron("30 3 * * 1-5").unwrap();
        for run in schedule.upcoming(Utc).take(10) {
            assert_eq!((run.hour(), run.minute(), run.second()), (3, 30, 0));
            let weekday = run.format("%a").to_string();
            assert!(weekday != "Sat" && weekday != "Sun", "{weekday}");
        }

        // 周日
        let sunday = parse_cron("0 4 * * 0").unwrap();
        assert_eq!(sunday.upcoming(Utc).next().unwrap().format("%a").to_string(), "Sun");

        assert!(parse_cron("*/15 * * * * *").is_ok());
        assert!(matches!(parse_cron("61 * * * *"), Err(VaultError::ScheduleConfig(_))));
        assert!(parse_cron("* * *").is_err());
    }

    #[test]
    fn test_next_runs_use_converted_zone() {
        let config = ScheduleConfig {
            enabled: true,
            cron_expression: Some("0 3 * * *".to_string()),
            timezone: Some("GMT+3".to_string()),
        };
        let runs = next_runs(&config, 3).unwrap();
        assert_eq!(runs.len(), 3);
        for run in &runs {
            assert_eq!(run.timezone(), Tz::Etc__GMTMinus3);
            assert_eq!(run.hour(), 3);
            assert_eq!(run.with_timezone(&Utc).hour(), 0);
        }

        assert_eq!(validate("0 3 * * *", Some("UTC")).unwrap().len(), 5);
        assert!(validate("not a cron", None).is_err());
    }

    #[tokio::test]
    async fn test_initialize_with_gmt_offset() {
        let scheduler = Scheduler::new(counting());
        assert_eq!(scheduler.state().await, SchedulerState::Uninitialized);

        let config = ScheduleConfig {
            enabled: true,
            cron_expression: Some("0 3 * * *".to_string()),
            timezone: Some("GMT+3".to_string()),
        };
        let state = scheduler.initialize(&config).await.unwrap();
        assert_eq!(state, SchedulerState::Scheduled);

        let status = scheduler.status().await;
        assert_eq!(status.timezone.as_deref(), Some("Etc/GMT-3"));
        assert_eq!(status.task.as_deref(), Some("backup"));
        assert!(status.next_run.unwrap().contains("T03:00:00"));
        scheduler.shutdown().await;
        assert_eq!(scheduler.state().await, SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_disabled_or_invalid_stays_stopped() {
        let scheduler = Scheduler::new(counting());

        let disabled = ScheduleConfig {
            enabled: false,
            ..every_second()
        };
        assert_eq!(
            scheduler.initialize(&disabled).await.unwrap(),
            SchedulerState::Stopped
        );

        let missing = ScheduleConfig {
            cron_expression: None,
            ..every_second()
        };
        assert_eq!(
            scheduler.initialize(&missing).await.unwrap(),
            SchedulerState::Stopped
        );

        let invalid = ScheduleConfig {
            cron_expression: Some("99 * * * *".to_string()),
            ..every_second()
        };
        assert!(scheduler.initialize(&invalid).await.is_err());
        assert_eq!(scheduler.state().await, SchedulerState::Stopped);
        assert!(scheduler.status().await.task.is_none());
    }

    #[tokio::test]
    async fn test_stop_and_start() {
        let task = counting();
        let scheduler = Scheduler::new(task.clone());

        // 未初始化时无法恢复
        assert!(scheduler.start().await.is_err());

        scheduler.initialize(&every_second()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert!(task.runs.load(Ordering::SeqCst) >= 1);

        scheduler.stop().await;
        assert_eq!(scheduler.state().await, SchedulerState::Stopped);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let paused_at = task.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), paused_at);

        assert_eq!(scheduler.start().await.unwrap(), SchedulerState::Scheduled);
        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert!(task.runs.load(Ordering::SeqCst) > paused_at);

        scheduler.shutdown().await;
        // 没有触发器时 start 用上一次的配置重新初始化
        assert_eq!(scheduler.start().await.unwrap(), SchedulerState::Scheduled);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_task_panic_does_not_stop_trigger() {
        let scheduler = Scheduler::new(Arc::new(PanickingTask));
        scheduler.initialize(&every_second()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2300)).await;
        assert_eq!(scheduler.state().await, SchedulerState::Scheduled);
        assert!(scheduler.status().await.next_run.is_some());
        scheduler.shutdown().await;
    }
}
