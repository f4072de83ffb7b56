use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

/// # vault-cli 日志配置
///
/// 库代码只使用 `tracing` 宏，日志输出在入口处配置。
///
/// - `-v, --verbose`：DEBUG 级别
/// - `RUST_LOG`：覆盖默认级别，例如 `RUST_LOG=vault_core::web=debug`
/// - `VAULT_LOG_FILE`：日志写入该文件而非终端
///
/// ```bash
/// VAULT_LOG_FILE=vault.log vault-cli daemon
/// ```
///
/// 写文件时返回的 guard 需要保持到进程结束，否则缓冲中的日志会丢失。
pub fn setup_logging(verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt};

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Ok(log_file) = std::env::var("VAULT_LOG_FILE") {
        match open_log_file(Path::new(&log_file)) {
            Ok(file) => {
                let (writer, guard) = tracing_appender::non_blocking(file);
                // 文件输出使用详细格式便于排查
                fmt()
                    .with_env_filter(env_filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_line_number(true)
                    .init();
                return Some(guard);
            }
            Err(e) => eprintln!("无法打开日志文件 {log_file}: {e}，日志输出到终端"),
        }
    }

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
    None
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// 以人类可读的单位显示字节数
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
