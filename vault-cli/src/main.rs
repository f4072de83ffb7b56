use clap::Parser;
use tracing::error;
use vault_cli::{Cli, CliApp, Commands, run_init, setup_logging};
use vault_core::VaultError;

#[tokio::main]
async fn main() {
    // 解析命令行参数
    let cli = Cli::parse();

    // 设置日志记录，写文件时 guard 需在退出前释放以刷新缓冲
    let log_guard = setup_logging(cli.verbose);

    let code = run(cli).await;
    drop(log_guard);
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    // `init` 命令是特例，它不需要预先加载配置
    let command = match cli.command {
        Commands::Init { force, target } => {
            return match run_init(&cli.data_dir, cli.backup_dir.as_deref(), force, target).await {
                Ok(_) => 0,
                Err(e) => {
                    error!("❌ 初始化失败: {}", e);
                    1
                }
            };
        }
        command => command,
    };

    // 对于其他所有命令，我们需要加载配置并初始化App
    let mut app = match CliApp::new(&cli.data_dir, cli.backup_dir.clone()) {
        Ok(app) => app,
        Err(VaultError::ConfigNotFound(path)) => {
            error!("❌ 配置文件 '{}' 未找到。", path);
            error!("👉 请先运行 'vault-cli init' 命令来创建配置文件。");
            return 1;
        }
        Err(e) => {
            error!("❌ 应用初始化失败: {}", e);
            return 1;
        }
    };

    // 运行命令
    match app.run_command(command).await {
        Ok(()) => 0,
        Err(e) => {
            error!("❌ 操作失败: {:#}", e);
            1
        }
    }
}
