use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use vault_core::config::Strategy;
use vault_core::constants::{cron, data};

/// 任务记录相关命令
#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// 列出最近的备份任务
    List {
        /// 最多显示的条数
        #[arg(long)]
        limit: Option<usize>,
    },
    /// 显示任务统计
    Stats,
    /// 清空任务记录
    Clear,
}

/// 定时备份相关命令
#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// 校验 cron 表达式并显示接下来的运行时间
    Validate {
        /// cron 表达式，例如 "0 3 * * *" 表示每天凌晨3点
        expression: String,
        /// 时区：IANA 名称或 GMT±N
        #[arg(long)]
        timezone: Option<String>,
    },
    /// 显示当前配置接下来的运行时间
    NextRuns {
        #[arg(short = 'n', long, default_value_t = cron::VALIDATE_PREVIEW_RUNS)]
        count: usize,
    },
    /// 启用定时备份
    Enable,
    /// 禁用定时备份
    Disable,
    /// 设置 cron 表达式和时区
    Set {
        expression: String,
        #[arg(long)]
        timezone: Option<String>,
    },
}

/// 连接方式参数
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodArg {
    Ssh,
    Web,
    Hybrid,
}

impl From<MethodArg> for Strategy {
    fn from(method: MethodArg) -> Self {
        match method {
            MethodArg::Ssh => Strategy::Ssh,
            MethodArg::Web => Strategy::Web,
            MethodArg::Hybrid => Strategy::Hybrid,
        }
    }
}

/// `init` 可选的备份目标参数
#[derive(clap::Args, Debug, Default, Clone)]
pub struct TargetArgs {
    /// Pi-hole 主机名、IP 或 URL
    #[arg(long)]
    pub host: Option<String>,
    /// 连接方式
    #[arg(long, value_enum)]
    pub method: Option<MethodArg>,
    /// SSH 用户名
    #[arg(long)]
    pub username: Option<String>,
    /// SSH 密码
    #[arg(long, env = "PIHOLE_SSH_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// SSH 端口
    #[arg(long)]
    pub port: Option<u16>,
    /// Web 管理端口
    #[arg(long)]
    pub web_port: Option<u16>,
    /// 使用 HTTPS 访问管理接口
    #[arg(long)]
    pub https: bool,
    /// Web 管理密码
    #[arg(long, env = "PIHOLE_WEB_PASSWORD", hide_env_values = true)]
    pub web_password: Option<String>,
}

#[derive(Parser)]
#[command(name = "vault-cli")]
#[command(about = "Pi-hole Teleporter 自动备份工具")]
#[command(version)]
pub struct Cli {
    /// 数据目录（配置文件与任务记录）
    #[arg(long, global = true, env = "DATA_DIR", default_value = data::DATA_DIR_NAME)]
    pub data_dir: PathBuf,

    /// 备份目录，覆盖配置文件中的设置
    #[arg(long, global = true, env = "BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// 详细输出
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 初始化配置文件和目录结构
    Init {
        /// 覆盖已存在的配置文件
        #[arg(long)]
        force: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// 立即执行一次备份
    Run {
        /// 备份名称，作为文件名前缀
        #[arg(long)]
        name: Option<String>,
        /// 备份描述，写入任务记录
        #[arg(long)]
        description: Option<String>,
        /// 以 JSON 输出结果
        #[arg(long)]
        json: bool,
    },
    /// 前台运行定时备份，直到 Ctrl-C
    Daemon,
    /// 测试到 Pi-hole 的连接
    TestConnection,
    /// 显示配置、定时任务与最近备份的状态
    Status {
        /// 通过 SSH 查询 Pi-hole 运行状态
        #[arg(long)]
        remote: bool,
    },
    /// 列出本地备份
    ListBackups,
    /// 显示备份目录统计
    BackupStats,
    /// 删除指定备份
    DeleteBackup {
        /// 备份文件名
        filename: String,
    },
    /// 校验备份文件能否完整读取
    VerifyBackup {
        /// 备份文件名
        filename: String,
    },
    /// 任务记录
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// 定时备份
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}
