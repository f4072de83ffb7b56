/// 备份文件相关常量
pub mod backup {
    use std::path::{Path, PathBuf};

    /// 备份目录名
    pub const BACKUP_DIR_NAME: &str = "backups";

    /// 备份文件前缀
    pub const BACKUP_PREFIX: &str = "pi-hole_backup";

    /// 备份文件扩展名
    pub const BACKUP_EXTENSION: &str = ".zip";

    /// 默认保留的备份数量
    pub const DEFAULT_MAX_BACKUPS: usize = 10;

    /// 获取默认备份存储目录（用于配置）
    pub fn get_default_storage_dir() -> PathBuf {
        Path::new(".").join(BACKUP_DIR_NAME)
    }
}

/// 应用数据目录相关常量
pub mod data {
    use std::path::{Path, PathBuf};

    /// 数据目录名
    pub const DATA_DIR_NAME: &str = "data";

    /// 配置文件名
    pub const CONFIG_FILE_NAME: &str = "config.json";

    /// 任务记录文件名
    pub const JOBS_FILE_NAME: &str = "jobs.json";

    /// 获取默认数据目录
    pub fn get_default_data_dir() -> PathBuf {
        Path::new(".").join(DATA_DIR_NAME)
    }
}

/// 任务记录相关常量
pub mod jobs {
    /// 任务记录最大保留条数
    pub const MAX_JOB_RECORDS: usize = 100;

    /// 任务ID前缀
    pub const JOB_ID_PREFIX: &str = "backup_";
}

/// Pi-hole Web 管理接口相关常量
pub mod web {
    /// 默认 Web 端口
    pub const DEFAULT_HTTP_PORT: u16 = 80;

    /// 默认 HTTPS 端口
    pub const DEFAULT_HTTPS_PORT: u16 = 443;

    /// HTTP 请求超时时间（秒）
    pub const REQUEST_TIMEOUT: u64 = 30;

    /// User-Agent头
    pub const USER_AGENT: &str = "PiHoleVault/1.0";

    /// 连通性检测路径
    pub const ADMIN_PATH: &str = "/admin/";

    /// 会话 CSRF 头
    pub const CSRF_HEADER: &str = "X-CSRF-TOKEN";

    /// 文本类响应被视为备份数据的最小长度（字节）
    pub const MIN_TEXT_ARCHIVE_SIZE: usize = 1000;

    /// 二进制响应被视为备份数据的最小长度（字节）
    pub const MIN_BINARY_ARCHIVE_SIZE: usize = 100;

    /// 认证端点
    pub mod auth {
        /// v6+ 会话接口
        pub const MODERN_ENDPOINTS: [&str; 2] = ["/api/auth", "/admin/api/auth"];

        /// 旧版 token 接口 (路径, 附加查询参数)
        pub const LEGACY_ENDPOINTS: [(&str, &str, &str); 4] = [
            ("/admin/api.php", "summary", ""),
            ("/api.php", "summary", ""),
            ("/admin/api.php", "topItems", "10"),
            ("/api.php", "topItems", "10"),
        ];
    }

    /// Teleporter 下载端点
    pub mod teleporter {
        /// 会话认证使用的端点
        pub const MODERN_ENDPOINTS: [&str; 4] = [
            "/api/teleporter",
            "/admin/api/teleporter",
            "/api/scripts/pi-hole/php/teleporter.php",
            "/admin/scripts/pi-hole/php/teleporter.php",
        ];

        /// token 认证使用 `?token=` 的端点
        pub const LEGACY_TOKEN_ENDPOINTS: [&str; 2] = [
            "/admin/scripts/pi-hole/php/teleporter.php",
            "/scripts/pi-hole/php/teleporter.php",
        ];

        /// token 认证使用 `?auth=&action=teleporter` 的端点
        pub const LEGACY_ACTION_ENDPOINTS: [&str; 2] = ["/admin/api.php", "/api.php"];
    }
}

/// SSH 相关常量
pub mod ssh {
    /// 默认 SSH 端口
    pub const DEFAULT_PORT: u16 = 22;

    /// 备份时的连接超时（秒）
    pub const CONNECT_TIMEOUT: u64 = 30;

    /// 连接测试的超时（秒）
    pub const TEST_CONNECT_TIMEOUT: u64 = 10;

    /// 生成 Teleporter 备份的远程命令
    pub const TELEPORTER_COMMAND: &str = "pihole-FTL --teleporter";

    /// 检查 Pi-hole 是否安装的远程命令
    pub const CHECK_COMMAND: &str = "which pihole-FTL";

    /// 查询 Pi-hole 运行状态
    pub const STATUS_COMMAND: &str = "pihole status";

    /// 查询 Pi-hole 版本
    pub const VERSION_COMMAND: &str = "pihole version";
}

/// 定时任务相关常量
pub mod cron {
    /// 默认自动备份cron表达式（每天凌晨3点）
    pub const DEFAULT_BACKUP_CRON: &str = "0 3 * * *";

    /// 默认时区
    pub const DEFAULT_TIMEZONE: &str = "UTC";

    /// 标准cron表达式字段数量
    pub const CRON_FIELDS_COUNT: usize = 5;

    /// 带秒字段的cron表达式字段数量
    pub const CRON_FIELDS_WITH_SECONDS: usize = 6;

    /// 定时任务名称
    pub const BACKUP_TASK_NAME: &str = "backup";

    /// 校验时展示的后续运行次数
    pub const VALIDATE_PREVIEW_RUNS: usize = 5;
}
