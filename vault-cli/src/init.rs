use crate::cli::TargetArgs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vault_core::Result;
use vault_core::config::{AppConfig, PiholeSettings, Strategy};
use vault_core::connection::ConnectionConfig;
use vault_core::constants::{data, ssh, web};

/// 运行独立的初始化流程，返回配置文件路径
pub async fn run_init(
    data_dir: &Path,
    backup_dir: Option<&Path>,
    force: bool,
    target: TargetArgs,
) -> Result<PathBuf> {
    info!("🛡️  Pi-hole Vault 初始化");
    info!("======================");

    if !force {
        if let Some(existing) = AppConfig::locate_config_file(data_dir) {
            warn!("⚠️  检测到已存在的配置文件: {}", existing.display());
            info!("如果您要重新初始化，请使用 --force 参数");
            info!("示例: vault-cli init --force");
            return Ok(existing);
        }
    }

    info!("📋 步骤 1: 生成配置");
    let mut config = AppConfig::default();
    if let Some(dir) = backup_dir {
        config.backup.destination_path = dir.to_path_buf();
    }
    config.pihole = build_pihole_settings(target);

    match &config.pihole {
        Some(pihole) => {
            info!("   ✅ 备份目标: {} ({})", pihole.host, pihole.connection_method);
            if let Err(e) = ConnectionConfig::from_app_config(&config) {
                warn!("   ⚠️  连接配置尚不完整: {} (可稍后编辑配置文件)", e);
            }
        }
        None => info!("   💡 未指定 --host，请稍后在配置文件中填写 pihole 段"),
    }

    info!("📋 步骤 2: 写入配置文件和目录结构");
    let config_path = data_dir.join(data::CONFIG_FILE_NAME);
    config.save_to_file(&config_path)?;
    config.ensure_backup_dir()?;
    info!("   ✅ 创建配置文件: {}", config_path.display());
    info!("   ✅ 备份目录: {}", config.get_backup_dir().display());

    info!("🎉 初始化完成");
    info!("👉 运行 'vault-cli test-connection' 检查连接，'vault-cli run' 立即备份");
    Ok(config_path)
}

fn build_pihole_settings(target: TargetArgs) -> Option<PiholeSettings> {
    let host = target.host.filter(|h| !h.trim().is_empty())?;
    let connection_method = target.method.map(Strategy::from).unwrap_or_default();
    let default_web_port = if target.https {
        web::DEFAULT_HTTPS_PORT
    } else {
        web::DEFAULT_HTTP_PORT
    };

    Some(PiholeSettings {
        host,
        connection_method,
        username: target.username,
        password: target.password,
        port: target.port.unwrap_or(ssh::DEFAULT_PORT),
        web_port: target.web_port.unwrap_or(default_web_port),
        use_https: target.https,
        web_password: target.web_password,
    })
}
