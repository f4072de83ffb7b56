//! 备份目标的连接描述
//!
//! 持久化配置中的 `pihole` 段字段是松散的（连接方式为字符串，SSH/Web 字段可选），
//! 这里在构造时一次性校验，转换为按连接方式区分的强类型结构。
//! 每次备份尝试构造一次，尝试期间不可变。

use crate::config::{AppConfig, PiholeSettings, Strategy};
use crate::constants::web;
use crate::error::{Result, VaultError};
use std::path::{Path, PathBuf};

/// 一个远程备份目标及其连接方式
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    host: String,
    shell_host: String,
    target: ConnectionTarget,
}

/// 按连接方式区分的凭据
#[derive(Debug, Clone)]
pub enum ConnectionTarget {
    Ssh(SshSettings),
    Web(WebSettings),
    Hybrid { ssh: SshSettings, web: WebSettings },
}

/// SSH 连接参数
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub port: u16,
}

/// Web 管理接口连接参数
#[derive(Debug, Clone)]
pub struct WebSettings {
    pub port: u16,
    pub use_https: bool,
    pub password: String,
}

/// 带主机信息的 SSH 目标
#[derive(Debug, Clone, Copy)]
pub struct SshTarget<'a> {
    pub host: &'a str,
    pub settings: &'a SshSettings,
}

/// 带主机信息的 Web 目标
#[derive(Debug, Clone, Copy)]
pub struct WebTarget<'a> {
    pub host: &'a str,
    pub settings: &'a WebSettings,
}

impl ConnectionConfig {
    /// 从持久化的 `pihole` 段构造并校验
    ///
    /// `deployed_key` 为已部署的 SSH 私钥，存在时优先于密码使用。
    pub fn from_settings(settings: &PiholeSettings, deployed_key: Option<&Path>) -> Result<Self> {
        let host = settings.host.trim();
        if host.is_empty() {
            return Err(VaultError::invalid_config("Pi-hole host is required"));
        }

        let target = match settings.connection_method {
            Strategy::Ssh => ConnectionTarget::Ssh(build_ssh_settings(settings, deployed_key)?),
            Strategy::Web => ConnectionTarget::Web(build_web_settings(settings)?),
            Strategy::Hybrid => ConnectionTarget::Hybrid {
                ssh: build_ssh_settings(settings, deployed_key)?,
                web: build_web_settings(settings)?,
            },
        };

        Ok(Self::new(host, target))
    }

    /// 从完整应用配置构造
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        let settings = config
            .pihole
            .as_ref()
            .ok_or_else(|| VaultError::invalid_config("Pi-hole configuration not found"))?;
        Self::from_settings(settings, config.deployed_key_path())
    }

    pub fn new(host: impl Into<String>, target: ConnectionTarget) -> Self {
        let host = host.into();
        Self {
            shell_host: shell_host(&host),
            host,
            target,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn strategy(&self) -> Strategy {
        match self.target {
            ConnectionTarget::Ssh(_) => Strategy::Ssh,
            ConnectionTarget::Web(_) => Strategy::Web,
            ConnectionTarget::Hybrid { .. } => Strategy::Hybrid,
        }
    }

    pub fn ssh(&self) -> Option<SshTarget<'_>> {
        match &self.target {
            ConnectionTarget::Ssh(settings) | ConnectionTarget::Hybrid { ssh: settings, .. } => {
                Some(SshTarget {
                    host: &self.shell_host,
                    settings,
                })
            }
            ConnectionTarget::Web(_) => None,
        }
    }

    pub fn web(&self) -> Option<WebTarget<'_>> {
        match &self.target {
            ConnectionTarget::Web(settings) | ConnectionTarget::Hybrid { web: settings, .. } => {
                Some(WebTarget {
                    host: &self.host,
                    settings,
                })
            }
            ConnectionTarget::Ssh(_) => None,
        }
    }

    /// 日志中使用的主机名（截断过长的 URL）
    pub fn display_host(&self) -> String {
        self.host.chars().take(50).collect()
    }
}

impl WebTarget<'_> {
    /// 管理接口根地址
    ///
    /// 主机已是完整 URL 时原样使用，否则按协议拼接，默认端口不写入地址。
    pub fn base_url(&self) -> String {
        let host = self.host.trim();
        if host.starts_with("http://") || host.starts_with("https://") {
            return host.trim_end_matches('/').to_string();
        }

        let (scheme, default_port) = if self.settings.use_https {
            ("https", web::DEFAULT_HTTPS_PORT)
        } else {
            ("http", web::DEFAULT_HTTP_PORT)
        };

        if self.settings.port == default_port {
            format!("{scheme}://{host}")
        } else {
            format!("{scheme}://{host}:{}", self.settings.port)
        }
    }
}

fn build_ssh_settings(settings: &PiholeSettings, deployed_key: Option<&Path>) -> Result<SshSettings> {
    let username = non_empty(settings.username.as_deref()).ok_or_else(|| {
        VaultError::invalid_config("Username is required for SSH and hybrid connection methods")
    })?;
    let password = non_empty(settings.password.as_deref()).map(str::to_string);
    let private_key = deployed_key.map(Path::to_path_buf);

    if password.is_none() && private_key.is_none() {
        return Err(VaultError::invalid_config(
            "SSH password or deployed SSH key is required for SSH and hybrid connection methods",
        ));
    }

    Ok(SshSettings {
        username: username.to_string(),
        password,
        private_key,
        port: settings.port,
    })
}

fn build_web_settings(settings: &PiholeSettings) -> Result<WebSettings> {
    let password = non_empty(settings.web_password.as_deref()).ok_or_else(|| {
        VaultError::invalid_config(
            "Web password is required for web-only and hybrid connection methods",
        )
    })?;

    Ok(WebSettings {
        port: settings.web_port,
        use_https: settings.use_https,
        password: password.to_string(),
    })
}

/// SSH 使用的主机名：完整 URL 只取其中的主机部分
fn shell_host(host: &str) -> String {
    let host = host.trim();
    if !host.contains("://") {
        return host.to_string();
    }
    url::Url::parse(host)
        .ok()
        .and_then(|url| {
            url.host_str()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        })
        .unwrap_or_else(|| host.to_string())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
