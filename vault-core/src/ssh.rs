//! 通过 SSH 在 Pi-hole 主机上生成并下载 Teleporter 备份
//!
//! ssh2 是阻塞库，所有会话操作都放到 tokio 的阻塞线程池中执行。

use crate::connection::SshTarget;
use crate::constants::ssh;
use crate::error::{Result, VaultError};
use crate::storage::PartialFile;
use ssh2::{KeyboardInteractivePrompt, Prompt, Session};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 通过 SSH 下载到本地的备份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellArchive {
    pub local_path: PathBuf,
    pub size: u64,
    pub remote_path: String,
}

/// 远程命令的执行结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Pi-hole 运行状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub status: String,
    pub version: String,
}

/// keyboard-interactive 认证时的同步凭据提供者，对每个提示都回答密码
pub struct PasswordPrompter<'a> {
    password: &'a str,
}

impl<'a> PasswordPrompter<'a> {
    pub fn new(password: &'a str) -> Self {
        Self { password }
    }
}

impl KeyboardInteractivePrompt for PasswordPrompter<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        debug!(prompts = prompts.len(), "收到 keyboard-interactive 认证提示");
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

/// 离开作用域时断开的 SSH 会话
struct SessionGuard {
    session: Session,
    host: String,
}

impl Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Err(e) = self.session.disconnect(None, "backup finished", None) {
            debug!(host = %self.host, "断开 SSH 会话失败: {}", e);
        }
    }
}

/// SSH 备份客户端
#[derive(Debug, Clone)]
pub struct ShellAcquisitionClient {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<PathBuf>,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl ShellAcquisitionClient {
    pub fn new(target: SshTarget<'_>) -> Self {
        Self {
            host: target.host.to_string(),
            port: target.settings.port,
            username: target.settings.username.clone(),
            password: target.settings.password.clone(),
            private_key: target.settings.private_key.clone(),
            connect_timeout: Duration::from_secs(ssh::CONNECT_TIMEOUT),
            cancel: CancellationToken::new(),
        }
    }

    /// 阻塞线程在各步骤之间检查该令牌，取消后尽快退出
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 生成备份并下载到 `local_path`，随后删除远程文件
    pub async fn acquire(&self, local_path: &Path) -> Result<ShellArchive> {
        let client = self.clone();
        let local_path = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || client.acquire_blocking(&local_path)).await?
    }

    /// 执行任意远程命令
    pub async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        let client = self.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let session = client.connect()?;
            exec(&session, &command)
        })
        .await?
    }

    /// 连接测试：确认能登录且远程主机安装了 pihole-FTL，返回其路径
    pub async fn test_connection(&self) -> Result<String> {
        let client = self
            .clone()
            .with_connect_timeout(Duration::from_secs(ssh::TEST_CONNECT_TIMEOUT));
        let output = client.run_command(ssh::CHECK_COMMAND).await?;
        let path = output.stdout.trim();
        if !output.success() || path.is_empty() {
            return Err(VaultError::command(format!(
                "pihole-FTL not found on {}",
                self.host
            )));
        }
        Ok(path.to_string())
    }

    /// 查询 Pi-hole 运行状态与版本
    pub async fn remote_status(&self) -> Result<RemoteStatus> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            let session = client.connect()?;
            let status = exec(&session, ssh::STATUS_COMMAND)?;
            let version = exec(&session, ssh::VERSION_COMMAND)?;
            Ok(RemoteStatus {
                status: status.stdout.trim().to_string(),
                version: version.stdout.trim().to_string(),
            })
        })
        .await?
    }

    fn acquire_blocking(&self, local_path: &Path) -> Result<ShellArchive> {
        self.ensure_active()?;
        let session = self.connect()?;
        self.ensure_active()?;

        info!(host = %self.host, "在远程主机上生成 Teleporter 备份");
        let output = exec(&session, ssh::TELEPORTER_COMMAND)?;
        if !output.success() {
            return Err(VaultError::command(format!(
                "{} exited with status {}: {}",
                ssh::TELEPORTER_COMMAND,
                output.exit_status,
                output.stderr.trim()
            )));
        }

        let remote_path = output.stdout.trim().to_string();
        if remote_path.is_empty() {
            return Err(VaultError::validation(
                "remote backup command returned an empty file path",
            ));
        }
        debug!(remote_path = %remote_path, "远程备份已生成");

        let partial = PartialFile::new(local_path);
        let downloaded = self
            .ensure_active()
            .and_then(|()| download(&session, &remote_path, partial.path(), &self.cancel));

        // 远程文件无论下载成败都要删除
        let cleanup = format!("rm -f {}", shell_quote(&remote_path));
        match exec(&session, &cleanup) {
            Ok(out) if out.success() => debug!(remote_path = %remote_path, "已删除远程备份文件"),
            Ok(out) => warn!(
                remote_path = %remote_path,
                "删除远程备份文件失败: {}",
                out.stderr.trim()
            ),
            Err(e) => warn!(remote_path = %remote_path, "删除远程备份文件失败: {}", e),
        }

        downloaded?;
        self.ensure_active()?;
        fs::rename(partial.path(), local_path).map_err(|e| {
            VaultError::persistence(format!("cannot write {}: {e}", local_path.display()))
        })?;
        partial.disarm();

        let size = check_downloaded(local_path)?;
        info!(size, local_path = %local_path.display(), "SSH 备份下载完成");
        Ok(ShellArchive {
            local_path: local_path.to_path_buf(),
            size,
            remote_path,
        })
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(host = %self.host, "SSH 备份已取消");
            return Err(VaultError::Cancelled);
        }
        Ok(())
    }

    /// 建立连接并认证：已部署私钥 -> 密码 -> keyboard-interactive
    fn connect(&self) -> Result<SessionGuard> {
        let endpoint = format!("{}:{}", self.host, self.port);
        let connection_error = |e: &dyn std::fmt::Display| {
            VaultError::connection(format!("SSH connection to {endpoint} failed: {e}"))
        };

        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| connection_error(&e))?
            .next()
            .ok_or_else(|| connection_error(&"host did not resolve"))?;

        let tcp = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| connection_error(&e))?;

        let mut session = Session::new().map_err(|e| connection_error(&e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.connect_timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| connection_error(&e))?;

        let session = SessionGuard {
            session,
            host: self.host.clone(),
        };
        self.authenticate(&session)?;
        debug!(host = %self.host, user = %self.username, "SSH 会话已建立");
        Ok(session)
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        if let Some(key) = self.private_key.as_deref().filter(|k| k.is_file()) {
            match session.userauth_pubkey_file(&self.username, None, key, None) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("私钥认证失败，尝试密码认证: {}", e),
            }
        }

        if let Some(password) = self.password.as_deref() {
            match session.userauth_password(&self.username, password) {
                Ok(()) if session.authenticated() => return Ok(()),
                Ok(()) => {}
                Err(e) => debug!("密码认证失败，尝试 keyboard-interactive: {}", e),
            }

            let mut prompter = PasswordPrompter::new(password);
            if let Err(e) = session.userauth_keyboard_interactive(&self.username, &mut prompter) {
                debug!("keyboard-interactive 认证失败: {}", e);
            }
            if session.authenticated() {
                return Ok(());
            }
        }

        Err(VaultError::authentication(format!(
            "SSH authentication failed for {}@{}",
            self.username, self.host
        )))
    }
}

fn exec(session: &Session, command: &str) -> Result<CommandOutput> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let exit_status = channel.exit_status()?;

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_status,
    })
}

fn download(
    session: &Session,
    remote_path: &str,
    local_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut remote, stat) = session.scp_recv(Path::new(remote_path))?;
    debug!(size = stat.size(), "开始下载远程备份");

    let mut file = File::create(local_path).map_err(|e| {
        VaultError::persistence(format!("cannot create {}: {e}", local_path.display()))
    })?;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        let n = remote.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }
    file.sync_all()?;

    remote.send_eof()?;
    remote.wait_eof()?;
    remote.close()?;
    remote.wait_close()?;
    Ok(())
}

/// 检查下载结果，0 字节的文件删除后报错
fn check_downloaded(path: &Path) -> Result<u64> {
    let size = fs::metadata(path)?.len();
    if size == 0 {
        let _ = fs::remove_file(path);
        return Err(VaultError::validation("downloaded backup file is empty"));
    }
    Ok(size)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
