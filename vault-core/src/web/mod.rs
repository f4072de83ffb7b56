//! 通过 Pi-hole Web 管理接口获取 Teleporter 备份
//!
//! 认证与下载都按固定顺序尝试多个端点，覆盖 v5 (token) 与 v6 (会话) 两代接口。
//! 认证成功后的会话保存在客户端实例上，同一实例后续的下载请求复用该会话。

pub mod session;
pub mod validation;

use crate::connection::WebTarget;
use crate::constants::web;
use crate::error::{Result, VaultError};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

pub use session::{AuthMethod, AuthSession, SessionCredentials};
pub use validation::{ArchiveFormat, CandidateFailure, PayloadKind, RejectReason, ValidArchive};

use validation::{select_first_valid, summarize_failures, validate_archive};

/// 成功获取的备份数据
#[derive(Debug, Clone)]
pub struct WebArchive {
    pub bytes: Vec<u8>,
    pub format: ArchiveFormat,
    pub endpoint: String,
}

/// 认证候选端点
#[derive(Debug, Clone, Copy)]
enum AuthCandidate {
    Modern(&'static str),
    Legacy {
        path: &'static str,
        key: &'static str,
        value: &'static str,
    },
}

impl AuthCandidate {
    fn all() -> Vec<Self> {
        let modern = web::auth::MODERN_ENDPOINTS.into_iter().map(Self::Modern);
        let legacy = web::auth::LEGACY_ENDPOINTS
            .into_iter()
            .map(|(path, key, value)| Self::Legacy { path, key, value });
        modern.chain(legacy).collect()
    }

    fn path(&self) -> &'static str {
        match self {
            Self::Modern(path) | Self::Legacy { path, .. } => *path,
        }
    }
}

impl fmt::Display for AuthCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modern(path) => write!(f, "POST {path}"),
            Self::Legacy { path, key, .. } => write!(f, "GET {path}?{key}"),
        }
    }
}

/// 下载候选端点，查询参数中的密钥不出现在日志与错误信息里
#[derive(Debug, Clone)]
struct ArchiveCandidate {
    path: &'static str,
    query: Vec<(&'static str, String)>,
}

impl ArchiveCandidate {
    fn for_session(session: &AuthSession) -> Vec<Self> {
        match session.token() {
            None => web::teleporter::MODERN_ENDPOINTS
                .into_iter()
                .map(|path| Self {
                    path,
                    query: Vec::new(),
                })
                .collect(),
            Some(token) => {
                let with_token =
                    web::teleporter::LEGACY_TOKEN_ENDPOINTS
                        .into_iter()
                        .map(|path| Self {
                            path,
                            query: vec![("token", token.to_string())],
                        });
                let with_action =
                    web::teleporter::LEGACY_ACTION_ENDPOINTS
                        .into_iter()
                        .map(|path| Self {
                            path,
                            query: vec![
                                ("auth", token.to_string()),
                                ("action", "teleporter".to_string()),
                            ],
                        });
                with_token.chain(with_action).collect()
            }
        }
    }
}

impl fmt::Display for ArchiveCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path)
    }
}

/// 读取完毕的 HTTP 响应
struct RawResponse {
    status: StatusCode,
    content_type: Option<String>,
    set_cookies: Vec<String>,
    body: Vec<u8>,
}

impl RawResponse {
    async fn read(response: reqwest::Response) -> std::result::Result<Self, reqwest::Error> {
        let status = response.status();
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let set_cookies = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(Self {
            status,
            content_type,
            set_cookies,
            body,
        })
    }
}

/// Pi-hole Web 接口客户端
#[derive(Debug, Clone)]
pub struct WebAcquisitionClient {
    client: Client,
    base_url: String,
    password: String,
    session: Arc<RwLock<Option<AuthSession>>>,
}

impl WebAcquisitionClient {
    /// 创建客户端（30 秒超时，接受自签名证书）
    pub fn new(target: WebTarget<'_>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(web::REQUEST_TIMEOUT))
            .danger_accept_invalid_certs(true)
            .user_agent(web::USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: target.base_url(),
            password: target.settings.password.clone(),
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 当前会话（未认证时为 None）
    pub async fn session(&self) -> Option<AuthSession> {
        self.session.read().await.clone()
    }

    fn endpoint_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| VaultError::invalid_config(format!("invalid Pi-hole URL: {e}")))
    }

    fn auth_request(&self, candidate: &AuthCandidate) -> Result<RequestBuilder> {
        let mut url = self.endpoint_url(candidate.path())?;
        let request = match candidate {
            AuthCandidate::Modern(_) => self
                .client
                .post(url)
                .json(&json!({ "password": self.password })),
            AuthCandidate::Legacy { key, value, .. } => {
                {
                    let mut query = url.query_pairs_mut();
                    query.append_pair("auth", &self.password);
                    query.append_pair(key, value);
                }
                self.client.get(url)
            }
        };
        Ok(request)
    }

    /// 依次尝试各代认证接口，首个返回 200 的胜出
    pub async fn authenticate(&self) -> Result<AuthSession> {
        let base_url = self.base_url.clone();
        let password = self.password.clone();

        let selected = select_first_valid(
            AuthCandidate::all(),
            |candidate| {
                let request = self.auth_request(candidate);
                async move {
                    let response = request?.send().await?;
                    Ok::<_, VaultError>(RawResponse::read(response).await?)
                }
            },
            |candidate, response| {
                if response.status != StatusCode::OK {
                    return Err(format!("HTTP {}", response.status.as_u16()));
                }
                let credentials = match candidate {
                    AuthCandidate::Modern(_) => session::extract_modern_credentials(
                        &response.body,
                        &response.set_cookies,
                    ),
                    AuthCandidate::Legacy { .. } => SessionCredentials::Token(password.clone()),
                };
                Ok(AuthSession {
                    credentials,
                    base_url: base_url.clone(),
                    endpoint: candidate.path().to_string(),
                })
            },
        )
        .await;

        match selected {
            Ok((_, session)) => {
                info!(
                    method = session.method().as_str(),
                    endpoint = %session.endpoint,
                    "Pi-hole Web 认证成功"
                );
                if session.method() == AuthMethod::ModernCookie && !session.has_session_id() {
                    warn!("认证响应中未找到会话 ID，后续请求可能被拒绝");
                }
                *self.session.write().await = Some(session.clone());
                Ok(session)
            }
            Err(failures) => {
                warn!(
                    failures = %summarize_failures(&failures),
                    "所有 Web 认证方式均失败"
                );
                Err(VaultError::authentication("all authentication methods failed"))
            }
        }
    }

    /// 为请求附加会话 Cookie 与 CSRF 头
    fn add_session_headers(request: RequestBuilder, session: &AuthSession) -> RequestBuilder {
        let mut request = request;
        if let Some(cookie) = session.cookie_header() {
            request = request.header(COOKIE, cookie);
        }
        if let Some(csrf) = session.csrf_token() {
            request = request.header(web::CSRF_HEADER, csrf);
        }
        request
    }

    fn archive_request(
        &self,
        candidate: &ArchiveCandidate,
        session: &AuthSession,
    ) -> Result<RequestBuilder> {
        let mut url = self.endpoint_url(candidate.path)?;
        if !candidate.query.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in &candidate.query {
                query.append_pair(key, value);
            }
        }
        Ok(Self::add_session_headers(self.client.get(url), session))
    }

    /// 获取备份数据，尚未认证时先认证
    pub async fn acquire(&self) -> Result<WebArchive> {
        let current = self.session.read().await.clone();
        let session = match current {
            Some(session) => session,
            None => self.authenticate().await?,
        };

        let candidates = ArchiveCandidate::for_session(&session);
        debug!(
            method = session.method().as_str(),
            candidates = candidates.len(),
            "开始尝试 Teleporter 下载端点"
        );

        let selected = select_first_valid(
            candidates,
            |candidate| {
                let request = self.archive_request(candidate, &session);
                async move {
                    let response = request?.send().await?;
                    Ok::<_, VaultError>(RawResponse::read(response).await?)
                }
            },
            |_, response| {
                if response.status != StatusCode::OK {
                    return Err(format!("HTTP {}", response.status.as_u16()));
                }
                validate_archive(&response.body, response.content_type.as_deref())
                    .map(|valid| (response.body, valid))
                    .map_err(|reason| reason.to_string())
            },
        )
        .await;

        match selected {
            Ok((candidate, (bytes, valid))) => {
                info!(
                    endpoint = %candidate,
                    format = %valid.format,
                    size = bytes.len(),
                    "已获取 Teleporter 备份"
                );
                Ok(WebArchive {
                    bytes,
                    format: valid.format,
                    endpoint: candidate.path.to_string(),
                })
            }
            Err(failures) => Err(VaultError::validation(format!(
                "failed to retrieve backup from Pi-hole API: {}",
                summarize_failures(&failures)
            ))),
        }
    }

    /// 检查管理界面是否可达（`/admin/` 返回 200）
    pub async fn test_web_connection(&self) -> Result<()> {
        let url = self.endpoint_url(web::ADMIN_PATH)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| VaultError::connection(format!("Pi-hole web interface unreachable: {e}")))?;

        if response.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(VaultError::connection(format!(
                "Pi-hole web interface returned HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}
