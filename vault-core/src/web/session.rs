use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

static SID_COOKIE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|[;\s])sid=([^;]+)").ok());
static CSRF_COOKIE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:^|[;\s])csrf=([^;]+)").ok());

/// 认证方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// 旧版：每次请求以查询参数携带共享密钥
    LegacyToken,
    /// v6+：POST 换取会话 ID 与 CSRF token
    ModernCookie,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::LegacyToken => "legacy-token",
            AuthMethod::ModernCookie => "modern-cookie",
        }
    }
}

/// 认证成功后的会话凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCredentials {
    Token(String),
    Cookie {
        sid: Option<String>,
        csrf: Option<String>,
        validity: Option<u64>,
    },
}

/// 一次 Web 备份尝试内可复用的认证会话
///
/// 会话头保存在产生它的客户端实例上，换一个客户端实例后该会话不再有效。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub credentials: SessionCredentials,
    pub base_url: String,
    pub endpoint: String,
}

impl AuthSession {
    pub fn method(&self) -> AuthMethod {
        match self.credentials {
            SessionCredentials::Token(_) => AuthMethod::LegacyToken,
            SessionCredentials::Cookie { .. } => AuthMethod::ModernCookie,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match &self.credentials {
            SessionCredentials::Token(token) => Some(token),
            SessionCredentials::Cookie { .. } => None,
        }
    }

    pub fn has_session_id(&self) -> bool {
        matches!(&self.credentials, SessionCredentials::Cookie { sid: Some(_), .. })
    }

    /// 需要附加到后续请求的 Cookie 头
    pub fn cookie_header(&self) -> Option<String> {
        match &self.credentials {
            SessionCredentials::Cookie {
                sid: Some(sid),
                csrf,
                ..
            } => Some(match csrf {
                Some(csrf) => format!("sid={sid}; csrf={csrf}"),
                None => format!("sid={sid}"),
            }),
            _ => None,
        }
    }

    pub fn csrf_token(&self) -> Option<&str> {
        match &self.credentials {
            SessionCredentials::Cookie { csrf, .. } => csrf.as_deref(),
            SessionCredentials::Token(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    session: Option<SessionBody>,
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    sid: Option<String>,
    csrf: Option<String>,
    validity: Option<u64>,
}

/// 从 v6 认证响应中提取会话信息
///
/// 优先读取 JSON 响应体里的 `session`，缺失时再解析 `Set-Cookie`。
pub fn extract_modern_credentials(body: &[u8], set_cookies: &[String]) -> SessionCredentials {
    if let Ok(AuthResponse {
        session: Some(session),
    }) = serde_json::from_slice::<AuthResponse>(body)
    {
        if session.sid.is_some() {
            return SessionCredentials::Cookie {
                sid: session.sid,
                csrf: session.csrf,
                validity: session.validity,
            };
        }
    }

    let (sid, csrf) = parse_session_cookies(set_cookies);
    SessionCredentials::Cookie {
        sid,
        csrf,
        validity: None,
    }
}

/// 从 `Set-Cookie` 头中找出 `sid` 与 `csrf`
pub fn parse_session_cookies(set_cookies: &[String]) -> (Option<String>, Option<String>) {
    let find = |re: &Option<Regex>| {
        let re = re.as_ref()?;
        set_cookies.iter().find_map(|cookie| {
            re.captures(cookie)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().trim().to_string())
        })
    };

    (find(&*SID_COOKIE), find(&*CSRF_COOKIE))
}
