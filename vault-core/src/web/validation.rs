//! Teleporter 响应校验与端点回退选择
//!
//! 这里的函数与 HTTP 传输无关：`validate_archive` 只看响应体，
//! `select_first_valid` 只负责按顺序尝试候选项，首个通过校验的胜出。

use crate::constants::web;
use std::fmt;
use std::future::Future;
use tracing::debug;

/// 识别出的备份格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Gzip,
    Bzip2,
    Tar,
    Json,
    Unknown,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Gzip => "gzip",
            ArchiveFormat::Bzip2 => "bzip2",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Json => "json",
            ArchiveFormat::Unknown => "unknown",
        }
    }

    /// 按文件头魔数识别
    pub fn detect(body: &[u8]) -> Self {
        if body.starts_with(&[0x1f, 0x8b]) {
            ArchiveFormat::Gzip
        } else if body.starts_with(b"PK") {
            ArchiveFormat::Zip
        } else if body.starts_with(b"BZ") {
            ArchiveFormat::Bzip2
        } else if body.starts_with(b"ustar") || body.get(257..262) == Some(b"ustar".as_slice()) {
            ArchiveFormat::Tar
        } else {
            ArchiveFormat::Unknown
        }
    }

    pub fn has_magic(&self) -> bool {
        !matches!(self, ArchiveFormat::Json | ArchiveFormat::Unknown)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 响应体的大致类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
    Json,
}

/// 响应体被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    HtmlPage,
    Undersized { kind: PayloadKind, len: usize },
    MissingArchiveField,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Empty => f.write_str("empty response body"),
            RejectReason::HtmlPage => f.write_str("received HTML page instead of backup data"),
            RejectReason::Undersized { kind, len } => {
                write!(f, "{kind:?} payload too small to be a backup ({len} bytes)")
            }
            RejectReason::MissingArchiveField => {
                f.write_str("JSON response has no data/content/backup field")
            }
        }
    }
}

/// 校验通过的备份数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidArchive {
    pub format: ArchiveFormat,
    pub kind: PayloadKind,
}

/// 按内容类型与字节内容对响应体分类
pub fn classify_payload(body: &[u8], content_type: Option<&str>) -> PayloadKind {
    let is_json_type = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
    if is_json_type && serde_json::from_slice::<serde_json::Value>(body).is_ok() {
        return PayloadKind::Json;
    }
    if std::str::from_utf8(body).is_ok() {
        PayloadKind::Text
    } else {
        PayloadKind::Binary
    }
}

/// 判断响应体是否为真正的 Teleporter 备份
///
/// 含 HTML 标记的响应（包括 JSON 包装的）都直接拒绝，与长度无关。
pub fn validate_archive(
    body: &[u8],
    content_type: Option<&str>,
) -> std::result::Result<ValidArchive, RejectReason> {
    if body.is_empty() {
        return Err(RejectReason::Empty);
    }

    if contains_html_marker(body) {
        debug!("收到 HTML 页面而非备份数据");
        return Err(RejectReason::HtmlPage);
    }

    let kind = classify_payload(body, content_type);
    if kind == PayloadKind::Json {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| RejectReason::MissingArchiveField)?;
        let has_field = value.as_object().is_some_and(|obj| {
            ["data", "content", "backup"]
                .iter()
                .any(|key| obj.contains_key(*key))
        });
        return if has_field {
            Ok(ValidArchive {
                format: ArchiveFormat::Json,
                kind,
            })
        } else {
            Err(RejectReason::MissingArchiveField)
        };
    }

    let format = ArchiveFormat::detect(body);
    let min_len = match kind {
        PayloadKind::Binary => web::MIN_BINARY_ARCHIVE_SIZE,
        _ => web::MIN_TEXT_ARCHIVE_SIZE,
    };

    if format.has_magic() || body.len() > min_len {
        Ok(ValidArchive { format, kind })
    } else {
        Err(RejectReason::Undersized {
            kind,
            len: body.len(),
        })
    }
}

fn contains_html_marker(body: &[u8]) -> bool {
    const MARKERS: [&[u8]; 2] = [b"<!DOCTYPE", b"<html"];
    MARKERS
        .iter()
        .any(|marker| body.windows(marker.len()).any(|window| window == *marker))
}

/// 单个候选项的失败记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFailure {
    pub candidate: String,
    pub reason: String,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.candidate, self.reason)
    }
}

/// 把失败列表拼成一行，用于错误信息
pub fn summarize_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// 按顺序尝试候选项，返回首个通过校验的结果
///
/// `attempt` 只在轮到该候选项时才被调用；请求错误与校验失败都被记录后继续尝试下一个，
/// 全部失败时返回所有失败原因。
pub async fn select_first_valid<C, T, U, E, A, Fut, V>(
    candidates: impl IntoIterator<Item = C>,
    mut attempt: A,
    mut validate: V,
) -> std::result::Result<(C, U), Vec<CandidateFailure>>
where
    C: fmt::Display,
    E: fmt::Display,
    A: FnMut(&C) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    V: FnMut(&C, T) -> std::result::Result<U, String>,
{
    let mut failures = Vec::new();

    for candidate in candidates {
        let outcome = match attempt(&candidate).await {
            Ok(value) => validate(&candidate, value),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(selected) => return Ok((candidate, selected)),
            Err(reason) => {
                debug!(candidate = %candidate, reason = %reason, "候选端点未通过");
                failures.push(CandidateFailure {
                    candidate: candidate.to_string(),
                    reason,
                });
            }
        }
    }

    Err(failures)
}
