//! 使用进程内的 axum 服务模拟 Pi-hole 管理接口

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::fs::File;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use vault_core::config::{AppConfig, BackupSettings, PiholeSettings, Strategy};
use vault_core::connection::{ConnectionConfig, ConnectionTarget, WebSettings};
use vault_core::jobs::{JobLedger, JobStatus};
use vault_core::orchestrator::{AcquisitionMethod, BackupOrchestrator};
use vault_core::retention::list_archives;
use vault_core::web::{AuthMethod, WebAcquisitionClient};

type Responder = dyn Fn(&Method, &str, &HeaderMap) -> Response + Send + Sync;

struct MockPihole {
    hits: Mutex<Vec<String>>,
    respond: Box<Responder>,
}

async fn handle(
    State(mock): State<Arc<MockPihole>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let target = match uri.query() {
        Some(query) => format!("{} {}?{}", method, uri.path(), query),
        None => format!("{} {}", method, uri.path()),
    };
    mock.hits.lock().unwrap().push(target.clone());
    (mock.respond)(&method, target.split_once(' ').unwrap().1, &headers)
}

async fn spawn_mock(
    respond: impl Fn(&Method, &str, &HeaderMap) -> Response + Send + Sync + 'static,
) -> (SocketAddr, Arc<MockPihole>) {
    let mock = Arc::new(MockPihole {
        hits: Mutex::new(Vec::new()),
        respond: Box::new(respond),
    });
    let router = Router::new().fallback(handle).with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, mock)
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn gzip_body(len: usize) -> Vec<u8> {
    let mut body = vec![0x1f, 0x8b, 0x08, 0x00];
    body.resize(len, 0xab);
    body
}

fn html_page() -> Response {
    let mut page = String::from("<!DOCTYPE html><html><head><title>Pi-hole</title></head><body>");
    page.push_str(&"login required ".repeat(700));
    page.push_str("</body></html>");
    ([(header::CONTENT_TYPE, "text/html")], page).into_response()
}

/// 每 100ms 发送 1KB，完整响应约需 5 秒
fn slow_teleporter() -> Response {
    let chunks = futures::stream::iter(0..50u32).then(|i| async move {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok::<_, std::io::Error>(vec![0xab_u8; 1024])
    });
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

fn web_config(addr: SocketAddr, backup_dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.backup.destination_path = backup_dir.to_path_buf();
    config.pihole = Some(PiholeSettings {
        host: addr.ip().to_string(),
        connection_method: Strategy::Web,
        username: None,
        password: None,
        port: 22,
        web_port: addr.port(),
        use_https: false,
        web_password: Some("secret".to_string()),
    });
    config
}

/// v6 接口：JSON 会话 + 需要 Cookie 与 CSRF 头的 teleporter 端点
fn modern_pihole(method: &Method, target: &str, headers: &HeaderMap) -> Response {
    match (method.as_str(), target) {
        ("POST", "/api/auth") => (
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"session":{"valid":true,"totp":false,"sid":"s1d","csrf":"c5rf","validity":1800}}"#,
        )
            .into_response(),
        ("GET", "/api/teleporter") => {
            let cookie = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
            let csrf = headers.get("X-CSRF-TOKEN").and_then(|v| v.to_str().ok());
            if cookie == Some("sid=s1d; csrf=c5rf") && csrf == Some("c5rf") {
                (
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    gzip_body(5000),
                )
                    .into_response()
            } else {
                StatusCode::UNAUTHORIZED.into_response()
            }
        }
        _ => not_found(),
    }
}

#[tokio::test]
async fn legacy_auth_uses_legacy_endpoints_only() {
    let (addr, mock) = spawn_mock(|method, target, _| match (method.as_str(), target) {
        ("GET", "/admin/api.php?auth=secret&summary=") => {
            ([(header::CONTENT_TYPE, "application/json")], "{}").into_response()
        }
        ("GET", "/admin/scripts/pi-hole/php/teleporter.php?token=secret") => {
            gzip_body(2048).into_response()
        }
        _ => not_found(),
    })
    .await;

    let settings = WebSettings {
        port: addr.port(),
        use_https: false,
        password: "secret".to_string(),
    };
    let connection = ConnectionConfig::new(addr.ip().to_string(), ConnectionTarget::Web(settings));
    let client = WebAcquisitionClient::new(connection.web().unwrap()).unwrap();

    let session = client.authenticate().await.unwrap();
    assert_eq!(session.method(), AuthMethod::LegacyToken);
    assert_eq!(session.endpoint, "/admin/api.php");

    let archive = client.acquire().await.unwrap();
    assert_eq!(archive.bytes.len(), 2048);
    assert_eq!(archive.endpoint, "/admin/scripts/pi-hole/php/teleporter.php");

    let hits = mock.hits.lock().unwrap().clone();
    assert_eq!(
        hits,
        vec![
            "POST /api/auth",
            "POST /admin/api/auth",
            "GET /admin/api.php?auth=secret&summary=",
            "GET /admin/scripts/pi-hole/php/teleporter.php?token=secret",
        ]
    );
}

#[tokio::test]
async fn web_backup_end_to_end() {
    let (addr, mock) = spawn_mock(modern_pihole).await;
    let temp_dir = tempdir().unwrap();
    let backup_dir = temp_dir.path().join("backups");
    let ledger = Arc::new(JobLedger::new(temp_dir.path().join("jobs.json")));
    let orchestrator = BackupOrchestrator::new(ledger.clone());

    let outcome = orchestrator
        .run_backup(&web_config(addr, &backup_dir))
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.size, Some(5000));
    assert_eq!(outcome.method, Some(AcquisitionMethod::Web));
    let filename = outcome.filename.clone().unwrap();
    assert!(filename.starts_with("pi-hole_backup_"), "{filename}");
    assert!(filename.ends_with(".zip"));
    assert!(!filename.contains(':'));
    assert_eq!(std::fs::metadata(backup_dir.join(&filename)).unwrap().len(), 5000);

    let records = ledger.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, outcome.job_id);
    assert_eq!(records[0].status, JobStatus::Success);
    assert_eq!(records[0].extra.filename.as_deref(), Some(filename.as_str()));
    assert_eq!(records[0].extra.method.as_deref(), Some("web"));

    // 会话认证后只访问了 v6 下载端点
    let hits = mock.hits.lock().unwrap().clone();
    assert_eq!(hits, vec!["POST /api/auth", "GET /api/teleporter"]);
}

#[tokio::test]
async fn html_everywhere_fails_backup() {
    let (addr, _mock) = spawn_mock(|_, _, _| html_page()).await;
    let temp_dir = tempdir().unwrap();
    let backup_dir = temp_dir.path().join("backups");
    let ledger = Arc::new(JobLedger::new(temp_dir.path().join("jobs.json")));
    let orchestrator = BackupOrchestrator::new(ledger.clone());

    let outcome = orchestrator
        .run_backup(&web_config(addr, &backup_dir))
        .await;

    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert!(error.contains("failed to retrieve backup"), "{error}");
    assert!(error.contains("HTML"), "{error}");
    assert!(list_archives(&backup_dir).unwrap().is_empty());

    let records = ledger.list().await.unwrap();
    assert_eq!(records[0].status, JobStatus::Error);
    assert_eq!(records[0].message, error);
}

#[tokio::test]
async fn unreachable_auth_reports_all_methods_failed() {
    let (addr, mock) = spawn_mock(|_, _, _| not_found()).await;
    let settings = WebSettings {
        port: addr.port(),
        use_https: false,
        password: "secret".to_string(),
    };
    let connection = ConnectionConfig::new(addr.ip().to_string(), ConnectionTarget::Web(settings));
    let client = WebAcquisitionClient::new(connection.web().unwrap()).unwrap();

    let err = client.acquire().await.unwrap_err();
    assert_eq!(err.user_message(), "all authentication methods failed");
    assert_eq!(mock.hits.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn hybrid_falls_back_to_ssh() {
    let (addr, _mock) = spawn_mock(|_, _, _| not_found()).await;
    let closed_port = {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let temp_dir = tempdir().unwrap();
    let mut config = web_config(addr, &temp_dir.path().join("backups"));
    if let Some(pihole) = config.pihole.as_mut() {
        pihole.connection_method = Strategy::Hybrid;
        pihole.username = Some("pi".to_string());
        pihole.password = Some("raspberry".to_string());
        pihole.port = closed_port;
    }

    let ledger = Arc::new(JobLedger::new(temp_dir.path().join("jobs.json")));
    let outcome = BackupOrchestrator::new(ledger).run_backup(&config).await;

    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert!(error.contains("all authentication methods failed"), "{error}");
    assert!(error.contains("ssh fallback failed"), "{error}");
}

#[tokio::test]
async fn named_backup_with_retention() {
    let (addr, _mock) = spawn_mock(modern_pihole).await;
    let temp_dir = tempdir().unwrap();
    let backup_dir = temp_dir.path().join("backups");
    std::fs::create_dir_all(&backup_dir).unwrap();

    for (i, name) in ["old_1.zip", "old_2.zip", "old_3.zip"].iter().enumerate() {
        let path = backup_dir.join(name);
        std::fs::write(&path, b"PK\x03\x04").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600 * (i as u64 + 1)))
            .unwrap();
    }

    let config = web_config(addr, &backup_dir);
    let connection = ConnectionConfig::from_app_config(&config).unwrap();
    let storage = BackupSettings {
        destination_path: backup_dir.clone(),
        max_backups: 2,
    };

    let ledger = Arc::new(JobLedger::new(temp_dir.path().join("jobs.json")));
    let outcome = BackupOrchestrator::new(ledger.clone())
        .run_backup_with_connection(
            &connection,
            &storage,
            Some("before upgrade!"),
            Some("manual snapshot"),
        )
        .await;

    assert!(outcome.success, "{:?}", outcome.error);
    let filename = outcome.filename.unwrap();
    assert!(filename.starts_with("before_upgrade_"), "{filename}");

    let remaining: Vec<String> = list_archives(&backup_dir)
        .unwrap()
        .into_iter()
        .map(|entry| entry.filename)
        .collect();
    assert_eq!(remaining, vec![filename, "old_1.zip".to_string()]);

    let records = ledger.list().await.unwrap();
    assert!(records[0].message.contains("manual snapshot"));
}

#[tokio::test]
async fn shutdown_during_slow_download_leaves_no_file() {
    let (addr, mock) = spawn_mock(|method, target, headers| match (method.as_str(), target) {
        ("GET", "/api/teleporter") => slow_teleporter(),
        _ => modern_pihole(method, target, headers),
    })
    .await;
    let temp_dir = tempdir().unwrap();
    let backup_dir = temp_dir.path().join("backups");
    let ledger = Arc::new(JobLedger::new(temp_dir.path().join("jobs.json")));
    let token = CancellationToken::new();
    let orchestrator = BackupOrchestrator::new(ledger.clone()).with_shutdown(token.clone());

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let outcome = orchestrator
        .run_backup(&web_config(addr, &backup_dir))
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("backup cancelled"));
    assert!(!orchestrator.is_running());
    assert!(
        mock.hits
            .lock()
            .unwrap()
            .contains(&"GET /api/teleporter".to_string())
    );

    // 备份目录中既没有备份也没有残留的临时文件
    assert!(list_archives(&backup_dir).unwrap().is_empty());
    assert_eq!(std::fs::read_dir(&backup_dir).unwrap().count(), 0);

    let records = ledger.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Error);
    assert_eq!(records[0].message, "backup cancelled");
}
