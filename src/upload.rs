//! 上传请求处理：封禁检查 → 口令校验 → 频率限制 → 落盘。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{Method, Request};
use axum::response::{Html, Response};
use axum::middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::DropError;
use crate::form::UploadForm;
use crate::frontend::render_report;
use crate::guard::{AbuseGuard, FailureOutcome, UploadDenied};
use crate::http::client_ip;
use crate::ingest::ingest;
use crate::session::SessionAuthenticator;
use crate::storage::UploadDir;

/// 封禁中间件：被封禁地址的 POST 在读取请求体之前即被拒绝。
pub async fn block_gate(
    Extension(guard): Extension<Arc<AbuseGuard>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, DropError> {
    if req.method() == Method::POST && guard.is_blocked(client_ip(addr)).await {
        info!(client_ip = %client_ip(addr), "rejected blocked address");
        return Err(DropError::AlreadyBlocked);
    }
    Ok(next.run(req).await)
}

/// POST `/`：校验口令后保存上传的文件。
pub async fn upload_files(
    Extension(session): Extension<Arc<SessionAuthenticator>>,
    Extension(guard): Extension<Arc<AbuseGuard>>,
    Extension(upload_dir): Extension<Arc<UploadDir>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut form: UploadForm,
) -> Result<Html<String>, DropError> {
    let client_ip = client_ip(addr);
    if guard.is_blocked(client_ip).await {
        return Err(DropError::AlreadyBlocked);
    }

    let code = form.read_secret_code().await?.unwrap_or_default();
    if !session.validate(&code) {
        return match guard.record_failed_attempt(client_ip).await {
            FailureOutcome::AlreadyBlocked => Err(DropError::AlreadyBlocked),
            FailureOutcome::Counted { .. } | FailureOutcome::Blocked => {
                Err(DropError::AuthFailed)
            }
        };
    }
    guard.record_success(client_ip).await;

    // 请求体读取期间地址可能已被封禁，落盘前由 guard 在记录锁内复查。
    guard
        .record_upload_attempt(client_ip)
        .await
        .map_err(|denied| match denied {
            UploadDenied::Blocked => DropError::AlreadyBlocked,
            UploadDenied::RateExceeded(retry_after) => {
                DropError::RateExceeded(retry_after_secs(retry_after))
            }
        })?;

    let report = ingest(&mut form, &upload_dir, client_ip).await?;
    info!(
        client_ip = %client_ip,
        stored = report.stored.len(),
        skipped = report.skipped.len(),
        "upload finished"
    );
    Ok(Html(render_report(&report)))
}

fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::form::test_support::{TestPart, upload_form};
    use crate::guard::GuardConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _temp: TempDir,
        session: Arc<SessionAuthenticator>,
        guard: Arc<AbuseGuard>,
        upload_dir: Arc<UploadDir>,
    }

    async fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("drop");
        let guard = AbuseGuard::load(
            GuardConfig::default(),
            root.join(".filedrop").join("blocked_ips.txt"),
        )
        .await
        .expect("load guard");
        Fixture {
            session: Arc::new(SessionAuthenticator::with_code("482913".into())),
            guard: Arc::new(guard),
            upload_dir: Arc::new(UploadDir::new(root, [".filedrop".to_string()])),
            _temp: temp,
        }
    }

    async fn post(fixture: &Fixture, addr: SocketAddr, parts: &[TestPart<'_>]) -> Result<Html<String>, DropError> {
        upload_files(
            Extension(fixture.session.clone()),
            Extension(fixture.guard.clone()),
            Extension(fixture.upload_dir.clone()),
            ConnectInfo(addr),
            upload_form(parts).await,
        )
        .await
    }

    fn peer(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 50_000)
    }

    #[tokio::test]
    async fn correct_code_stores_files() {
        let fixture = fixture().await;
        let result = post(
            &fixture,
            peer(2),
            &[
                TestPart::Text("secret_code", "482913"),
                TestPart::File("file", "hello.txt", b"hello"),
            ],
        )
        .await;

        let Html(body) = result.unwrap_or_else(|err| panic!("upload failed: {err}"));
        assert!(body.contains("hello.txt"));
        let stored = fixture.upload_dir.root_path().join("hello.txt");
        assert_eq!(std::fs::read(stored).expect("read"), b"hello");
    }

    #[tokio::test]
    async fn wrong_code_counts_failure_and_writes_nothing() {
        let fixture = fixture().await;
        let result = post(
            &fixture,
            peer(3),
            &[
                TestPart::Text("secret_code", "000000"),
                TestPart::File("file", "hello.txt", b"hello"),
            ],
        )
        .await;

        assert!(matches!(result, Err(DropError::AuthFailed)));
        assert_eq!(fixture.guard.failed_attempts(peer(3).ip()).await, 1);
        assert!(!fixture.upload_dir.root_path().join("hello.txt").exists());
    }

    #[tokio::test]
    async fn missing_file_after_valid_code_is_rejected() {
        let fixture = fixture().await;
        let result = post(&fixture, peer(4), &[TestPart::Text("secret_code", "482913")]).await;
        assert!(matches!(result, Err(DropError::NoFileProvided)));
    }

    #[tokio::test]
    async fn fourth_upload_in_window_is_rate_limited() {
        let fixture = fixture().await;
        let parts = [
            TestPart::Text("secret_code", "482913"),
            TestPart::File("file", "a.txt", b"a"),
        ];
        for _ in 0..3 {
            assert!(post(&fixture, peer(5), &parts).await.is_ok());
        }
        let result = post(&fixture, peer(5), &parts).await;
        assert!(matches!(result, Err(DropError::RateExceeded(secs)) if secs > 0 && secs <= 60));
        assert!(post(&fixture, peer(6), &parts).await.is_ok());
    }

    #[tokio::test]
    async fn address_blocked_mid_request_stores_nothing() {
        use crate::form::test_support::{BOUNDARY, multipart_body};
        use axum::extract::{FromRequest, Request};
        use axum::http::header;
        use futures_util::stream;
        use tokio::sync::oneshot;

        let fixture = fixture().await;
        let client = peer(7);
        let (release, gate) = oneshot::channel::<()>();
        let body = multipart_body(&[
            TestPart::Text("secret_code", "482913"),
            TestPart::File("file", "late.txt", b"late"),
        ]);
        let chunks = stream::once(async move {
            let _ = gate.await;
            Ok::<_, std::io::Error>(body)
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from_stream(chunks))
            .expect("build request");
        let form = UploadForm::from_request(request, &()).await.expect("extract form");

        let pending = tokio::spawn(upload_files(
            Extension(fixture.session.clone()),
            Extension(fixture.guard.clone()),
            Extension(fixture.upload_dir.clone()),
            ConnectInfo(client),
            form,
        ));
        // 让处理函数先通过入口处的封禁检查并阻塞在请求体上。
        tokio::task::yield_now().await;

        for _ in 0..5 {
            fixture.guard.record_failed_attempt(client.ip()).await;
        }
        assert!(fixture.guard.is_blocked(client.ip()).await);
        release.send(()).expect("release body");

        let result = pending.await.expect("handler task");
        assert!(matches!(result, Err(DropError::AlreadyBlocked)));
        assert!(!fixture.upload_dir.root_path().join("late.txt").exists());
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1_500)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(30)), 30);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
    }
}
