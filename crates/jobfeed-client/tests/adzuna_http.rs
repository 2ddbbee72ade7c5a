//! AdzunaSource against an in-process axum server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::get;
use jobfeed_client::{AdzunaConfig, AdzunaSource};
use jobfeed_core::error::AppError;
use jobfeed_core::traits::JobSource;
use serde_json::json;

const ROUTE: &str = "/v1/api/jobs/{country}/search/{page}";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(app: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{addr}/v1/api/jobs");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn source(&self) -> AdzunaSource {
        AdzunaSource::new(
            AdzunaConfig::new("test-id", "test-key")
                .with_base_url(&self.base_url)
                .with_results_per_page(2)
                .with_timeout(Duration::from_millis(500)),
        )
        .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Server that answers every search with a fixed status, headers and body.
async fn canned(status: StatusCode, headers: HeaderMap, body: &'static str) -> TestServer {
    let app = Router::new().route(
        ROUTE,
        get(move || {
            let headers = headers.clone();
            async move { (status, headers, body) }
        }),
    );
    TestServer::spawn(app).await
}

#[tokio::test]
async fn fetch_parses_results_and_sends_credentials() {
    let seen: Arc<Mutex<Vec<(String, u32, HashMap<String, String>)>>> = Arc::default();
    let recorder = seen.clone();
    let app = Router::new().route(
        ROUTE,
        get(
            move |Path((country, page)): Path<(String, u32)>,
                  Query(params): Query<HashMap<String, String>>| {
                let recorder = recorder.clone();
                async move {
                    recorder.lock().unwrap().push((country, page, params));
                    axum::Json(json!({
                        "count": 5,
                        "results": [
                            {"id": "101", "title": "Data Engineer", "location": {"display_name": "London"}},
                            {"id": 102, "title": "Platform Engineer"}
                        ]
                    }))
                }
            },
        ),
    );
    let server = TestServer::spawn(app).await;

    let page = server.source().fetch("data engineer", 2).await.unwrap();

    assert_eq!(page.records.len(), 2);
    assert!(page.has_more);
    assert_eq!(page.records[0].id(), "101");
    assert_eq!(page.records[0].title(), "Data Engineer");
    assert_eq!(
        page.records[0].payload()["location"]["display_name"],
        "London"
    );
    assert_eq!(page.records[1].id(), "102");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (country, page_no, params) = &seen[0];
    assert_eq!(country, "gb");
    assert_eq!(*page_no, 2);
    assert_eq!(params["app_id"], "test-id");
    assert_eq!(params["app_key"], "test-key");
    assert_eq!(params["results_per_page"], "2");
    assert_eq!(params["what"], "data engineer");
}

#[tokio::test]
async fn last_page_reports_no_more_results() {
    let server = canned(
        StatusCode::OK,
        HeaderMap::new(),
        r#"{"count": 3, "results": [{"id": "5", "title": "Analyst"}]}"#,
    )
    .await;

    let page = server.source().fetch("analyst", 2).await.unwrap();

    assert_eq!(page.records.len(), 1);
    assert!(!page.has_more);
}

#[tokio::test]
async fn results_without_ids_still_count_as_received() {
    let server = canned(
        StatusCode::OK,
        HeaderMap::new(),
        r#"{"count": 10, "results": [{"title": "No id"}, {"id": " ", "title": "Blank id"}]}"#,
    )
    .await;

    let page = server.source().fetch("rust", 1).await.unwrap();

    assert!(page.records.is_empty());
    assert_eq!(page.received, 2);
    assert!(page.has_more);
}

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    let server = canned(StatusCode::UNAUTHORIZED, HeaderMap::new(), "denied").await;

    let err = server.source().fetch("rust", 1).await.unwrap_err();

    assert!(matches!(err, AppError::AuthError(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn too_many_requests_carries_retry_after_hint() {
    let mut headers = HeaderMap::new();
    headers.insert(header::RETRY_AFTER, "30".parse().unwrap());
    let server = canned(StatusCode::TOO_MANY_REQUESTS, headers, "slow down").await;

    let err = server.source().fetch("rust", 1).await.unwrap_err();

    match err {
        AppError::RateLimitExceeded { retry_after } => {
            assert_eq!(retry_after, Some(Duration::from_secs(30)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_error_is_transient() {
    let server = canned(StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), "").await;

    let err = server.source().fetch("rust", 1).await.unwrap_err();

    assert!(matches!(err, AppError::NetworkError(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn unparseable_body_is_malformed() {
    let server = canned(StatusCode::OK, HeaderMap::new(), "<html>maintenance</html>").await;

    let err = server.source().fetch("rust", 1).await.unwrap_err();

    assert!(matches!(err, AppError::MalformedResponse(_)));
}

#[tokio::test]
async fn slow_server_times_out() {
    let app = Router::new().route(
        ROUTE,
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "too late"
        }),
    );
    let server = TestServer::spawn(app).await;

    let err = server.source().fetch("rust", 1).await.unwrap_err();

    assert!(matches!(err, AppError::Timeout(_)));
}

#[tokio::test]
async fn refused_connection_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = AdzunaSource::new(
        AdzunaConfig::new("id", "key").with_base_url(format!("http://{addr}/v1/api/jobs")),
    )
    .unwrap();

    let err = source.fetch("rust", 1).await.unwrap_err();

    assert!(matches!(err, AppError::NetworkError(_)));
}
