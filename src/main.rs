//! AxoIngest server binary.
//!
//! A single-node upload service: requests pass an admission gate (shared
//! secret, rate limit, concurrency limit, storage capacity), uploads stream to
//! disk under a storage root, and in-flight transfers can be polled for
//! progress. A background task keeps an approximate storage usage figure
//! current for the capacity check.

mod admission;
mod background;
mod config;
mod error;
mod estimator;
mod files;
mod http;
mod logging;
mod registry;
mod storage;
mod tls;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::admission::AdmissionGate;
use crate::background::spawn_background_tasks;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::estimator::StorageEstimator;
use crate::files::DocFile;
use crate::http::build_cors_layer;
use crate::registry::UploadRegistry;
use crate::storage::Storage;

shadow!(build);

/// Starts the AxoIngest server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    let storage = Arc::new(Storage::new(args.root_path()));
    storage.ensure_root().await?;
    let estimator = Arc::new(StorageEstimator::new(args.root_path()));
    let registry = Arc::new(UploadRegistry::new());
    let gate = Arc::new(AdmissionGate::new(
        args.admission_config(),
        estimator.clone(),
    ));
    let doc = DocFile(args.doc_file.as_ref().map(PathBuf::from));

    let mut app = build_router(storage, registry, gate, doc);

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .bind
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let tls_config = tls::build_rustls_config(&args).await?;
    let handle = Handle::new();
    let cancel = CancellationToken::new();
    let estimator_task =
        spawn_background_tasks(estimator, args.estimate_interval(), cancel.clone());

    tokio::spawn(shutdown_signal(handle.clone()));

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let result = match tls_config {
        Some(tls_config) => {
            info!("🔒 Starting HTTPS server at {}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(service)
                .await
        }
        None => {
            info!("🚀 Starting HTTP server at {}", addr);
            axum_server::bind(addr).handle(handle).serve(service).await
        }
    };

    cancel.cancel();
    background::join_background_task(estimator_task).await;
    result
}

/// Routes plus the shared layer stack; CORS is added by the caller.
fn build_router(
    storage: Arc<Storage>,
    registry: Arc<UploadRegistry>,
    gate: Arc<AdmissionGate>,
    doc: DocFile,
) -> Router {
    let static_files = ServeDir::new(storage.root_path());
    Router::new()
        .route(
            "/upload/{*path}",
            post(upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/progress/{*path}", get(upload::upload_progress))
        .route("/list", get(files::list_root))
        .route("/list/{*path}", get(files::list_files))
        .route("/delete/{*path}", delete(files::delete_entry))
        .route("/version", get(version::get_version_info))
        .route("/", get(files::serve_doc))
        .nest_service("/static", static_files)
        .layer(middleware::from_fn(admission::admission_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = http::client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(registry))
        .layer(Extension(gate))
        .layer(Extension(doc))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, AdmissionRequest};
    use crate::config::{CREDENTIAL_HEADER, MIB};
    use crate::estimator::FixedUsage;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, StatusCode, header};
    use axum::response::Response;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    struct TestApp {
        _temp: TempDir,
        storage: Arc<Storage>,
        gate: Arc<AdmissionGate>,
        usage: Arc<FixedUsage>,
        router: Router,
    }

    impl TestApp {
        fn new(config: AdmissionConfig) -> Self {
            let temp = tempdir().expect("tempdir");
            let storage = Arc::new(Storage::new(temp.path().to_path_buf()));
            let usage = Arc::new(FixedUsage::new(0));
            let gate = Arc::new(AdmissionGate::new(config, usage.clone()));
            let router = build_router(
                storage.clone(),
                Arc::new(UploadRegistry::new()),
                gate.clone(),
                DocFile(None),
            );
            Self {
                _temp: temp,
                storage,
                gate,
                usage,
                router,
            }
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.router
                .clone()
                .oneshot(request)
                .await
                .expect("router is infallible")
        }
    }

    fn config() -> AdmissionConfig {
        AdmissionConfig {
            credential: "secret".into(),
            rate_per_sec: 1000.0,
            burst: 1000,
            max_concurrency: 4,
            max_queue_wait: Duration::from_millis(20),
            max_file_size: 200 * MIB,
            max_storage_size: 1000 * MIB,
        }
    }

    fn upload(
        path: &str,
        password: Option<&str>,
        declared: u64,
        body: &'static [u8],
    ) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("/upload/{path}"))
            .header(header::CONTENT_LENGTH, declared);
        if let Some(password) = password {
            builder = builder.header(CREDENTIAL_HEADER, password);
        }
        builder.body(Body::from(body)).expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    #[tokio::test]
    async fn accepted_upload_lands_on_disk_and_reads_need_no_credential() {
        let app = TestApp::new(config());

        let response = app
            .send(upload("docs/a.txt", Some("secret"), 5, b"hello"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "/docs/a.txt upload finish, 5 bytes\n"
        );
        let on_disk = std::fs::read(app.storage.root_path().join("docs/a.txt")).expect("read");
        assert_eq!(on_disk, b"hello");

        let listing = app.send(get("/list/docs")).await;
        assert_eq!(listing.status(), StatusCode::OK);
        assert!(body_text(listing).await.contains("a.txt"));
    }

    #[tokio::test]
    async fn missing_or_wrong_credential_is_unauthorized() {
        let app = TestApp::new(config());

        let missing = app.send(upload("x.bin", None, 1, b"x")).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let wrong = app.send(upload("x.bin", Some("guess"), 1, b"x")).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let delete = app
            .send(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/delete/x.bin")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await;
        assert_eq!(delete.status(), StatusCode::UNAUTHORIZED);
        assert!(!app.storage.root_path().join("x.bin").exists());
    }

    #[tokio::test]
    async fn capacity_rejections_map_to_413_and_507() {
        let app = TestApp::new(config());

        let too_large = app
            .send(upload("big.bin", Some("secret"), 300 * MIB, b"x"))
            .await;
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let accepted = app.send(upload("small.bin", Some("secret"), 3, b"abc")).await;
        assert_eq!(accepted.status(), StatusCode::OK);

        app.usage.set(995 * MIB);
        let full = app
            .send(upload("more.bin", Some("secret"), 10 * MIB, b"x"))
            .await;
        assert_eq!(full.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert!(!app.storage.root_path().join("more.bin").exists());
    }

    #[tokio::test]
    async fn reads_consume_rate_budget_and_excess_gets_retry_after() {
        let app = TestApp::new(AdmissionConfig {
            rate_per_sec: 0.0,
            burst: 2,
            ..config()
        });

        assert_eq!(app.send(get("/list")).await.status(), StatusCode::OK);
        assert_eq!(app.send(get("/list")).await.status(), StatusCode::OK);

        let throttled = app.send(get("/list")).await;
        assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            throttled
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok()),
            Some("1")
        );
        let late = app.send(upload("late.bin", Some("secret"), 1, b"x")).await;
        assert_eq!(late.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn saturated_slots_answer_503_until_one_frees() {
        let app = TestApp::new(AdmissionConfig {
            max_concurrency: 1,
            ..config()
        });
        let held = app
            .gate
            .admit(&AdmissionRequest {
                mutating: false,
                credential: None,
                declared_length: None,
            })
            .await
            .expect("hold the only slot");

        let busy = app.send(get("/list")).await;
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);

        drop(held);
        assert_eq!(app.send(get("/list")).await.status(), StatusCode::OK);
    }
}
