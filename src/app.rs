//! 路由装配：浏览、上传、指标与公共中间件。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::config::Settings;
use crate::http::{add_security_headers, record_duration, resolve_client_ip};
use crate::metrics::{Metrics, metrics_handler};
use crate::storage::Storage;
use crate::{files, upload};

/// 构建完整的应用路由。
pub fn build_router(storage: Arc<Storage>, settings: Arc<Settings>, metrics: Arc<Metrics>) -> Router {
    let tracked = Router::new()
        .route(
            "/upload",
            post(upload::upload_file)
                .fallback(upload::upload_other_method)
                .layer(DefaultBodyLimit::disable()),
        )
        .fallback(files::browse)
        .layer(middleware::from_fn(record_duration));

    Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(tracked)
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(settings))
        .layer(Extension(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;
    use axum::body::Body;
    use axum::http::{Method, StatusCode, header};
    use axum::response::Response;
    use http_body_util::BodyExt;
    use std::path::Path;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-FILEBROWSER-BOUNDARY";

    struct TestApp {
        _temp: tempfile::TempDir,
        root: std::path::PathBuf,
        metrics: Arc<Metrics>,
        router: Router,
    }

    fn make_app(configure: impl FnOnce(&mut Settings)) -> TestApp {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("files");
        std::fs::create_dir_all(&root).expect("create root");
        let mut settings = test_settings(root.clone());
        configure(&mut settings);
        let storage = Arc::new(Storage::new(root.clone()).expect("storage"));
        let metrics = Arc::new(Metrics::new());
        let router = build_router(storage, Arc::new(settings), metrics.clone());
        TestApp {
            _temp: temp,
            root,
            metrics,
            router,
        }
    }

    async fn send(app: &TestApp, request: Request<Body>) -> Response {
        app.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    async fn get_path(app: &TestApp, path: &str) -> Response {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request");
        send(app, request).await
    }

    async fn body_text(response: Response) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .expect("location header")
    }

    fn multipart_body(dir: Option<&str>, file_name: &str, content: &str) -> String {
        let mut body = String::new();
        if let Some(dir) = dir {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"dir\"\r\n\r\n{dir}\r\n"
            ));
        }
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{content}\r\n--{BOUNDARY}--\r\n"
        ));
        body
    }

    fn file_first_body(dir: &str, file_name: &str, content: &str) -> String {
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{content}\r\n--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"dir\"\r\n\r\n{dir}\r\n--{BOUNDARY}--\r\n"
        )
    }

    fn upload_request(body: String) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    fn count_entries(path: &Path) -> usize {
        std::fs::read_dir(path).expect("read dir").count()
    }

    #[tokio::test]
    async fn root_listing_renders_entries() {
        let app = make_app(|_| {});
        std::fs::create_dir(app.root.join("docs")).expect("docs");
        std::fs::write(app.root.join("readme.txt"), b"hi").expect("readme");

        let response = get_path(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS),
            Some(&axum::http::HeaderValue::from_static("nosniff"))
        );
        let body = body_text(response).await;
        let docs = body.find(r#"href="docs/""#).expect("docs link");
        let readme = body.find(r#"href="readme.txt""#).expect("readme link");
        assert!(docs < readme);
        assert_eq!(app.metrics.snapshot().directory_lists, 1);
    }

    #[tokio::test]
    async fn directories_without_slash_redirect() {
        let app = make_app(|_| {});
        for dir in ["a", "a/b", "my dir", "x.y"] {
            std::fs::create_dir_all(app.root.join(dir)).expect("dir");
        }

        for path in ["/a", "/a/b", "/my%20dir", "/x.y"] {
            let response = get_path(&app, path).await;
            assert_eq!(response.status(), StatusCode::FOUND, "{path}");
            assert_eq!(location(&response), format!("{path}/"));
        }
    }

    #[tokio::test]
    async fn doubled_slashes_are_collapsed() {
        let app = make_app(|_| {});
        let response = get_path(&app, "//a//b/").await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(location(&response), "/a/b/");
    }

    #[tokio::test]
    async fn encoded_doubled_slashes_are_not_found() {
        let app = make_app(|_| {});
        std::fs::create_dir_all(app.root.join("a").join("b")).expect("a/b");

        let response = get_path(&app, "/a%2F%2Fb/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_text(response).await;
        assert!(!body.contains(r#"href="/a//""#));
        assert_eq!(app.metrics.snapshot().requests_error, 1);
    }

    #[tokio::test]
    async fn files_are_streamed_with_content_type() {
        let app = make_app(|_| {});
        std::fs::write(app.root.join("notes.txt"), b"hello world").expect("notes");

        let response = get_path(&app, "/notes.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some("text/plain; charset=utf-8")
        );
        assert!(response.headers().contains_key(header::ETAG));
        assert_eq!(body_text(response).await, "hello world");
        assert_eq!(app.metrics.snapshot().file_serves, 1);
    }

    #[tokio::test]
    async fn range_and_conditional_requests() {
        let app = make_app(|_| {});
        std::fs::write(app.root.join("data.bin"), b"0123456789").expect("data");

        let request = Request::builder()
            .uri("/data.bin")
            .header(header::RANGE, "bytes=2-4")
            .body(Body::empty())
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let etag = response
            .headers()
            .get(header::ETAG)
            .cloned()
            .expect("etag");
        assert_eq!(body_text(response).await, "234");

        let request = Request::builder()
            .uri("/data.bin")
            .header(header::IF_NONE_MATCH, etag)
            .body(Body::empty())
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn traversal_and_missing_paths_are_not_found() {
        let app = make_app(|_| {});
        let secret = app.root.parent().expect("parent").join("secret.txt");
        std::fs::write(&secret, b"secret").expect("secret");

        for path in ["/../secret.txt", "/a/../../secret.txt", "/%2e%2e/secret.txt", "/missing.txt"] {
            let response = get_path(&app, path).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
            let body = body_text(response).await;
            assert!(!body.contains("secret"), "{path} leaked: {body}");
            assert!(!body.contains(app.root.to_string_lossy().as_ref()));
        }
    }

    #[tokio::test]
    async fn file_with_trailing_slash_is_not_found() {
        let app = make_app(|_| {});
        std::fs::write(app.root.join("a.txt"), b"a").expect("a");
        let response = get_path(&app, "/a.txt/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_root_is_a_server_error() {
        let app = make_app(|_| {});
        std::fs::remove_dir_all(&app.root).expect("remove root");
        let response = get_path(&app, "/anything").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "files directory is missing");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_directory_is_a_server_error() {
        use std::os::unix::fs::PermissionsExt;

        let app = make_app(|_| {});
        let locked = app.root.join("locked");
        std::fs::create_dir(&locked).expect("locked");
        let set_mode = |mode| {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(mode)).expect("chmod")
        };
        set_mode(0o000);
        if std::fs::read_dir(&locked).is_ok() {
            set_mode(0o755);
            return;
        }

        let response = get_path(&app, "/locked/").await;
        set_mode(0o755);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "error reading directory");
    }

    #[tokio::test]
    async fn upload_disabled_is_forbidden_and_writes_nothing() {
        let app = make_app(|_| {});
        let body = multipart_body(Some("/"), "new.txt", "payload");
        let response = send(&app, upload_request(body)).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(count_entries(&app.root), 0);
        let snapshot = app.metrics.snapshot();
        assert_eq!(snapshot.uploads_total, 1);
        assert_eq!(snapshot.uploads_error, 1);
    }

    #[tokio::test]
    async fn upload_flattens_file_name_into_target_dir() {
        let app = make_app(|s| s.upload_enabled = true);
        let body = multipart_body(Some("/sub/"), "a/b/evil.txt", "payload");
        let response = send(&app, upload_request(body)).await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/sub/");
        let stored = app.root.join("sub").join("a_b_evil.txt");
        assert_eq!(std::fs::read_to_string(stored).expect("stored"), "payload");
        assert!(!app.root.join("sub").join("a").exists());
        assert_eq!(app.metrics.snapshot().uploads_success, 1);
    }

    #[tokio::test]
    async fn upload_defaults_to_root_and_overwrites() {
        let app = make_app(|s| s.upload_enabled = true);
        std::fs::write(app.root.join("same.txt"), b"old").expect("old");

        let body = multipart_body(Some(""), "same.txt", "new");
        let response = send(&app, upload_request(body)).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");
        assert_eq!(
            std::fs::read_to_string(app.root.join("same.txt")).expect("read"),
            "new"
        );
    }

    #[tokio::test]
    async fn upload_outside_root_is_forbidden() {
        let app = make_app(|s| s.upload_enabled = true);
        let body = multipart_body(Some("../escape"), "x.txt", "payload");
        let response = send(&app, upload_request(body)).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let parent = app.root.parent().expect("parent");
        assert!(!parent.join("escape").exists());
    }

    #[tokio::test]
    async fn upload_with_file_before_dir_lands_in_dir() {
        let app = make_app(|s| s.upload_enabled = true);
        let body = file_first_body("/sub/", "x.txt", "payload");
        let response = send(&app, upload_request(body)).await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/sub/");
        assert_eq!(
            std::fs::read_to_string(app.root.join("sub").join("x.txt")).expect("stored"),
            "payload"
        );
        assert!(!app.root.join("x.txt").exists());
        assert_eq!(count_entries(&app.root), 1);
    }

    #[tokio::test]
    async fn upload_with_file_before_escaping_dir_leaves_nothing() {
        let app = make_app(|s| s.upload_enabled = true);
        let body = file_first_body("../escape", "x.txt", "payload");
        let response = send(&app, upload_request(body)).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(count_entries(&app.root), 0);
        let parent = app.root.parent().expect("parent");
        assert!(!parent.join("escape").exists());
    }

    #[tokio::test]
    async fn upload_without_dir_field_goes_to_root() {
        let app = make_app(|s| s.upload_enabled = true);
        let body = multipart_body(None, "solo.txt", "payload");
        let response = send(&app, upload_request(body)).await;

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");
        assert_eq!(
            std::fs::read_to_string(app.root.join("solo.txt")).expect("stored"),
            "payload"
        );
        assert_eq!(count_entries(&app.root), 1);
    }

    #[tokio::test]
    async fn upload_without_multipart_is_bad_request() {
        let app = make_app(|s| s.upload_enabled = true);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .body(Body::from("not a form"))
            .expect("request");
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_get_redirects_to_root_when_enabled() {
        let enabled = make_app(|s| s.upload_enabled = true);
        let response = get_path(&enabled, "/upload").await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");

        let disabled = make_app(|_| {});
        let response = get_path(&disabled, "/upload").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn metrics_endpoint_respects_toggle() {
        let disabled = make_app(|_| {});
        let response = get_path(&disabled, "/metrics").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let enabled = make_app(|s| s.metrics_enabled = true);
        let response = get_path(&enabled, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("filebrowser_http_requests_total{status=\"total\"} 0"));
    }

    #[tokio::test]
    async fn counters_only_grow_and_stay_consistent() {
        let app = make_app(|s| s.metrics_enabled = true);
        std::fs::create_dir(app.root.join("dir")).expect("dir");
        std::fs::write(app.root.join("f.txt"), b"f").expect("file");

        let mut previous = app.metrics.snapshot();
        for path in ["/", "/dir", "/dir/", "/f.txt", "/missing", "/../x", "/metrics"] {
            let _ = get_path(&app, path).await;
            let current = app.metrics.snapshot();
            assert!(current.requests_total >= previous.requests_total);
            assert!(current.requests_success >= previous.requests_success);
            assert!(current.requests_error >= previous.requests_error);
            assert!(current.requests_success + current.requests_error <= current.requests_total);
            previous = current;
        }
        assert_eq!(previous.requests_total, 6);
        assert_eq!(previous.requests_success, 3);
        assert_eq!(previous.requests_error, 2);
    }
}
