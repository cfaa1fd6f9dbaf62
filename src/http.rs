//! HTTP 辅助工具：CORS、界面静态资源、安全头与客户端 IP。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::{Router, middleware, response::IntoResponse, response::Response};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowOrigin, Any, CorsLayer};
use tower_http::services::fs::ServeFileSystemResponseBody;
use tower_http::services::{ServeDir, ServeFile};
use tracing::warn;

use crate::config::{CorsConf, UiConf};
use crate::prefix::{normalize_prefix, strip_path_prefix};

/// 构建 CORS Layer；未启用或来源列表无效时返回 None。
pub fn build_cors_layer(cors: &CorsConf) -> Option<CorsLayer> {
    if !cors.enabled {
        return None;
    }
    let origins = parse_list(&cors.allowed_origins, |origin| HeaderValue::from_str(origin).ok());
    let methods = parse_list(&cors.allowed_methods, |method| Method::from_bytes(method.as_bytes()).ok());
    let headers = parse_list(&cors.allowed_headers, |name| HeaderName::from_bytes(name.as_bytes()).ok());
    let exposed = parse_list(&cors.exposed_headers, |name| HeaderName::from_bytes(name.as_bytes()).ok());

    let mut layer = CorsLayer::new();
    layer = if has_wildcard(&cors.allowed_origins) {
        if cors.allow_credentials {
            warn!("wildcard cors origin cannot be combined with credentials, mirroring request origin");
            layer.allow_origin(AllowOrigin::mirror_request())
        } else {
            layer.allow_origin(Any)
        }
    } else if origins.is_empty() {
        warn!("cors enabled without valid origins");
        return None;
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    };
    layer = if methods.is_empty() {
        layer.allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
    } else {
        layer.allow_methods(methods)
    };
    if has_wildcard(&cors.allowed_headers) {
        layer = if cors.allow_credentials {
            warn!("wildcard cors headers cannot be combined with credentials, mirroring request headers");
            layer.allow_headers(AllowHeaders::mirror_request())
        } else {
            layer.allow_headers(Any)
        };
    } else if !headers.is_empty() {
        layer = layer.allow_headers(headers);
    }
    if has_wildcard(&cors.exposed_headers) && !cors.allow_credentials {
        layer = layer.expose_headers(Any);
    } else {
        if has_wildcard(&cors.exposed_headers) {
            warn!("wildcard cors exposed headers cannot be combined with credentials, ignoring it");
        }
        if !exposed.is_empty() {
            layer = layer.expose_headers(exposed);
        }
    }
    if cors.max_age > 0 {
        layer = layer.max_age(Duration::from_secs(cors.max_age));
    }
    Some(layer.allow_credentials(cors.allow_credentials))
}

fn has_wildcard(values: &[String]) -> bool {
    values.iter().any(|value| value.trim() == "*")
}

fn parse_list<T>(values: &[String], parse: impl Fn(&str) -> Option<T>) -> Vec<T> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty() && *value != "*")
        .filter_map(|value| {
            let parsed = parse(value);
            if parsed.is_none() {
                warn!(value, "invalid cors entry");
            }
            parsed
        })
        .collect()
}

/// 界面资源挂载点：`ui.path` 与 `/assets` 下的请求直接由界面目录响应。
#[derive(Clone, Debug)]
pub struct UiMount {
    prefix: String,
    source: PathBuf,
}

impl UiMount {
    pub fn from_conf(ui: &UiConf) -> Option<Self> {
        if !ui.enabled {
            return None;
        }
        if ui.source.trim().is_empty() {
            warn!("ui enabled without a source directory");
            return None;
        }
        Some(Self {
            prefix: normalize_prefix(&ui.path),
            source: PathBuf::from(&ui.source),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 把界面托管作为中间件安装到处理器外层。
    pub fn wrap(self, router: Router) -> Router {
        let mount = Arc::new(self);
        router.layer(middleware::from_fn(move |req: Request<AxumBody>, next: middleware::Next| {
            let mount = mount.clone();
            async move { mount.serve(req, next).await }
        }))
    }

    async fn serve(&self, req: Request<AxumBody>, next: middleware::Next) -> Response {
        let path = req.uri().path().to_string();
        if !self.prefix.is_empty()
            && let Some(rest) = strip_path_prefix(&path, &self.prefix)
        {
            let req = match rewrite_path(req, rest) {
                Ok(req) => req,
                Err(response) => return response,
            };
            let index = ServeFile::new(self.source.join("index.html"));
            return into_response(ServeDir::new(&self.source).fallback(index).try_call(req).await);
        }
        if let Some(rest) = strip_path_prefix(&path, "/assets") {
            let req = match rewrite_path(req, rest) {
                Ok(req) => req,
                Err(response) => return response,
            };
            return into_response(ServeDir::new(self.source.join("assets")).try_call(req).await);
        }
        next.run(req).await
    }
}

fn rewrite_path(req: Request<AxumBody>, rest: &str) -> Result<Request<AxumBody>, Response> {
    let (mut parts, body) = req.into_parts();
    parts.uri = format!("/{}", rest.trim_start_matches('/'))
        .parse()
        .map_err(|_| StatusCode::BAD_REQUEST.into_response())?;
    Ok(Request::from_parts(parts, body))
}

fn into_response(result: std::io::Result<Response<ServeFileSystemResponseBody>>) -> Response {
    match result {
        Ok(response) => response.map(AxumBody::new),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn inner_router() -> Router {
        Router::new().fallback(|| async { "inner" })
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(AxumBody::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = response.into_body().collect().await.expect("collect").to_bytes();
        (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    #[test]
    fn cors_layer_follows_config() {
        assert!(build_cors_layer(&CorsConf::default()).is_none());

        let no_origins = CorsConf {
            enabled: true,
            ..CorsConf::default()
        };
        assert!(build_cors_layer(&no_origins).is_none());

        let configured = CorsConf {
            enabled: true,
            allowed_origins: vec!["https://example.com".into()],
            allowed_methods: vec!["GET".into()],
            max_age: 60,
            ..CorsConf::default()
        };
        assert!(build_cors_layer(&configured).is_some());

        let wildcard = CorsConf {
            enabled: true,
            allowed_origins: vec!["*".into()],
            allow_credentials: true,
            ..CorsConf::default()
        };
        assert!(build_cors_layer(&wildcard).is_some());
    }

    #[tokio::test]
    async fn cors_preflight_is_answered() {
        let configured = CorsConf {
            enabled: true,
            allowed_origins: vec!["https://example.com".into()],
            ..CorsConf::default()
        };
        let layer = build_cors_layer(&configured).expect("layer");
        let response = inner_router()
            .layer(layer)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/file.txt")
                    .header(header::ORIGIN, "https://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://example.com"
        );
    }

    #[tokio::test]
    async fn cors_wildcard_headers_allow_custom_request_headers() {
        let configured = CorsConf {
            enabled: true,
            allowed_origins: vec!["https://example.com".into()],
            allowed_headers: vec!["*".into()],
            exposed_headers: vec!["*".into()],
            ..CorsConf::default()
        };
        let layer = build_cors_layer(&configured).expect("layer");
        let response = inner_router()
            .layer(layer)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/file.txt")
                    .header(header::ORIGIN, "https://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-custom")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS], "*");
    }

    #[tokio::test]
    async fn cors_wildcard_headers_with_credentials_mirror_request() {
        let configured = CorsConf {
            enabled: true,
            allowed_origins: vec!["https://example.com".into()],
            allowed_headers: vec!["*".into()],
            exposed_headers: vec!["*".into()],
            allow_credentials: true,
            ..CorsConf::default()
        };
        let layer = build_cors_layer(&configured).expect("layer");
        let response = inner_router()
            .layer(layer)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/file.txt")
                    .header(header::ORIGIN, "https://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "x-custom")
                    .body(AxumBody::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS], "x-custom");
    }

    #[tokio::test]
    async fn ui_mount_serves_assets_and_passes_other_requests() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("assets")).expect("mkdir");
        std::fs::write(temp.path().join("index.html"), b"index").expect("write");
        std::fs::write(temp.path().join("assets/app.js"), b"js").expect("write");

        let ui = UiConf {
            enabled: true,
            path: "/ui/".into(),
            source: temp.path().to_string_lossy().into_owned(),
        };
        let mount = UiMount::from_conf(&ui).expect("mount");
        assert_eq!(mount.prefix(), "/ui");
        let router = mount.wrap(inner_router());

        assert_eq!(get(router.clone(), "/ui/").await, (StatusCode::OK, "index".into()));
        assert_eq!(
            get(router.clone(), "/ui/some/route").await,
            (StatusCode::OK, "index".into())
        );
        assert_eq!(get(router.clone(), "/assets/app.js").await, (StatusCode::OK, "js".into()));
        assert_eq!(get(router, "/files/a.txt").await, (StatusCode::OK, "inner".into()));
    }

    #[test]
    fn ui_mount_requires_enabled_source() {
        assert!(UiMount::from_conf(&UiConf::default()).is_none());
        let no_source = UiConf {
            enabled: true,
            ..UiConf::default()
        };
        assert!(UiMount::from_conf(&no_source).is_none());
    }

    #[tokio::test]
    async fn security_headers_are_added() {
        let response = inner_router()
            .layer(middleware::from_fn(add_security_headers))
            .oneshot(Request::builder().uri("/").body(AxumBody::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.headers()[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    }

    #[test]
    fn forwarded_ip_wins_over_connection_ip() {
        let mut headers = HeaderMap::new();
        let connect = "10.0.0.1".parse().ok();
        assert_eq!(resolve_client_ip(&headers, connect), connect);
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.7, 10.0.0.1"));
        assert_eq!(resolve_client_ip(&headers, connect), "192.0.2.7".parse().ok());
    }
}
