//! 受限目录内的文件下载、目录索引与列表渲染。

use axum::body::Body as AxumBody;
use axum::http::{HeaderValue, Request, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Response};
use std::fmt::Write as _;
use std::path::Path;
use tokio::fs;
use tower_http::services::ServeDir;
use tracing::debug;

use crate::error::ApiError;
use crate::storage::{FileEntry, Storage, StorageError};

const INDEX_FILE: &str = "index.html";

/// 在 `root` 下提供 `remainder` 指向的文件或目录。
///
/// `remainder` 是剥离前缀后仍为百分号编码的请求路径，为空或以 `/` 开头。
pub async fn serve_confined(
    root: &Path,
    remainder: &str,
    show_directory: bool,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let decoded = urlencoding::decode(remainder)
        .map_err(|_| ApiError::BadRequest("invalid path encoding".into()))?;
    let storage = Storage::new(root.to_path_buf());
    let target = storage.resolve_checked(&decoded).await?;
    let metadata = fs::metadata(&target).await.map_err(StorageError::from)?;

    if !metadata.is_dir() {
        return serve_file(root, remainder, req).await;
    }
    if !remainder.ends_with('/') {
        return redirect_with_slash(req.uri());
    }
    if is_regular_file(&target.join(INDEX_FILE)).await {
        return serve_file(root, &format!("{remainder}{INDEX_FILE}"), req).await;
    }
    if !show_directory {
        return Err(ApiError::Forbidden("directory listing is disabled".into()));
    }

    let entries = storage.list_dir(&target).await?;
    debug!(path = %decoded, count = entries.len(), "list directory");
    Ok(Html(render_listing(&decoded, &entries)).into_response())
}

/// 交给 `ServeDir` 处理 MIME、Range 与条件请求头。
async fn serve_file(
    root: &Path,
    remainder: &str,
    req: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let (mut parts, body) = req.into_parts();
    parts.uri = format!("/{}", remainder.trim_start_matches('/'))
        .parse::<Uri>()
        .map_err(|_| ApiError::BadRequest("invalid path".into()))?;
    let response = ServeDir::new(root)
        .try_call(Request::from_parts(parts, body))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(response.map(AxumBody::new))
}

fn redirect_with_slash(uri: &Uri) -> Result<Response, ApiError> {
    let location = match uri.query() {
        Some(query) => format!("{}/?{}", uri.path(), query),
        None => format!("{}/", uri.path()),
    };
    let location = HeaderValue::from_str(&location)
        .map_err(|_| ApiError::Internal("failed to build redirect".into()))?;
    Ok((StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response())
}

async fn is_regular_file(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

/// 渲染目录列表 HTML，目录在前。
pub fn render_listing(path: &str, entries: &[FileEntry]) -> String {
    let title = escape_html(&format!("/{}", path.trim_start_matches('/')));
    let mut html = String::new();
    let _ = write!(
        html,
        "<!doctype html>\n<meta charset=\"utf-8\">\n<title>Index of {title}</title>\n<h1>Index of {title}</h1>\n<pre>\n"
    );
    if !path.trim_matches('/').is_empty() {
        html.push_str("<a href=\"../\">../</a>\n");
    }
    for entry in entries {
        let suffix = if entry.is_dir { "/" } else { "" };
        let href = urlencoding::encode(&entry.name);
        let name = escape_html(&entry.name);
        let size = if entry.is_dir {
            "-".to_string()
        } else {
            entry.size.to_string()
        };
        let _ = writeln!(
            html,
            "<a href=\"{href}{suffix}\">{name}{suffix}</a>    {}    {size}",
            entry.modified.as_deref().unwrap_or("-"),
        );
    }
    html.push_str("</pre>\n");
    html
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
