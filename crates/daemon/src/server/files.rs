// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Static File Server
// Serves a shared directory, with a generated index for directories that lack one

use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

pub(crate) const LISTING_DISABLED_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Loophole</title></head><body><h1>Loophole</h1><p>Directory index listing has been disabled. Please enter the path of a file.</p></body></html>";

struct FilesState {
    root: PathBuf,
    listing_disabled: bool,
}

/// Build the router serving `root`
pub fn router(root: &FsPath, listing_disabled: bool) -> Router {
    let state = Arc::new(FilesState {
        root: root.to_path_buf(),
        listing_disabled,
    });

    Router::new()
        .route("/", any(serve))
        .route("/*path", any(serve))
        .with_state(state)
}

/// Map a decoded request path onto the shared root, refusing anything that
/// would leave it
fn resolve(root: &FsPath, relative: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in FsPath::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

async fn serve(
    State(state): State<Arc<FilesState>>,
    path: Option<Path<String>>,
    request: Request,
) -> Response {
    let relative = path.map(|Path(p)| p).unwrap_or_default();
    let Some(resolved) = resolve(&state.root, &relative) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let wants_index = (request.method() == Method::GET || request.method() == Method::HEAD)
        && request.uri().path().ends_with('/')
        && resolved.is_dir()
        && !resolved.join("index.html").is_file();

    if wants_index {
        if state.listing_disabled {
            debug!("Directory listing disabled for {}", request.uri().path());
            return Html(LISTING_DISABLED_PAGE).into_response();
        }
        return match render_listing(&resolved, request.uri().path()).await {
            Ok(page) => Html(page).into_response(),
            Err(e) => {
                warn!("Failed to list {}: {}", resolved.display(), e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
    }

    match ServeDir::new(&state.root).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(e) => match e {},
    }
}

async fn render_listing(dir: &FsPath, request_path: &str) -> std::io::Result<String> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push((name, is_dir));
    }
    // Directories first, then by name
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let title = escape_html(request_path);
    let mut page = format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Index of {0}</title></head>\n<body>\n<h1>Index of {0}</h1>\n<ul>\n",
        title
    );
    if request_path != "/" {
        page.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for (name, is_dir) in entries {
        let suffix = if is_dir { "/" } else { "" };
        page.push_str(&format!(
            "<li><a href=\"{}{}\">{}{}</a></li>\n",
            encode_href(&name),
            suffix,
            escape_html(&name),
            suffix
        ));
    }
    page.push_str("</ul>\n</body></html>\n");
    Ok(page)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Percent-encode a single path segment
fn encode_href(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn share() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        std::fs::create_dir(dir.path().join("sub dir")).unwrap();
        std::fs::write(dir.path().join("sub dir").join("a&b.txt"), "inner").unwrap();
        std::fs::create_dir(dir.path().join("site")).unwrap();
        std::fs::write(dir.path().join("site").join("index.html"), "<p>index</p>").unwrap();
        dir
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[test]
    fn test_resolve_rejects_parent() {
        let root = FsPath::new("/srv/share");
        assert_eq!(resolve(root, "a/b.txt"), Some(root.join("a/b.txt")));
        assert_eq!(resolve(root, ""), Some(root.to_path_buf()));
        assert!(resolve(root, "../etc/passwd").is_none());
        assert!(resolve(root, "a/../../x").is_none());
    }

    #[test]
    fn test_escape_and_encode() {
        assert_eq!(escape_html("<a&b>"), "&lt;a&amp;b&gt;");
        assert_eq!(encode_href("sub dir"), "sub%20dir");
        assert_eq!(encode_href("a&b.txt"), "a%26b.txt");
    }

    #[tokio::test]
    async fn test_serves_file() {
        let dir = share();
        let (status, body) = get(router(dir.path(), false), "/hello.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello world");
    }

    #[tokio::test]
    async fn test_serves_percent_encoded_file() {
        let dir = share();
        let (status, body) = get(router(dir.path(), false), "/sub%20dir/a%26b.txt").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "inner");
    }

    #[tokio::test]
    async fn test_directory_with_index() {
        let dir = share();
        let (status, body) = get(router(dir.path(), true), "/site/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<p>index</p>");
    }

    #[tokio::test]
    async fn test_listing() {
        let dir = share();
        let (status, body) = get(router(dir.path(), false), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Index of /"));
        assert!(body.contains("href=\"hello.txt\""));
        assert!(body.contains("href=\"sub%20dir/\""));

        let (_, body) = get(router(dir.path(), false), "/sub%20dir/").await;
        assert!(body.contains("a&amp;b.txt"));
        assert!(body.contains("href=\"../\""));
    }

    #[tokio::test]
    async fn test_listing_disabled_placeholder() {
        let dir = share();
        let (status, body) = get(router(dir.path(), true), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, LISTING_DISABLED_PAGE);
        assert!(!body.contains("hello.txt"));

        // Files stay reachable
        let (status, _) = get(router(dir.path(), true), "/hello.txt").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = share();
        let (status, _) = get(router(dir.path(), false), "/nope.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
