// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - WebDAV Server
// Read-write WebDAV share of a local directory

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::response::Response;
use axum::Router;
use dav_server::localfs::LocalFs;
use dav_server::memls::MemLs;
use dav_server::DavHandler;
use tracing::debug;

/// Build the router exposing `root` over WebDAV
pub fn router(root: &Path) -> Router {
    let dav = Arc::new(
        DavHandler::builder()
            .filesystem(LocalFs::new(root, false, false, false))
            .locksystem(MemLs::new())
            .build_handler(),
    );

    debug!("WebDAV share rooted at {}", root.display());
    Router::new().fallback(move |request: Request| {
        let dav = dav.clone();
        async move {
            let response: Response = dav.handle(request).await.map(Body::new);
            response
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, body: &'static str) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if method == "PROPFIND" {
            builder = builder.header("Depth", "1");
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let app = router(dir.path());

        let response = app
            .clone()
            .oneshot(request("PUT", "/notes.txt", "written over dav"))
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(),
            "written over dav"
        );

        let response = app.oneshot(request("GET", "/notes.txt", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"written over dav");
    }

    #[tokio::test]
    async fn test_propfind_lists_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("report.pdf"), "pdf").unwrap();
        let app = router(dir.path());

        let response = app.oneshot(request("PROPFIND", "/", "")).await.unwrap();
        assert_eq!(response.status().as_u16(), 207);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("report.pdf"));
    }

    #[tokio::test]
    async fn test_mkcol_and_delete() {
        let dir = TempDir::new().unwrap();
        let app = router(dir.path());

        let response = app
            .clone()
            .oneshot(request("MKCOL", "/archive", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(dir.path().join("archive").is_dir());

        let response = app.oneshot(request("DELETE", "/archive", "")).await.unwrap();
        assert!(response.status().is_success());
        assert!(!dir.path().join("archive").exists());
    }
}
