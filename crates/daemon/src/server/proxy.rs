// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - Reverse Proxy
// Forwards every request to one local HTTP(S) backend

use std::net::IpAddr;
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use loophole_common::{format_host_port, LocalHttpEndpointSpecs, ServerError};
use tracing::{debug, warn};

/// Headers that describe a single hop and must not be forwarded
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Tunnel is up, backend is not</title>
<style>
body { font-family: sans-serif; max-width: 40em; margin: 4em auto; color: #222; }
code { background: #f2f2f2; padding: 0.1em 0.3em; }
.hint { color: #666; font-size: 0.9em; margin-top: 3em; }
</style>
</head>
<body>
<h1>Your tunnel is up and running!</h1>
<p>Requests for <strong>{site}</strong> reach your machine, but nothing answered at <code>{backend}</code>.</p>
<p>Start your local server (or check the host and port you exposed) and reload this page.</p>
<p class="hint">Prefer a plain 502 response? Start the tunnel with <code>--disable-proxy-error-page</code>.</p>
</body>
</html>
"#;

/// Proxy state shared across requests
pub struct ProxyState {
    client: reqwest::Client,
    /// `scheme://host:port` of the backend
    backend: String,
    /// Backend path prefix, empty or `/segment` without a trailing slash
    prefix: String,
    /// Public hostname of the site
    site_host: String,
    /// Pass the public Host header through instead of the backend's own
    preserve_host: bool,
    error_page: bool,
}

/// Build the proxy router for a local HTTP endpoint
pub fn router(
    target: &LocalHttpEndpointSpecs,
    site_host: &str,
    error_page: bool,
) -> Result<Router, ServerError> {
    let scheme = if target.use_tls { "https" } else { "http" };
    let backend = format!("{}://{}", scheme, format_host_port(&target.host, target.port));

    let prefix = match target.path.trim_matches('/') {
        "" => String::new(),
        trimmed => format!("/{}", trimmed),
    };

    // The backend is the user's own service, often with a self-signed certificate
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(target.use_tls)
        .no_proxy()
        .build()
        .map_err(|e| ServerError::InvalidTarget(e.to_string()))?;

    let state = Arc::new(ProxyState {
        client,
        backend,
        prefix,
        site_host: site_host.to_string(),
        preserve_host: target.host.parse::<IpAddr>().is_ok(),
        error_page,
    });

    Ok(Router::new().fallback(proxy_handler).with_state(state))
}

fn forwarded_headers(incoming: &HeaderMap, state: &ProxyState) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 2);
    for (name, value) in incoming {
        if HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive" {
            continue;
        }
        // Without a Host header the client fills in the backend's host:port
        if name == header::HOST && !state.preserve_host {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(value) = HeaderValue::from_str(&state.site_host) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("https"),
    );
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// `Connection: upgrade` together with an `Upgrade` protocol
fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn backend_unreachable(state: &ProxyState) -> Response {
    if !state.error_page {
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let page = ERROR_PAGE
        .replace("{site}", &state.site_host)
        .replace("{backend}", &state.backend);
    (StatusCode::BAD_GATEWAY, Html(page)).into_response()
}

/// Splice the upgraded client connection onto the upgraded backend one
async fn bridge_upgrade(client: OnUpgrade, upstream: reqwest::Response) {
    let mut backend = match upstream.upgrade().await {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Backend upgrade failed: {}", e);
            return;
        }
    };
    let mut client = match client.await {
        Ok(client) => TokioIo::new(client),
        Err(e) => {
            warn!("Client upgrade failed: {}", e);
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((sent, received)) => debug!(
            "Upgraded connection closed ({} bytes out, {} bytes back)",
            sent, received
        ),
        Err(e) => debug!("Upgraded connection ended: {}", e),
    }
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}{}", state.backend, state.prefix, path);

    let on_upgrade = if is_upgrade_request(&parts.headers) {
        parts.extensions.remove::<OnUpgrade>()
    } else {
        None
    };

    let mut headers = forwarded_headers(&parts.headers, &state);
    if on_upgrade.is_some() {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        if let Some(protocol) = parts.headers.get(header::UPGRADE) {
            headers.insert(header::UPGRADE, protocol.clone());
        }
    }

    let mut outgoing = state
        .client
        .request(parts.method.clone(), &url)
        .headers(headers);
    // HTTP/2 and chunked uploads carry no length header, so ask the body itself
    if !body.is_end_stream() && body.size_hint().exact() != Some(0) {
        outgoing = outgoing.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    debug!("Proxying {} {}", parts.method, url);
    let upstream = match outgoing.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("Backend {} unreachable: {}", state.backend, e);
            return backend_unreachable(&state);
        }
    };

    let status = upstream.status();
    if status == StatusCode::SWITCHING_PROTOCOLS {
        if let Some(on_upgrade) = on_upgrade {
            let headers = upstream.headers().clone();
            tokio::spawn(bridge_upgrade(on_upgrade, upstream));

            let mut response = Response::new(Body::empty());
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            return response;
        }
    }

    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
