//! Adapts one inbound public HTTP request into an exchange: submit a
//! request frame, wait for the matching response or a timeout or a client
//! disconnect, then write the response back out.

use std::net::SocketAddr;
use std::time::Instant;

use aether_core::{EXCHANGE_TIMEOUT, Headers, RequestFrame};
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use crate::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// The real IP precedence from `SPEC_FULL.md` §3:
/// `X-Forwarded-For` ▸ `X-Real-Ip` ▸ the socket's peer address.
fn client_ip(headers: &HeaderMap, remote: Option<&str>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(str::to_string)
        .or_else(|| remote.map(str::to_string))
        .unwrap_or_default()
}

fn collect_headers(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Headers::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(session) = state.slot.lock().clone() else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let request = RequestFrame {
        id: 0, // assigned by ExchangeTable::insert
        ip: client_ip(&headers, Some(&remote.to_string())),
        method: method.to_string(),
        url: uri.to_string(),
        headers: collect_headers(&headers),
        body: body_bytes.to_vec(),
        created_at: Instant::now(),
    };

    let (id, request, mut receiver) = session.table.insert(request);

    // Remove the row on every exit path exactly once, via a guard.
    struct RemoveOnDrop<'a> {
        table: &'a aether_core::ExchangeTable,
        id: u64,
    }
    impl Drop for RemoveOnDrop<'_> {
        fn drop(&mut self) {
            self.table.remove(self.id);
        }
    }
    let _guard = RemoveOnDrop {
        table: &session.table,
        id,
    };

    let text = match aether_core::frame::encode(&request) {
        Ok(text) => text,
        Err(err) => {
            log::error!("proxy: encode failed: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if let Err(err) = session.send(text) {
        log::error!("proxy: {err}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    tokio::select! {
        response = receiver.recv() => {
            match response {
                Some(response) => frame_to_http(response),
                // The channel closed without a synthetic response landing
                // first (writer task died mid-flight); treat the same as a
                // dropped connection.
                None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        _ = tokio::time::sleep(EXCHANGE_TIMEOUT) => {
            StatusCode::REQUEST_TIMEOUT.into_response()
        }
    }
    // A peer disconnect cancels this whole handler future (axum drops it),
    // which drops `_guard` and removes the exchange without ever reaching
    // here — the "abandon silently" path from SPEC_FULL.md §4.5.
}

fn frame_to_http(response: aether_core::ResponseFrame) -> Response {
    if !response.err.is_empty() {
        log::error!("proxy: client error: {}", response.err);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);

    if let Some(headers) = builder.headers_mut() {
        for (name, values) in &response.headers {
            let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    headers.append(header_name.clone(), header_value);
                }
            }
        }
    }

    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn ip_precedence_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(client_ip(&headers, Some("3.3.3.3")), "1.1.1.1");
    }

    #[test]
    fn ip_precedence_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(client_ip(&headers, Some("3.3.3.3")), "2.2.2.2");
    }

    #[test]
    fn ip_precedence_falls_back_to_remote() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some("3.3.3.3")), "3.3.3.3");
    }

    #[test]
    fn collect_headers_preserves_multiple_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-test", HeaderValue::from_static("a"));
        headers.append("x-test", HeaderValue::from_static("b"));
        let collected = collect_headers(&headers);
        assert_eq!(collected.get("x-test").unwrap(), &vec!["a", "b"]);
    }
}
