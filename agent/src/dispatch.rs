//! Turns a decoded request frame into a loopback HTTP call against the
//! locally proxied origin, and turns the origin's answer (or failure) back
//! into a response frame.

use aether_core::{Headers, RequestFrame, ResponseFrame};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::channel::Channel;

#[derive(Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    origin: String,
    authority: String,
}

impl Dispatcher {
    pub fn new(port: u16) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            origin: format!("http://127.0.0.1:{port}"),
            authority: format!("127.0.0.1:{port}"),
        })
    }

    pub async fn dispatch(&self, request: RequestFrame, channel: Channel) {
        let id = request.id;
        let response = self.run(request).await.unwrap_or_else(|err| {
            log::warn!("origin request failed: {err}");
            ResponseFrame::origin_failure(id, err.to_string())
        });

        if let Err(err) = channel.send(&response) {
            log::warn!("dispatch: {err}");
        }
    }

    async fn run(&self, request: RequestFrame) -> anyhow::Result<ResponseFrame> {
        let method = Method::from_bytes(request.method.as_bytes())?;
        let url = format!("{}{}", self.origin, request.url);
        let headers = outbound_headers(&request.headers, &request.ip, &self.authority);

        let origin_response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status_code = origin_response.status().as_u16();
        let headers = inbound_headers(origin_response.headers());
        let body = origin_response.bytes().await?;

        Ok(ResponseFrame {
            id: request.id,
            status_code,
            headers,
            body: body.to_vec(),
            err: String::new(),
        })
    }
}

/// Rebuild the header set sent to the origin: everything the public client
/// sent, with `X-Forwarded-For`/`X-Real-Ip` overwritten to the address the
/// edge observed rather than whatever the client itself claimed, and `Host`
/// overwritten to the loopback authority rather than the public-facing one
/// the edge captured. The edge's `HeaderMap` carries `Host` as an ordinary
/// header (unlike Go, where it never appears in `req.Header`), so without
/// this override a backend that checks `Host` (vhost routing, dev-server
/// host checks) would see the tunnel's public hostname instead of its own.
fn outbound_headers(source: &Headers, client_ip: &str, loopback_authority: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in source {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                headers.append(header_name.clone(), header_value);
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(loopback_authority) {
        headers.insert("host", value);
    }

    if !client_ip.is_empty() {
        if let Ok(value) = HeaderValue::from_str(client_ip) {
            headers.insert("x-forwarded-for", value.clone());
            headers.insert("x-real-ip", value);
        }
    }

    headers
}

fn inbound_headers(source: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in source.iter() {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_headers_overwrite_forwarded_for_with_the_observed_ip() {
        let mut source = Headers::new();
        source.insert("x-forwarded-for".to_string(), vec!["1.2.3.4".to_string()]);
        source.insert("accept".to_string(), vec!["text/html".to_string()]);

        let headers = outbound_headers(&source, "9.9.9.9", "127.0.0.1:9000");

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "9.9.9.9");
        assert_eq!(headers.get("x-real-ip").unwrap(), "9.9.9.9");
        assert_eq!(headers.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn outbound_headers_without_a_client_ip_leaves_originals_alone() {
        let mut source = Headers::new();
        source.insert("accept".to_string(), vec!["*/*".to_string()]);
        let headers = outbound_headers(&source, "", "127.0.0.1:9000");
        assert_eq!(headers.get("accept").unwrap(), "*/*");
        assert!(headers.get("x-forwarded-for").is_none());
    }

    #[test]
    fn outbound_headers_overwrite_host_with_the_loopback_authority() {
        let mut source = Headers::new();
        source.insert("host".to_string(), vec!["mytunnel.example.com".to_string()]);

        let headers = outbound_headers(&source, "", "127.0.0.1:9000");

        assert_eq!(headers.get("host").unwrap(), "127.0.0.1:9000");
    }

    #[test]
    fn inbound_headers_preserve_multiple_values() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let collected = inbound_headers(&headers);
        assert_eq!(collected.get("set-cookie").unwrap(), &vec!["a=1", "b=2"]);
    }
}
