use super::TransportConfig;
use crate::resilience::{parse_retry_after, FailureClass};
use crate::{BoxStream, Error, ErrorContext, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Certificate, Identity, Proxy};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

/// Upstream error bodies are truncated to this many characters in messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Shared reqwest-based transport.
///
/// Only the connect timeout is set on the client; per-chunk and overall
/// deadlines are enforced by the caller so they can differ per provider.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(Duration::from_secs(config.pool_idle_timeout_secs)))
            // Conservative HTTP/2 keepalive defaults for long-lived streams.
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Some(proxy_url) = &config.proxy {
            let mut proxy = Proxy::all(proxy_url).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid proxy URL: {}", e),
                    ErrorContext::new().with_field_path("transport.proxy"),
                )
            })?;
            if let Some(no_proxy) = &config.no_proxy {
                proxy = proxy.no_proxy(reqwest::NoProxy::from_string(no_proxy));
            }
            builder = builder.proxy(proxy);
        } else if !config.use_env_proxy {
            builder = builder.no_proxy();
        }

        if let Some(path) = &config.ca_bundle {
            let pem = std::fs::read(path)?;
            let certs = Certificate::from_pem_bundle(&pem).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid CA bundle: {}", e),
                    ErrorContext::new()
                        .with_field_path("transport.ca_bundle")
                        .with_details(path.display().to_string()),
                )
            })?;
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let Some(path) = &config.client_cert {
            let pem = std::fs::read(path)?;
            let identity = Identity::from_pem(&pem).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid client certificate: {}", e),
                    ErrorContext::new()
                        .with_field_path("transport.client_cert")
                        .with_details(path.display().to_string()),
                )
            })?;
            builder = builder.identity(identity);
        }

        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| {
            Error::configuration_with_context(
                format!("failed to build HTTP client: {}", e),
                ErrorContext::new().with_source("transport"),
            )
        })?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// POST a JSON body and return the response once its status is known to be 2xx.
    ///
    /// Connection failures, 5xx and 429 come back as `UpstreamTransient`; any
    /// other non-2xx status is `UpstreamFatal` carrying the upstream status.
    pub async fn post_json(
        &self,
        url: Url,
        headers: HeaderMap,
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let started = Instant::now();
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let host = url.host_str().unwrap_or_default().to_string();
        let resp = self
            .client
            .post(url)
            .headers(headers)
            .header(reqwest::header::ACCEPT, accept)
            .json(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = resp.status();
        info!(
            host = %host,
            http_status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            stream,
            "upstream responded"
        );
        if status.is_success() {
            return Ok(resp);
        }

        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        let message = upstream_message(status.as_u16(), &text);
        debug!(http_status = status.as_u16(), body = %truncate(&text), "upstream error body");
        Err(match FailureClass::from_status(status.as_u16()) {
            Some(class) => Error::UpstreamTransient {
                class,
                status: Some(status.as_u16()),
                message,
                retry_after,
            },
            None => Error::UpstreamFatal {
                status: Some(status.as_u16()),
                attempts: 1,
                message,
            },
        })
    }

    /// Read a complete JSON response body.
    pub async fn read_json(resp: reqwest::Response) -> Result<Value> {
        let bytes = resp.bytes().await.map_err(|e| {
            Error::transient(
                FailureClass::Connection,
                format!("failed reading upstream body: {}", e),
            )
        })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::UpstreamFatal {
            status: None,
            attempts: 1,
            message: format!("upstream returned invalid JSON: {}", e),
        })
    }

    /// Body of a streaming response as a byte stream.
    pub fn byte_stream(resp: reqwest::Response) -> BoxStream<'static, Bytes> {
        Box::pin(resp.bytes_stream().map_err(|e| {
            Error::transient(FailureClass::Connection, format!("upstream read failed: {}", e))
        }))
    }
}

fn classify_send_error(e: reqwest::Error) -> Error {
    let class = if e.is_timeout() {
        FailureClass::ConnectTimeout
    } else {
        FailureClass::Connection
    };
    Error::transient(class, format!("upstream request failed: {}", e))
}

/// Prefer the provider's `error.message`; fall back to the raw body.
fn upstream_message(status: u16, body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .and_then(|m| m.as_str())
            .map(String::from)
    });
    match message {
        Some(m) => format!("HTTP {}: {}", status, m),
        None if body.trim().is_empty() => format!("HTTP {}", status),
        None => format!("HTTP {}: {}", status, truncate(body)),
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_ERROR_BODY_CHARS {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(MAX_ERROR_BODY_CHARS).collect();
        t.push('…');
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_extraction() {
        assert_eq!(
            upstream_message(400, r#"{"error":{"message":"bad field","type":"invalid"}}"#),
            "HTTP 400: bad field"
        );
        assert_eq!(upstream_message(502, ""), "HTTP 502");
        assert_eq!(upstream_message(500, "oops"), "HTTP 500: oops");
    }

    #[test]
    fn test_invalid_proxy_is_configuration_error() {
        let cfg = TransportConfig::default().with_proxy("http://[bad");
        assert!(matches!(
            HttpTransport::new(&cfg),
            Err(Error::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_classification_against_mock() {
        let mut server = mockito::Server::new_async().await;
        let transport =
            HttpTransport::new(&TransportConfig::default().with_env_proxy(false)).unwrap();
        let url = Url::parse(&format!("{}/x", server.url())).unwrap();

        let m = server
            .mock("POST", "/x")
            .with_status(429)
            .with_header("retry-after", "3")
            .with_body(r#"{"error":{"message":"slow down"}}"#)
            .create_async()
            .await;
        let err = transport
            .post_json(url.clone(), HeaderMap::new(), &serde_json::json!({}), false)
            .await
            .unwrap_err();
        m.assert_async().await;
        match err {
            Error::UpstreamTransient {
                class,
                retry_after,
                message,
                ..
            } => {
                assert_eq!(class, FailureClass::RateLimited);
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
                assert!(message.contains("slow down"));
            }
            other => panic!("unexpected {other:?}"),
        }

        server
            .mock("POST", "/x")
            .with_status(404)
            .create_async()
            .await;
        let err = transport
            .post_json(url, HeaderMap::new(), &serde_json::json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamFatal { status: Some(404), .. }));
    }
}
