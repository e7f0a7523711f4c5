//! Upstream request forwarder.
//!
//! One [`UpstreamClient`] exists per configured provider, built at startup
//! from `provider_credentials`. The forwarder POSTs the rewritten body to the
//! provider's chat-completions endpoint and hands back the raw response; the
//! handler streams its bytes to the caller verbatim.
//!
//! The configured timeout bounds the wait for upstream response *headers*
//! only. Streaming bodies arrive incrementally and are never subject to it.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::Stream;
use reqwest::{header, Client};
use serde_json::Value;

use crate::error::SidecarError;

/// HTTP client for one provider.
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    timeout_ms: u64,
}

impl UpstreamClient {
    /// Build a client for the given base URL and optional bearer token.
    pub fn new(base_url: String, timeout_ms: u64, api_key: Option<String>) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            // Panics on invalid header bytes — surfaces misconfiguration at
            // startup, not at request time.
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("API key contains invalid Authorization header characters"),
            );
        }

        // No client-level timeout: the headers deadline is applied per call,
        // and response bodies must be allowed to stream indefinitely.
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_ms,
        }
    }

    /// POST the rewritten body to `/v1/chat/completions` and return the raw
    /// response. Status and `Content-Type` are the caller's to forward.
    pub async fn forward(
        &self,
        body: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> Result<reqwest::Response, SidecarError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(body);
        for (name, value) in extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), request.send()).await {
            Err(_elapsed) => Err(SidecarError::Timeout(self.timeout_ms)),
            Ok(Err(e)) => Err(SidecarError::Upstream(
                anyhow::Error::new(e).context(format!("POST {url}")),
            )),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

/// Boxed upstream byte stream.
pub type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Byte-counting passthrough stream.
///
/// Forwards every chunk untouched and, when the upstream cleanly finishes,
/// fires `on_complete` with the total byte count. A dropped stream (client
/// disconnect) never fires the callback, so cancelled requests record
/// nothing.
pub struct MeteredStream {
    inner: ByteStream,
    bytes: u64,
    on_complete: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl MeteredStream {
    pub fn new(inner: ByteStream, on_complete: impl FnOnce(u64) + Send + 'static) -> Self {
        Self { inner, bytes: 0, on_complete: Some(Box::new(on_complete)) }
    }
}

impl Stream for MeteredStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if let Some(complete) = this.on_complete.take() {
                    complete(this.bytes);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{header as header_match, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_body() -> Value {
        json!({"model": "test/model", "messages": [{"role": "user", "content": "hi"}]})
    }

    // -----------------------------------------------------------------------
    // Forwarding
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn forward_posts_to_chat_completions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), 5_000, None);
        let response = client.forward(&chat_body(), &HashMap::new()).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn forward_sends_bearer_token_and_extra_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_match("authorization", "Bearer sk-test"))
            .and(header_match("x-title", "SlimClaw"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), 5_000, Some("sk-test".into()));
        let extra = HashMap::from([("X-Title".to_string(), "SlimClaw".to_string())]);
        let response = client.forward(&chat_body(), &extra).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn upstream_error_status_is_returned_not_an_error() {
        // Non-2xx upstream responses are forwarded verbatim, so forward()
        // succeeds and hands back the status.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), 5_000, None);
        let response = client.forward(&chat_body(), &HashMap::new()).await.unwrap();
        assert_eq!(response.status(), 429);
    }

    #[tokio::test]
    async fn slow_headers_hit_the_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = UpstreamClient::new(server.uri(), 50, None);
        let err = client.forward(&chat_body(), &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, SidecarError::Timeout(50)));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_upstream_error() {
        // Nothing listens on this port
        let client = UpstreamClient::new("http://127.0.0.1:1".into(), 5_000, None);
        let err = client.forward(&chat_body(), &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, SidecarError::Upstream(_)));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = UpstreamClient::new("http://localhost:9999///".into(), 1_000, None);
        assert_eq!(client.base_url, "http://localhost:9999");
    }

    // -----------------------------------------------------------------------
    // MeteredStream
    // -----------------------------------------------------------------------

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        futures_util::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<reqwest::Result<Bytes>>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn metered_stream_passes_bytes_through_and_reports_total() {
        let total = Arc::new(AtomicU64::new(0));
        let total_clone = Arc::clone(&total);
        let stream = MeteredStream::new(byte_stream(vec![b"hello ", b"world"]), move |n| {
            total_clone.store(n, Ordering::SeqCst);
        });

        let collected: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(collected.concat(), b"hello world");
        assert_eq!(total.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn dropped_stream_never_fires_completion() {
        let total = Arc::new(AtomicU64::new(u64::MAX));
        let total_clone = Arc::clone(&total);
        let mut stream = MeteredStream::new(byte_stream(vec![b"hello ", b"world"]), move |n| {
            total_clone.store(n, Ordering::SeqCst);
        });

        // Consume one chunk, then drop mid-stream (client disconnect)
        let _ = stream.next().await;
        drop(stream);
        assert_eq!(total.load(Ordering::SeqCst), u64::MAX, "callback must not fire");
    }

    #[tokio::test]
    async fn empty_stream_reports_zero_bytes() {
        let total = Arc::new(AtomicU64::new(u64::MAX));
        let total_clone = Arc::clone(&total);
        let stream = MeteredStream::new(byte_stream(vec![]), move |n| {
            total_clone.store(n, Ordering::SeqCst);
        });
        let _: Vec<_> = stream.collect().await;
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }
}
