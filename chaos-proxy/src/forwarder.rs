use crate::PROXY_NAME;
use crate::errors::ProxyError;
use crate::metrics_defs::UPSTREAM_ERROR;
use crate::types::Target;
use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderName};
use http::{Method, Response, Version};
use hyper::body::Bytes;
use shared::counter;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

/// A fully buffered inbound request, with the access key already stripped from the path.
#[derive(Clone, Debug)]
pub struct InboundRequest {
    pub method: Method,
    /// Path to request on the upstream, before the target's base path is prepended.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub version: Version,
    pub body: Bytes,
}

/// Sends a request to the selected target.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(
        &self,
        target: &Target,
        request: InboundRequest,
    ) -> Result<Response<Bytes>, ProxyError>;
}

/// Only these methods carry a body upstream. Any other inbound body is dropped.
fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

pub fn build_upstream_url(
    target: &Target,
    path: &str,
    query: Option<&str>,
) -> Result<Url, ProxyError> {
    let host = if target.host.contains(':') {
        format!("[{}]", target.host)
    } else {
        target.host.clone()
    };

    let mut url = Url::parse(&format!("{}://{}/", target.scheme(), host)).map_err(|_| {
        ProxyError::UpstreamError(target.host.clone(), "invalid upstream address".into())
    })?;
    url.set_port(Some(target.port)).map_err(|_| {
        ProxyError::UpstreamError(target.host.clone(), "invalid upstream port".into())
    })?;
    url.set_path(&format!("{}{}", target.base_path, path));
    url.set_query(query);

    Ok(url)
}

/// Forwards over HTTP(S) with a bound on the full round trip, response body included.
pub struct HttpForwarder {
    client: reqwest::Client,
    timeout: Duration,
    /// Request headers that never leave the proxy, such as the access key header.
    strip_headers: Vec<HeaderName>,
}

impl HttpForwarder {
    pub fn new(timeout: Duration, strip_headers: Vec<HeaderName>) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            timeout,
            strip_headers,
        })
    }

    fn upstream_headers(&self, mut headers: HeaderMap, version: Version) -> HeaderMap {
        filter_hop_by_hop(&mut headers);
        // Host comes from the target URL and the length from the body actually sent.
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        for name in &self.strip_headers {
            headers.remove(name);
        }
        add_via_header(&mut headers, version, PROXY_NAME);
        headers
    }
}

#[async_trait]
impl Upstream for HttpForwarder {
    async fn forward(
        &self,
        target: &Target,
        request: InboundRequest,
    ) -> Result<Response<Bytes>, ProxyError> {
        let upstream_id = format!("{}:{}", target.host, target.port);
        let url = build_upstream_url(target, &request.path, request.query.as_deref())?;
        let headers = self.upstream_headers(request.headers, request.version);

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if carries_body(&request.method) {
            builder = builder.body(request.body);
        }

        let round_trip = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let (status, mut headers, body) = timeout(self.timeout, round_trip)
            .await
            // Elapsed: the whole exchange, body included, exceeded the bound
            .map_err(|_| {
                counter!(UPSTREAM_ERROR, "kind" => "timeout").increment(1);
                ProxyError::UpstreamTimeout(upstream_id.clone())
            })?
            .map_err(|e| classify_error(&upstream_id, e))?;

        // Upstream headers pass through untouched apart from hop-by-hop ones.
        filter_hop_by_hop(&mut headers);

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Maps a transport failure to a proxy error with a description safe to show callers.
fn classify_error(upstream_id: &str, err: reqwest::Error) -> ProxyError {
    tracing::warn!(upstream = upstream_id, error = %err, "upstream request failed");

    if err.is_timeout() {
        counter!(UPSTREAM_ERROR, "kind" => "timeout").increment(1);
        return ProxyError::UpstreamTimeout(upstream_id.to_string());
    }

    let (kind, description) = if err.is_connect() {
        ("connect", "could not connect to upstream")
    } else if err.is_body() || err.is_decode() {
        ("body", "invalid response from upstream")
    } else if err.is_redirect() {
        ("redirect", "redirect error")
    } else {
        ("request", "upstream request failed")
    };

    counter!(UPSTREAM_ERROR, "kind" => kind).increment(1);
    ProxyError::UpstreamError(upstream_id.to_string(), description.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{closed_port, spawn_echo_upstream, spawn_silent_upstream, target};
    use http::header::{HeaderValue, VIA};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn forwarder(timeout: Duration) -> HttpForwarder {
        HttpForwarder::new(timeout, vec![HeaderName::from_static("x-api-key")]).unwrap()
    }

    fn inbound(method: Method, path: &str, query: Option<&str>, body: &'static [u8]) -> InboundRequest {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("proxy.example.com"));
        headers.insert("x-api-key", HeaderValue::from_static("lp_secret"));
        headers.insert("x-custom", HeaderValue::from_static("test-value"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        InboundRequest {
            method,
            path: path.to_string(),
            query: query.map(String::from),
            headers,
            version: Version::HTTP_11,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_build_upstream_url() {
        let mut t = target("t", "", 8443);
        t.use_tls = true;
        t.host = "api.example.com".into();
        t.base_path = "/v2".into();

        let url = build_upstream_url(&t, "/users/1", Some("a=1&b=2")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com:8443/v2/users/1?a=1&b=2");

        t.use_tls = false;
        t.port = 80;
        t.base_path = String::new();
        let url = build_upstream_url(&t, "/", None).unwrap();
        assert_eq!(url.as_str(), "http://api.example.com/");

        t.host = "::1".into();
        t.port = 8080;
        let url = build_upstream_url(&t, "/x", None).unwrap();
        assert_eq!(url.as_str(), "http://[::1]:8080/x");
    }

    #[tokio::test]
    async fn test_passthrough() {
        let (port, hits) = spawn_echo_upstream().await;
        let mut t = target("t", "", port);
        t.base_path = "/base".into();

        let mut request = inbound(Method::POST, "/path", Some("x=1"), b"hello world");
        request
            .headers
            .insert("x-status", HeaderValue::from_static("201"));

        let response = forwarder(Duration::from_secs(5))
            .forward(&t, request)
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(response.status(), 201);
        assert_eq!(response.body().as_ref(), b"hello world");

        let headers = response.headers();
        assert_eq!(headers.get("x-echo-method").unwrap(), "POST");
        assert_eq!(headers.get("x-echo-uri").unwrap(), "/base/path?x=1");
        assert_eq!(headers.get("x-custom").unwrap(), "test-value");
        // Host is the target's, not the inbound one
        assert_eq!(headers.get(HOST).unwrap(), &format!("127.0.0.1:{port}"));
        // the access key never reaches the upstream
        assert!(headers.get("x-api-key").is_none());
        // Via is added on the way in only; the echo mirrors it back once
        assert_eq!(
            headers.get_all(VIA).iter().collect::<Vec<_>>(),
            vec!["1.1 latency-poison"]
        );
    }

    #[tokio::test]
    async fn test_body_dropped_for_get() {
        let (port, _hits) = spawn_echo_upstream().await;
        let response = forwarder(Duration::from_secs(5))
            .forward(&target("t", "", port), inbound(Method::GET, "/", None, b"ignored"))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("x-echo-method").unwrap(), "GET");
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn test_body_kept_for_put_and_patch() {
        let (port, _hits) = spawn_echo_upstream().await;
        let forwarder = forwarder(Duration::from_secs(5));

        for method in [Method::PUT, Method::PATCH] {
            let response = forwarder
                .forward(&target("t", "", port), inbound(method, "/", None, b"payload"))
                .await
                .unwrap();
            assert_eq!(response.body().as_ref(), b"payload");
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let port = spawn_silent_upstream().await;
        let started = Instant::now();

        let result = forwarder(Duration::from_millis(200))
            .forward(&target("t", "", port), inbound(Method::GET, "/", None, b""))
            .await;

        assert!(matches!(result, Err(ProxyError::UpstreamTimeout(_))));
        assert_eq!(result.unwrap_err().status(), 504);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let port = closed_port().await;

        let result = forwarder(Duration::from_secs(5))
            .forward(&target("t", "", port), inbound(Method::GET, "/", None, b""))
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamError(_, _)));
        assert_eq!(err.status(), 502);
        assert_eq!(
            err.public_message(),
            format!("upstream 127.0.0.1:{port} failed: could not connect to upstream")
        );
    }
}
