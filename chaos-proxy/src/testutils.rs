use crate::config::AccessKeyConfig;
use crate::types::{RoutingConfig, RoutingMode, Target};
use crate::usage::Clock;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;
use tokio::net::TcpListener;

pub struct FixedClock(pub SystemTime);

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

pub fn target(id: &str, path_prefix: &str, port: u16) -> Target {
    Target {
        id: id.to_string(),
        name: id.to_string(),
        host: "127.0.0.1".to_string(),
        port,
        use_tls: false,
        base_path: String::new(),
        path_prefix: path_prefix.to_string(),
        chaos: Default::default(),
        active: true,
    }
}

/// Tunnel with a catch-all, `/api` and `/api/v1` targets, all on a closed port.
pub fn tunnel_config() -> RoutingConfig {
    RoutingConfig {
        id: "tunnel".into(),
        key: "lp_tunnel".into(),
        owner_id: "owner".into(),
        name: None,
        active: true,
        allowed_method: None,
        defaults: Default::default(),
        mode: RoutingMode::Tunnel(vec![
            target("catch-all", "", 1),
            target("api", "/api", 1),
            target("api-v1", "/api/v1", 1),
        ]),
    }
}

pub fn direct_config(url: &str) -> RoutingConfig {
    let config = AccessKeyConfig {
        id: "direct".into(),
        key: "lp_direct".into(),
        owner_id: "owner".into(),
        name: None,
        active: true,
        method: None,
        defaults: Default::default(),
        target_url: Some(url.parse().unwrap()),
        targets: None,
    };
    RoutingConfig::try_from(config).unwrap()
}

/// Echoes the request body back and mirrors request headers into the response.
/// `x-echo-method` and `x-echo-uri` report what the upstream received; an `x-status`
/// request header sets the response status.
async fn echo_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body_bytes = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_else(|_| Bytes::new());

    let status = parts
        .headers
        .get("x-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|v| StatusCode::from_u16(v).ok())
        .unwrap_or(StatusCode::OK);

    let mut response = Response::new(Full::new(body_bytes));
    *response.status_mut() = status;
    *response.headers_mut() = parts.headers;
    response.headers_mut().insert(
        HeaderName::from_static("x-echo-method"),
        HeaderValue::from_str(parts.method.as_str()).unwrap(),
    );
    response.headers_mut().insert(
        HeaderName::from_static("x-echo-uri"),
        HeaderValue::from_str(&parts.uri.to_string()).unwrap(),
    );

    Ok(response)
}

/// Starts an echo upstream and returns its port and a hit counter.
pub async fn spawn_echo_upstream() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));
    let server_hits = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let hits = server_hits.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    echo_handler(req)
                });
                if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    eprintln!("Error serving connection: {:?}", err);
                }
            });
        }
    });

    (port, hits)
}

/// Starts an upstream that accepts connections and never answers.
pub async fn spawn_silent_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            held.push(stream);
        }
    });

    port
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    listener.local_addr().unwrap().port()
}
