use crate::chaos::{ChaosConfig, ChaosInjector, Outcome};
use crate::config::{Config, ValidationError};
use crate::errors::ProxyError;
use crate::forwarder::{InboundRequest, Upstream};
use crate::metrics_defs::{
    CHAOS_INJECTED_FAILURE, CHAOS_INJECTED_LATENCY, REQUEST_DURATION, REQUESTS_INFLIGHT,
};
use crate::resolver::{KeyResolver, KeyedPath, extract_key};
use crate::sandbox::{self, SANDBOX_PATH};
use crate::selector::select;
use crate::store::ConfigStore;
use crate::types::{RoutingConfig, Target};
use crate::usage::{Clock, RequestOutcome, UsageRecorder};
use http::header::HeaderName;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::http::{into_boxed, make_error_response, make_json_error_response};
use shared::{counter, gauge, histogram};
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HEALTH_PATH: &str = "/health";

struct Inner {
    key_header: HeaderName,
    max_body_bytes: usize,
    sandbox_enabled: bool,
    resolver: KeyResolver,
    injector: ChaosInjector,
    upstream: Arc<dyn Upstream>,
    recorder: UsageRecorder,
}

/// Serves proxied traffic: resolve the key, pick a target, inject chaos, forward.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<Inner>,
}

impl ProxyService {
    pub fn new(
        config: &Config,
        store: Arc<dyn ConfigStore>,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProxyError> {
        let key_header = HeaderName::from_bytes(config.key_header.as_bytes())
            .map_err(|_| ValidationError::InvalidKeyHeader(config.key_header.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                key_header,
                max_body_bytes: config.max_body_bytes,
                sandbox_enabled: config.sandbox.enabled,
                resolver: KeyResolver::new(store.clone()),
                injector: ChaosInjector::new(config.chaos_seed),
                upstream,
                recorder: UsageRecorder::new(store, clock),
            }),
        })
    }

    /// Handles one request end to end. Failures are rendered as responses, never returned.
    ///
    /// If the caller goes away, hyper drops this future: a pending delay or upstream call
    /// is abandoned and no usage is recorded for the request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Bytes>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let start = Instant::now();
        let _inflight = InflightGuard::new();

        // Built-in routes only answer requests that carry no key header; keyed requests
        // for the same paths belong to the upstream.
        let builtin = !req.headers().contains_key(&self.inner.key_header);
        let path = req.uri().path().to_owned();
        let (outcome, response) = match path.as_str() {
            HEALTH_PATH if builtin => ("health", Response::new(Bytes::from("ok\n"))),
            SANDBOX_PATH if builtin && self.inner.sandbox_enabled => self.sandbox(req).await,
            _ => self.proxy(req).await,
        };

        histogram!(REQUEST_DURATION, "outcome" => outcome).record(start.elapsed().as_secs_f64());
        response
    }

    async fn proxy<B>(&self, req: Request<B>) -> (&'static str, Response<Bytes>)
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let Some(KeyedPath { key, path }) = extract_key(&req, &self.inner.key_header) else {
            return reject(ProxyError::MissingKey);
        };

        // Unknown and inactive keys are not attributed to anyone.
        let config = match self.inner.resolver.resolve(&key).await {
            Ok(config) => config,
            Err(e) => return reject(e),
        };

        let (target, outcome, response) = self.serve(&config, path, req).await;
        tracing::debug!(
            key_id = %config.id,
            target = target.map(|t| t.id.as_str()),
            status = outcome.status().as_u16(),
            outcome = outcome.label(),
            "request served"
        );
        self.inner.recorder.record(&config, target, outcome);

        (outcome.label(), response)
    }

    async fn serve<'a, B>(
        &self,
        config: &'a RoutingConfig,
        path: String,
        req: Request<B>,
    ) -> (Option<&'a Target>, RequestOutcome, Response<Bytes>)
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if !config.allows(req.method()) {
            let err = ProxyError::MethodNotAllowed {
                method: req.method().to_string(),
                allowed: config
                    .allowed_method
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            };
            return (None, RequestOutcome::Rejected(err.status()), error_response(&err));
        }

        let target = match select(config, &path) {
            Ok(target) => target,
            Err(e) => return (None, RequestOutcome::Rejected(e.status()), error_response(&e)),
        };

        let chaos = config.defaults.with_override(&target.chaos);
        let query = req.uri().query().map(String::from);
        let (outcome, response) = match self
            .inject_and_forward(&chaos, target, path, query, req)
            .await
        {
            Ok(served) => served,
            Err(e) => (outcome_for(&e), error_response(&e)),
        };

        (Some(target), outcome, response)
    }

    /// Keyless variant: everything comes from the query string and nothing is recorded.
    async fn sandbox<B>(&self, req: Request<B>) -> (&'static str, Response<Bytes>)
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let params = match sandbox::parse_request(req.uri().query()) {
            Ok(params) => params,
            Err(e) => return reject(e),
        };

        match self
            .inject_and_forward(
                &params.chaos,
                &params.target,
                params.path,
                params.query,
                req,
            )
            .await
        {
            Ok((outcome, response)) => (outcome.label(), response),
            Err(e) => reject(e),
        }
    }

    async fn inject_and_forward<B>(
        &self,
        chaos: &ChaosConfig,
        target: &Target,
        path: String,
        query: Option<String>,
        req: Request<B>,
    ) -> Result<(RequestOutcome, Response<Bytes>), ProxyError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let decision = self.inner.injector.inject(chaos);
        apply_delay(decision.delay()).await;

        if let Outcome::ShortCircuit { status, .. } = decision {
            counter!(CHAOS_INJECTED_FAILURE, "status" => status.as_u16().to_string()).increment(1);
            return Ok((
                RequestOutcome::ShortCircuited(status),
                make_error_response(status),
            ));
        }

        let request = read_inbound(req, path, query, self.inner.max_body_bytes).await?;
        let response = self.inner.upstream.forward(target, request).await?;
        Ok((RequestOutcome::Forwarded(response.status()), response))
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<BoxBody<Bytes, ProxyError>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(into_boxed(service.handle(req).await)) })
    }
}

struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

/// Waits on the tokio timer, never blocking the worker thread.
async fn apply_delay(delay: Duration) {
    if delay.is_zero() {
        return;
    }
    histogram!(CHAOS_INJECTED_LATENCY).record(delay.as_millis() as f64);
    tokio::time::sleep(delay).await;
}

async fn read_inbound<B>(
    req: Request<B>,
    path: String,
    query: Option<String>,
    limit: usize,
) -> Result<InboundRequest, ProxyError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                ProxyError::BodyTooLarge(limit)
            } else {
                ProxyError::InvalidRequest("failed to read request body".into())
            }
        })?
        .to_bytes();

    Ok(InboundRequest {
        method: parts.method,
        path,
        query,
        headers: parts.headers,
        version: parts.version,
        body,
    })
}

fn outcome_for(err: &ProxyError) -> RequestOutcome {
    match err {
        ProxyError::BodyTooLarge(_) | ProxyError::InvalidRequest(_) => {
            RequestOutcome::Rejected(err.status())
        }
        _ => RequestOutcome::Failed(err.status()),
    }
}

fn reject(err: ProxyError) -> (&'static str, Response<Bytes>) {
    tracing::debug!(error = %err, "request rejected");
    (err.kind(), error_response(&err))
}

fn error_response(err: &ProxyError) -> Response<Bytes> {
    make_json_error_response(err.status(), &err.public_message())
}
