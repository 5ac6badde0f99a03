use crate::errors::ProxyError;
use crate::store::ConfigStore;
use http::header::{CONTENT_TYPE, HeaderValue};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::{into_boxed, make_error_response, make_json_error_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

const USAGE_PREFIX: &str = "/usage/";

/// Health, readiness and usage reporting, served on the admin listener.
pub struct AdminService {
    store: Arc<dyn ConfigStore>,
}

impl AdminService {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Bytes> {
        let path = req.uri().path().to_owned();

        match path.as_str() {
            "/health" => Response::new(Bytes::from("ok\n")),
            "/ready" => match self.store.is_ready() {
                true => Response::new(Bytes::from("ok\n")),
                false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            _ => match path.strip_prefix(USAGE_PREFIX) {
                Some(key_id) if !key_id.is_empty() => self.usage(key_id).await,
                _ => make_error_response(StatusCode::NOT_FOUND),
            },
        }
    }

    async fn usage(&self, key_id: &str) -> Response<Bytes> {
        let report = match self.store.usage(key_id).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                return make_json_error_response(StatusCode::NOT_FOUND, "unknown key id");
            }
            Err(e) => {
                tracing::error!(key_id, error = %e, "failed to read usage");
                let err = ProxyError::from(e);
                return make_json_error_response(err.status(), &err.public_message());
            }
        };

        match serde_json::to_vec(&report) {
            Ok(body) => {
                let mut response = Response::new(Bytes::from(body));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => {
                tracing::error!(key_id, error = %e, "failed to encode usage");
                make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, ProxyError>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = AdminService::new(self.store.clone());

        Box::pin(async move { Ok(into_boxed(service.handle(req).await)) })
    }
}
