//! Assembles the per-process `axum::Router`: one sub-router per registered
//! type, mounted at `/{apiName}`, under a top-level middleware layer that
//! sets `Cache-Control: no-store` and the CORS headers on every response and
//! short-circuits `OPTIONS` before it reaches a handler (§10.M).

use crate::auth::AuthRegistry;
use crate::handlers::{self, TypeState};
use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use reflecta_core::idempotency::IdempotencyCache;
use reflecta_core::metadata::Record;
use reflecta_core::registry::TypeConfig;
use reflecta_core::{Fanout, Pipeline, Reader};
use reflecta_store::RecordStore;
use std::sync::Arc;
use std::time::Duration;

/// Per-type overrides accepted by [`AppBuilder::mount`]. Kept as its own type
/// rather than more `mount` parameters since it's expected to grow with
/// future per-type transport concerns.
#[derive(Clone, Debug, Default)]
pub struct MountOptions {
    /// Heartbeat interval for this type's SSE streams. `None` uses the
    /// builder-wide default set by [`AppBuilder::heartbeat`].
    pub heartbeat: Option<Duration>,
}

pub struct AppBuilder {
    store: Arc<dyn RecordStore>,
    idempotency: Arc<IdempotencyCache>,
    auth: Arc<AuthRegistry>,
    heartbeat: Duration,
    router: Router,
}

impl AppBuilder {
    pub fn new(store: Arc<dyn RecordStore>, idempotency_ttl: Duration) -> Self {
        AppBuilder {
            auth: Arc::new(AuthRegistry::new(store.clone())),
            store,
            idempotency: Arc::new(IdempotencyCache::new(idempotency_ttl)),
            heartbeat: Duration::from_secs(5),
            router: Router::new(),
        }
    }

    /// Default SSE heartbeat interval for types that don't override it via
    /// `MountOptions`.
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Mounts `config` at `/{config.api_name}`. Does not call
    /// `TypeConfig::check_safe` itself: an unsafe type is still served, and
    /// it's the operator's call whether to assert safety before relying on
    /// it in production.
    pub fn mount<T: Record>(self, config: Arc<TypeConfig<T>>) -> Self {
        self.mount_with(config, MountOptions::default())
    }

    pub fn mount_with<T: Record>(mut self, config: Arc<TypeConfig<T>>, options: MountOptions) -> Self {
        if let Some(binding) = &config.auth_basic {
            self.auth.set_basic(config.api_name.clone(), binding.clone());
        }
        if let Some(binding) = &config.auth_bearer {
            self.auth.set_bearer(config.api_name.clone(), binding.clone());
        }

        let state = TypeState {
            pipeline: Pipeline::new(self.store.clone(), config.clone()),
            reader: Reader::new(self.store.clone(), config.clone()),
            fanout: Fanout::new(self.store.clone(), config.clone()),
            idempotency: self.idempotency.clone(),
            auth: self.auth.clone(),
            heartbeat: options.heartbeat.unwrap_or(self.heartbeat),
            config,
        };

        let mount_path = format!("/{}", state.config.api_name);
        self.router = self.router.nest(&mount_path, handlers::type_router(state));
        self
    }

    pub fn build(self) -> Router {
        self.router.layer(middleware::from_fn(cors_and_no_store))
    }
}

async fn cors_and_no_store(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight_response();
    }

    let mut response = next.run(request).await;
    apply_ambient_headers(&mut response);
    response
}

fn preflight_response() -> Response {
    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    apply_ambient_headers(&mut response);
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, if-match, if-none-match, idempotency-key, authorization"),
    );
    response
}

fn apply_ambient_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static("ETag"));
}
