//! Generic-over-`T` axum handlers for the six HTTP surface operations (§6):
//! create, get, list, replace, update, delete. Each mutating handler runs
//! under the idempotency cache; `get`/`list` dispatch to the SSE transport
//! when the client asks for `text/event-stream`.

use crate::auth::AuthRegistry;
use crate::response::error_response;
use crate::sse_transport;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reflecta_core::context::RequestContext;
use reflecta_core::error::Error;
use reflecta_core::filter::parse_list_opts;
use reflecta_core::idempotency::{CapturedResponse, Claim, IdempotencyCache};
use reflecta_core::json;
use reflecta_core::metadata::Record;
use reflecta_core::read::GetOutcome;
use reflecta_core::registry::TypeConfig;
use reflecta_core::{Fanout, Pipeline, Reader};
use base64::Engine;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct TypeState<T: Record> {
    pub pipeline: Pipeline<T>,
    pub reader: Reader<T>,
    pub fanout: Fanout<T>,
    pub config: Arc<TypeConfig<T>>,
    pub idempotency: Arc<IdempotencyCache>,
    pub auth: Arc<AuthRegistry>,
    pub heartbeat: Duration,
}

pub fn type_router<T: Record>(state: TypeState<T>) -> Router {
    Router::new()
        .route("/", get(list_handler::<T>).post(create_handler::<T>))
        .route(
            "/{id}",
            get(get_handler::<T>)
                .put(replace_handler::<T>)
                .patch(update_handler::<T>)
                .delete(delete_handler::<T>),
        )
        .with_state(state)
}

enum Accept {
    Json,
    Sse,
}

fn negotiate_accept(headers: &HeaderMap) -> Result<Accept, Error> {
    let Some(raw) = headers.get(axum::http::header::ACCEPT) else {
        return Ok(Accept::Json);
    };
    let raw = raw.to_str().unwrap_or("");
    if raw.is_empty() {
        return Ok(Accept::Json);
    }
    for part in raw.split(',') {
        let kind = part.split(';').next().unwrap_or("").trim();
        match kind {
            "text/event-stream" => return Ok(Accept::Sse),
            "application/json" | "*/*" | "" => return Ok(Accept::Json),
            _ => continue,
        }
    }
    Err(Error::not_acceptable(format!("unsupported Accept header: {raw}")))
}

fn require_json_body(headers: &HeaderMap) -> Result<(), Error> {
    let Some(raw) = headers.get(axum::http::header::CONTENT_TYPE) else {
        return Ok(());
    };
    let raw = raw.to_str().unwrap_or("");
    let kind = raw.split(';').next().unwrap_or("").trim();
    if kind.is_empty() || kind == "application/json" {
        Ok(())
    } else {
        Err(Error::unsupported_media_type(format!("unsupported Content-Type: {raw}")))
    }
}

fn header_str(headers: &HeaderMap, name: axum::http::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

async fn build_context(auth: &AuthRegistry, headers: &HeaderMap) -> Result<RequestContext, Error> {
    let Some(raw) = header_str(headers, axum::http::header::AUTHORIZATION) else {
        return Ok(RequestContext::anonymous());
    };

    if let Some(encoded) = raw.strip_prefix("Basic ") {
        if !auth.has_basic() {
            return Err(Error::unauthorized("Basic auth is not configured"));
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::bad_request("malformed Basic credentials"))?;
        let decoded = String::from_utf8(decoded).map_err(|_| Error::bad_request("malformed Basic credentials"))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::bad_request("malformed Basic credentials"))?;
        return match auth.verify_basic(username, password).await? {
            Some(principal) => Ok(RequestContext::with_principal(principal)),
            None => Err(Error::unauthorized("invalid Basic credentials")),
        };
    }

    if let Some(token) = raw.strip_prefix("Bearer ") {
        if !auth.has_bearer() {
            return Err(Error::unauthorized("Bearer auth is not configured"));
        }
        return match auth.verify_bearer(token.trim()).await? {
            Some(principal) => Ok(RequestContext::with_principal(principal)),
            None => Err(Error::unauthorized("invalid bearer token")),
        };
    }

    Err(Error::bad_request("unrecognized Authorization scheme"))
}

fn status_response(status: StatusCode, value: Value) -> Response {
    let etag = value.get("etag").and_then(Value::as_str).map(|s| s.to_string());
    let response = (status, Json(value)).into_response();
    match etag {
        Some(etag) => with_etag_header(response, &etag),
        None => response,
    }
}

fn with_etag_header(mut response: Response, etag: &str) -> Response {
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&format!("\"{etag}\"")) {
        response.headers_mut().insert(axum::http::header::ETAG, header_value);
    }
    response
}

/// Shared idempotency wrapper for the four mutating operations: `op` only
/// runs when `begin` hands back a fresh claim, never on replay.
async fn run_idempotent<F, Fut>(
    idempotency: &IdempotencyCache,
    method: &str,
    path: &str,
    idempotency_key: Option<&str>,
    body_bytes: &[u8],
    op: F,
) -> Result<(StatusCode, Value), Error>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, Value), Error>>,
{
    let Some(idempotency_key) = idempotency_key else {
        return op().await;
    };

    let cache_key = IdempotencyCache::cache_key(method, path, idempotency_key);
    let digest = IdempotencyCache::digest(body_bytes);

    match idempotency.begin(cache_key, &digest).await? {
        Claim::Replay(captured) => {
            let status = StatusCode::from_u16(captured.status).unwrap_or(StatusCode::OK);
            Ok((status, captured.body))
        }
        Claim::Proceed(guard) => {
            let (status, body) = op().await?;
            guard.complete(CapturedResponse { status: status.as_u16(), body: body.clone() });
            Ok((status, body))
        }
    }
}

async fn create_handler<T: Record>(
    State(state): State<TypeState<T>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match create_inner(state, headers, body).await {
        Ok((status, value)) => status_response(status, value),
        Err(e) => error_response(&e),
    }
}

async fn create_inner<T: Record>(
    state: TypeState<T>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Value), Error> {
    require_json_body(&headers)?;
    let ctx = build_context(&state.auth, &headers).await?;
    let idempotency_key = header_str(&headers, axum::http::HeaderName::from_static("idempotency-key"));
    let path = format!("/{}", state.config.api_name);
    let digest_bytes = body.clone();

    run_idempotent(
        &state.idempotency,
        "POST",
        &path,
        idempotency_key.as_deref(),
        &digest_bytes,
        move || async move {
            let record: T = json::from_value(
                serde_json::from_slice(&body).map_err(|e| Error::bad_request(format!("invalid JSON body: {e}")))?,
            )?;
            let created = state.pipeline.create(&ctx, record).await?;
            Ok((StatusCode::OK, json::to_value(&created)?))
        },
    )
    .await
}

async fn get_handler<T: Record>(
    State(state): State<TypeState<T>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match get_inner(state, id, headers).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn get_inner<T: Record>(state: TypeState<T>, id: String, headers: HeaderMap) -> Result<Response, Error> {
    let ctx = build_context(&state.auth, &headers).await?;
    let if_none_match = header_str(&headers, axum::http::header::IF_NONE_MATCH);

    match negotiate_accept(&headers)? {
        Accept::Sse => sse_transport::object_stream(&state, ctx, &id, if_none_match).await,
        Accept::Json => match state.reader.get(&ctx, &id, if_none_match.as_deref()).await? {
            GetOutcome::NotFound => Err(Error::not_found(format!("{id} not found"))),
            GetOutcome::NotModified => Ok(StatusCode::NOT_MODIFIED.into_response()),
            GetOutcome::Found(record) => Ok(status_response(StatusCode::OK, json::to_value(&record)?)),
        },
    }
}

async fn list_handler<T: Record>(
    State(state): State<TypeState<T>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    match list_inner(state, query, headers).await {
        Ok(response) => response,
        Err(e) => error_response(&e),
    }
}

async fn list_inner<T: Record>(
    state: TypeState<T>,
    query: Option<String>,
    headers: HeaderMap,
) -> Result<Response, Error> {
    let ctx = build_context(&state.auth, &headers).await?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query.as_deref().unwrap_or(""))
        .map_err(|e| Error::bad_request(format!("invalid query string: {e}")))?;
    let mut opts = parse_list_opts(&pairs)?;
    if opts.if_none_match.is_none() {
        opts.if_none_match = header_str(&headers, axum::http::header::IF_NONE_MATCH);
    }

    match negotiate_accept(&headers)? {
        Accept::Sse => {
            let if_none_match = opts.if_none_match.clone();
            sse_transport::list_stream(&state, ctx, opts, if_none_match).await
        }
        Accept::Json => {
            let result = state.reader.list(&ctx, opts).await?;
            match result.items {
                None => Ok(StatusCode::NOT_MODIFIED.into_response()),
                Some(items) => {
                    let response = (StatusCode::OK, Json(Value::Array(items))).into_response();
                    Ok(with_etag_header(response, &result.etag))
                }
            }
        }
    }
}

async fn replace_handler<T: Record>(
    State(state): State<TypeState<T>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match replace_inner(state, id, headers, body).await {
        Ok((status, value)) => status_response(status, value),
        Err(e) => error_response(&e),
    }
}

async fn replace_inner<T: Record>(
    state: TypeState<T>,
    id: String,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Value), Error> {
    require_json_body(&headers)?;
    let ctx = build_context(&state.auth, &headers).await?;
    let if_match = header_str(&headers, axum::http::header::IF_MATCH);
    let idempotency_key = header_str(&headers, axum::http::HeaderName::from_static("idempotency-key"));
    let path = format!("/{}/{{id}}", state.config.api_name);
    let digest_bytes = body.clone();

    run_idempotent(
        &state.idempotency,
        "PUT",
        &path,
        idempotency_key.as_deref(),
        &digest_bytes,
        move || async move {
            let record: T = json::from_value(
                serde_json::from_slice(&body).map_err(|e| Error::bad_request(format!("invalid JSON body: {e}")))?,
            )?;
            let replaced = state.pipeline.replace(&ctx, &id, record, if_match.as_deref()).await?;
            Ok((StatusCode::OK, json::to_value(&replaced)?))
        },
    )
    .await
}

async fn update_handler<T: Record>(
    State(state): State<TypeState<T>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match update_inner(state, id, headers, body).await {
        Ok((status, value)) => status_response(status, value),
        Err(e) => error_response(&e),
    }
}

async fn update_inner<T: Record>(
    state: TypeState<T>,
    id: String,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Value), Error> {
    require_json_body(&headers)?;
    let ctx = build_context(&state.auth, &headers).await?;
    let if_match = header_str(&headers, axum::http::header::IF_MATCH);
    let idempotency_key = header_str(&headers, axum::http::HeaderName::from_static("idempotency-key"));
    let path = format!("/{}/{{id}}", state.config.api_name);
    let digest_bytes = body.clone();

    run_idempotent(
        &state.idempotency,
        "PATCH",
        &path,
        idempotency_key.as_deref(),
        &digest_bytes,
        move || async move {
            let patch: Value =
                serde_json::from_slice(&body).map_err(|e| Error::bad_request(format!("invalid JSON body: {e}")))?;
            let updated = state.pipeline.update(&ctx, &id, patch, if_match.as_deref()).await?;
            Ok((StatusCode::OK, json::to_value(&updated)?))
        },
    )
    .await
}

async fn delete_handler<T: Record>(
    State(state): State<TypeState<T>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    match delete_inner(state, id, headers).await {
        Ok((status, _value)) => status.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn delete_inner<T: Record>(
    state: TypeState<T>,
    id: String,
    headers: HeaderMap,
) -> Result<(StatusCode, Value), Error> {
    let ctx = build_context(&state.auth, &headers).await?;
    let if_match = header_str(&headers, axum::http::header::IF_MATCH);
    let idempotency_key = header_str(&headers, axum::http::HeaderName::from_static("idempotency-key"));
    let path = format!("/{}/{{id}}", state.config.api_name);

    run_idempotent(
        &state.idempotency,
        "DELETE",
        &path,
        idempotency_key.as_deref(),
        b"",
        move || {
            let id = id.clone();
            async move {
                state.pipeline.delete(&ctx, &id, if_match.as_deref()).await?;
                Ok((StatusCode::NO_CONTENT, Value::Null))
            }
        },
    )
    .await
}
