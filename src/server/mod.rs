//! HTTP 前端：OpenAI 兼容路由、调用方识别与错误体渲染
//!
//! OpenAI-compatible HTTP surface.
//!
//! - `POST /v1/chat/completions`
//! - `POST /v1/completions`
//! - `GET /v1/models`
//! - `GET /health`
//!
//! Bodies are parsed here rather than through the `Json` extractor so that
//! malformed JSON gets the same error body as every other rejection.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::{AuthorizationService, CallerIdentity};
use crate::gateway::{normalize_chat, normalize_completion, Gateway, GatewayResponse};
use crate::pipeline::SseMessage;
use crate::types::CanonicalRequest;
use crate::{Error, Result};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    auth: Arc<dyn AuthorizationService>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, auth: Arc<dyn AuthorizationService>) -> Self {
        Self { gateway, auth }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("gateway stopped");
    Ok(())
}

/// Error rendered as `{"error": {"message", "type", "code", "param"}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let param = err.context().and_then(|c| c.field_path.clone());
        let body = json!({
            "error": {
                "message": err.to_string(),
                "type": err.error_code().error_type(),
                "code": err.wire_code(),
                "param": param,
            }
        });
        let mut response = (status, Json(body)).into_response();
        if let Some(after) = err.retry_after() {
            let secs = after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

async fn identify(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity> {
    state.auth.identify(bearer(headers)).await
}

fn parse_body(body: &Bytes) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)?;
    if !value.is_object() {
        return Err(Error::invalid_field("body", "request body must be a JSON object"));
    }
    Ok(value)
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let caller = identify(&state, &headers).await?;
    let request = normalize_chat(&parse_body(&body)?)?;
    dispatch(&state, caller, request).await
}

async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let caller = identify(&state, &headers).await?;
    let request = normalize_completion(&parse_body(&body)?)?;
    dispatch(&state, caller, request).await
}

async fn dispatch(
    state: &AppState,
    caller: CallerIdentity,
    request: CanonicalRequest,
) -> ApiResult<Response> {
    debug!(subject = %caller.subject, model = %request.model, "dispatching");
    let cancel = CancellationToken::new();
    // Fires when the response body is dropped, i.e. the client went away.
    let guard = cancel.clone().drop_guard();

    match state.gateway.handle(request, &caller.groups, cancel).await? {
        GatewayResponse::Complete(response) => Ok(Json(response).into_response()),
        GatewayResponse::Stream(stream) => {
            let events = stream.into_sse().map(move |message| {
                let _ = &guard;
                Ok::<_, Infallible>(sse_event(message))
            });
            Ok(Sse::new(events)
                .keep_alive(KeepAlive::default())
                .into_response())
        }
    }
}

fn sse_event(message: SseMessage) -> Event {
    let event = Event::default().data(message.data);
    match message.event {
        Some(name) => event.event(name),
        None => event,
    }
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let caller = identify(&state, &headers).await?;
    let data = state.gateway.list_models(&caller.groups);
    Ok(Json(json!({ "object": "list", "data": data })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "models": state.gateway.resolver().len(),
    }))
}
