use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{
        HeaderMap, HeaderValue, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware::{Next, from_fn, from_fn_with_state},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use banking_flow::{
    ConversationController, DataStore, InMemoryDataStore, InMemorySessionStore, MessagingGateway,
    PostgresSessionStore, RetryPolicy, Services, SessionStore,
};
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::{
    answer::RigAnswerService,
    config::ServiceConfig,
    data_store::{PostgresDataStore, seed_demo_data},
    models::{ChatRequest, ChatResponse, SessionResponse, TelegramUpdate},
    telegram::{LoggingGateway, TelegramGateway},
    telemetry::RequestMetrics,
};

pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
/// Store keys for `/chat` conversations, kept apart from Telegram chat ids
pub const HTTP_CHAT_PREFIX: &str = "http:";

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, chat_id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "chat_id": chat_id
        })),
    )
}

fn unauthorized_error(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "ok": false, "error": message })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub controller: ConversationController,
    pub webhook_secret: Option<String>,
    pub api_token: Option<String>,
    pub metrics: Arc<RequestMetrics>,
}

pub async fn create_app(config: &ServiceConfig) -> anyhow::Result<Router> {
    let app_state = create_app_state(config).await?;
    Ok(build_router(app_state))
}

async fn create_app_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let (session_store, data_store) = create_stores(config).await?;

    let answers = Arc::new(RigAnswerService::new(
        &config.openrouter_api_key,
        &config.llm_model,
        config.answer_timeout,
        RetryPolicy::default(),
    ));

    let gateway: Arc<dyn MessagingGateway> = match &config.telegram_bot_token {
        Some(token) => {
            info!("Replies are sent through the Telegram Bot API");
            Arc::new(TelegramGateway::new(
                &config.telegram_api_base,
                token,
                RetryPolicy::default(),
            )?)
        }
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set, replies are only logged");
            Arc::new(LoggingGateway)
        }
    };

    let services = Services {
        data_store,
        answers,
        verifier: config.credential_mode.verifier(),
        settings: config.flow_settings(),
    };

    if config.api_token.is_none() {
        warn!("API_TOKEN not set, /chat and /session reject every call");
    }

    Ok(AppState {
        controller: ConversationController::banking(session_store, services, gateway),
        webhook_secret: config.telegram_webhook_secret.clone(),
        api_token: config.api_token.clone(),
        metrics: Arc::new(RequestMetrics::new()?),
    })
}

async fn create_stores(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<dyn SessionStore>, Arc<dyn DataStore>)> {
    match &config.database_url {
        Some(database_url) => {
            info!("Using PostgreSQL session and data stores");
            let sessions =
                PostgresSessionStore::connect_with_idle_lifetime(database_url, config.session_idle)
                    .await?;
            let data = PostgresDataStore::connect(database_url, RetryPolicy::default()).await?;
            Ok((Arc::new(sessions), Arc::new(data)))
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory stores with demo data");
            let data = InMemoryDataStore::new();
            seed_demo_data(&data).await?;
            Ok((
                Arc::new(InMemorySessionStore::with_idle_lifetime(config.session_idle)),
                Arc::new(data),
            ))
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    let api = Router::new()
        .route("/chat", post(chat))
        .route("/session/{chat_id}", get(get_session).delete(delete_session))
        .route_layer(from_fn_with_state(app_state.clone(), require_api_token));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/telegram/webhook", post(telegram_webhook))
        .merge(api)
        .layer(from_fn_with_state(app_state.clone(), track_metrics))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tag every request with a correlation id and run it inside a span carrying it
async fn correlation_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let header = HeaderValue::from_str(&correlation_id).ok();

    if let Some(value) = &header {
        request
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, value.clone());
    }

    let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
    let mut response = next.run(request).instrument(span).await;

    if let Some(value) = header {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

async fn track_metrics(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let started = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .observe(method.as_str(), response.status().as_u16(), started.elapsed());
    response
}

/// `/chat` and `/session` need `Authorization: Bearer <API_TOKEN>`
async fn require_api_token(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token.as_deref() else {
        warn!(path = %request.uri().path(), "Rejected API call, no API_TOKEN configured");
        return Err(unauthorized_error("API access is disabled"));
    };

    let provided = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if provided != Some(expected) {
        warn!(path = %request.uri().path(), "Rejected API call with a missing or wrong token");
        return Err(unauthorized_error("invalid API token"));
    }

    Ok(next.run(request).await)
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

fn acknowledged() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Telegram delivery endpoint. Anything short of a bad secret is acknowledged so
/// Telegram does not redeliver it.
async fn telegram_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(expected) = &state.webhook_secret {
        let provided = headers
            .get(SECRET_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!("Rejected webhook call with a missing or wrong secret token");
            return Err(unauthorized_error("invalid secret token"));
        }
    }

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "Ignoring unparseable Telegram update");
            return Ok(acknowledged());
        }
    };

    let Some(message) = update.message else {
        debug!(update_id = update.update_id, "Update without a message");
        return Ok(acknowledged());
    };

    let chat_id = message.chat.id.to_string();
    info!(
        update_id = update.update_id,
        message_id = message.message_id,
        chat_id = %chat_id,
        "Telegram message received"
    );
    state
        .controller
        .handle_inbound(&chat_id, message.text.as_deref())
        .await;

    Ok(acknowledged())
}

/// Drive a conversation over plain HTTP; the reply is returned, not sent to Telegram.
/// Sessions live under `http:<chat_id>` so a caller never lands in a Telegram chat.
async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let chat_id = request.chat_id.trim();
    if chat_id.is_empty() {
        return Err(bad_request_error("chat_id is required"));
    }

    let session_key = format!("{HTTP_CHAT_PREFIX}{chat_id}");
    let reply = state.controller.respond(&session_key, &request.text).await;
    Ok(Json(ChatResponse {
        chat_id: chat_id.to_string(),
        reply: reply.text,
        state: reply.state.to_string(),
    }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<SessionResponse> {
    let store = state.controller.session_store();
    let session = store.load(&chat_id).await.map_err(|e| {
        error!(chat_id = %chat_id, error = %e, "Failed to load session");
        internal_error("Failed to load session", &e.to_string())
    })?;

    match session.and_then(|session| session.live_at(Utc::now())) {
        Some(session) => Ok(Json(SessionResponse {
            chat_id: session.chat_id.clone(),
            state: session.state.to_string(),
            authenticated: session.authenticated_user().cloned(),
        })),
        None => Err(not_found_error("Session not found", &chat_id)),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .controller
        .session_store()
        .clear(&chat_id)
        .await
        .map_err(|e| {
            error!(chat_id = %chat_id, error = %e, "Failed to clear session");
            internal_error("Failed to clear session", &e.to_string())
        })?;
    info!(chat_id = %chat_id, "Session cleared");
    Ok(StatusCode::NO_CONTENT)
}
