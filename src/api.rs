//! REST API server
//!
//! Receives SMS replies from Twilio and exposes coin balances and
//! lottery entry purchases.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{Impulses, ReplyOutcome};
use crate::error::ImpulsesError;

/// =============================
/// Request Models
/// =============================

/// Twilio's inbound message webhook fields
#[derive(Debug, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct EntryRequest {
    pub user_id: Uuid,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn error_status(err: &ImpulsesError) -> StatusCode {
    match err {
        ImpulsesError::UserNotFound(_) | ImpulsesError::LotteryNotFound(_) => StatusCode::NOT_FOUND,
        ImpulsesError::InsufficientCoins { .. } | ImpulsesError::LotteryClosed(_) => {
            StatusCode::CONFLICT
        }
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fail(err: ImpulsesError) -> ApiResult {
    let status = error_status(&err);
    if status.is_server_error() {
        warn!("Request failed: {}", err);
    }
    (status, Json(ApiResponse::error(err.to_string())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<Impulses>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// SMS Webhook
/// =============================

type TwimlResult = (StatusCode, [(header::HeaderName, &'static str); 1], String);

const EMPTY_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response/>";

fn twiml(status: StatusCode, body: String) -> TwimlResult {
    (status, [(header::CONTENT_TYPE, "text/xml")], body)
}

/// TwiML reply for a handled SMS. Only a confirmed saving gets a text back.
pub fn reply_twiml(outcome: &ReplyOutcome) -> String {
    match outcome {
        ReplyOutcome::Saved {
            coins_awarded,
            balance,
            ..
        } => format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Message>Nice work! You earned {} coins. Your balance is {} coins.</Message></Response>",
            coins_awarded, balance
        ),
        ReplyOutcome::Acknowledged { .. } => EMPTY_TWIML.to_string(),
    }
}

async fn inbound_sms(State(state): State<ApiState>, Form(sms): Form<InboundSms>) -> TwimlResult {
    info!(from = %sms.from, "Inbound SMS");

    match state
        .app
        .handle_reply(&sms.from, &sms.body, chrono::Utc::now())
        .await
    {
        Ok(outcome) => twiml(StatusCode::OK, reply_twiml(&outcome)),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                warn!("Inbound SMS failed: {}", e);
            } else {
                info!(from = %sms.from, "Inbound SMS rejected: {}", e);
            }
            twiml(status, EMPTY_TWIML.to_string())
        }
    }
}

/// =============================
/// Coins and Lotteries
/// =============================

async fn coin_balance(State(state): State<ApiState>, Path(user_id): Path<String>) -> ApiResult {
    let user_id = match Uuid::parse_str(&user_id) {
        Ok(id) => id,
        Err(e) => return fail(e.into()),
    };

    match state.app.coins.balance(user_id).await {
        Ok(coins) => ok(serde_json::json!({ "user_id": user_id, "coins": coins })),
        Err(e) => fail(e),
    }
}

async fn enter_lottery(
    State(state): State<ApiState>,
    Path(lottery_id): Path<String>,
    Json(req): Json<EntryRequest>,
) -> ApiResult {
    let lottery_id = match Uuid::parse_str(&lottery_id) {
        Ok(id) => id,
        Err(e) => return fail(e.into()),
    };

    match state
        .app
        .coins
        .enter_lottery(req.user_id, lottery_id, chrono::Utc::now())
        .await
    {
        Ok(entry) => ok(entry),
        Err(e) => fail(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(app: Arc<Impulses>) -> Router {
    let state = ApiState { app };

    Router::new()
        .route("/health", get(health))
        .route("/api/sms/inbound", post(inbound_sms))
        .route("/api/users/:user_id/coins", get(coin_balance))
        .route("/api/lotteries/:lottery_id/entries", post(enter_lottery))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    app: Arc<Impulses>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(app);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
