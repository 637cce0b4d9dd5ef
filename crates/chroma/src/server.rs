//! JSON/RPC server: one POST route per operation under `/v1`.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use chroma_core::crowdsale::PriceSchedule;
use chroma_core::operations::{
    BalanceEntry, DistributeOutcome, ProcessedTransaction, UnspentEntry,
};
use chroma_core::{Controller, CoreError, Mode};

// ==============================================================================
// Application State
// ==============================================================================

pub struct AppState {
    pub controller: Controller,
}

type SharedState = Arc<AppState>;

// ==============================================================================
// Router
// ==============================================================================

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/getbalance", post(get_balance))
        .route("/v1/listunspent", post(list_unspent))
        .route("/v1/sendbitcoin", post(send_bitcoin))
        .route("/v1/sendasset", post(send_asset))
        .route("/v1/issueasset", post(issue_asset))
        .route("/v1/distribute", post(distribute))
        .layer(cors)
        .with_state(Arc::new(state))
}

// ==============================================================================
// Handlers
// ==============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AddressQuery {
    address: Option<String>,
}

async fn get_balance(
    State(state): State<SharedState>,
    req: Result<Json<AddressQuery>, JsonRejection>,
) -> Result<Json<Vec<BalanceEntry>>, AppError> {
    let Json(req) = req.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let address = req
        .address
        .map(|a| state.controller.parse_address(&a))
        .transpose()?;
    Ok(Json(state.controller.get_balance(address.as_ref()).await?))
}

async fn list_unspent(
    State(state): State<SharedState>,
    req: Result<Json<AddressQuery>, JsonRejection>,
) -> Result<Json<Vec<UnspentEntry>>, AppError> {
    let Json(req) = req.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let address = req
        .address
        .map(|a| state.controller.parse_address(&a))
        .transpose()?;
    Ok(Json(state.controller.list_unspent(address.as_ref()).await?))
}

fn default_transaction_mode() -> String {
    "broadcast".to_owned()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SendBitcoinRequest {
    from: String,
    amount: u64,
    to: String,
    fee: Option<u64>,
    #[serde(default = "default_transaction_mode")]
    mode: String,
}

async fn send_bitcoin(
    State(state): State<SharedState>,
    req: Result<Json<SendBitcoinRequest>, JsonRejection>,
) -> Result<Json<ProcessedTransaction>, AppError> {
    let Json(req) = req.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let from = state.controller.parse_address(&req.from)?;
    let to = state.controller.parse_address(&req.to)?;
    let mode: Mode = req.mode.parse()?;
    Ok(Json(
        state
            .controller
            .send_bitcoin(&from, req.amount, &to, req.fee, mode)
            .await?,
    ))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SendAssetRequest {
    from: String,
    asset_id: String,
    quantity: u64,
    to: String,
    fee: Option<u64>,
    #[serde(default = "default_transaction_mode")]
    mode: String,
}

async fn send_asset(
    State(state): State<SharedState>,
    req: Result<Json<SendAssetRequest>, JsonRejection>,
) -> Result<Json<ProcessedTransaction>, AppError> {
    let Json(req) = req.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let from = state.controller.parse_address(&req.from)?;
    let to = state.controller.parse_address(&req.to)?;
    let asset_id = state.controller.parse_asset_id(&req.asset_id)?;
    let mode: Mode = req.mode.parse()?;
    Ok(Json(
        state
            .controller
            .send_asset(&from, &asset_id, req.quantity, &to, req.fee, mode)
            .await?,
    ))
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct IssueAssetRequest {
    from: String,
    quantity: u64,
    to: Option<String>,
    #[serde(default)]
    metadata: String,
    fee: Option<u64>,
    #[serde(default = "default_transaction_mode")]
    mode: String,
}

async fn issue_asset(
    State(state): State<SharedState>,
    req: Result<Json<IssueAssetRequest>, JsonRejection>,
) -> Result<Json<ProcessedTransaction>, AppError> {
    let Json(req) = req.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let from = state.controller.parse_address(&req.from)?;
    let to = req
        .to
        .map(|a| state.controller.parse_address(&a))
        .transpose()?;
    let mode: Mode = req.mode.parse()?;
    Ok(Json(
        state
            .controller
            .issue_asset(
                &from,
                req.quantity,
                to.as_ref(),
                req.metadata.into_bytes(),
                req.fee,
                mode,
            )
            .await?,
    ))
}

fn default_distribute_mode() -> String {
    "preview".to_owned()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DistributeRequest {
    sale_id: String,
    address: String,
    /// Must differ from `address`.
    forward: String,
    /// `5000` or `0:5000,100000:6000` (threshold:price pairs).
    price: String,
    reserve: Option<u64>,
    #[serde(default)]
    metadata: String,
    fee: Option<u64>,
    #[serde(default = "default_distribute_mode")]
    mode: String,
}

async fn distribute(
    State(state): State<SharedState>,
    req: Result<Json<DistributeRequest>, JsonRejection>,
) -> Result<Json<DistributeOutcome>, AppError> {
    let Json(req) = req.map_err(|e| AppError::BadRequest(e.to_string()))?;
    let address = state.controller.parse_address(&req.address)?;
    let forward = state.controller.parse_address(&req.forward)?;
    let schedule = PriceSchedule::parse(&req.price)?;
    let mode: Mode = req.mode.parse()?;
    Ok(Json(
        state
            .controller
            .distribute(
                &req.sale_id,
                &address,
                &forward,
                &schedule,
                req.reserve,
                req.metadata.into_bytes(),
                req.fee,
                mode,
            )
            .await?,
    ))
}

// ==============================================================================
// Error Type
// ==============================================================================

enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    NotImplemented(String),
    BadGateway(String),
    Internal(String),
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match &err {
            CoreError::InvalidAddress { .. }
            | CoreError::InvalidAssetId(_)
            | CoreError::InvalidData(_)
            | CoreError::InvalidScript
            | CoreError::InvalidPriceSchedule(_)
            | CoreError::QuantityOverflow(_)
            | CoreError::NotAMarker
            | CoreError::MalformedMarker(_)
            | CoreError::OutputBelowDust { .. }
            | CoreError::InsufficientFunds { .. }
            | CoreError::InsufficientAssets { .. }
            | CoreError::InsufficientColor { .. }
            | CoreError::InsufficientReserve { .. } => Self::BadRequest(err.to_string()),
            CoreError::TxNotFound(_) => Self::NotFound(err.to_string()),
            CoreError::ReservationConflict(_) => Self::Conflict(err.to_string()),
            CoreError::Unsupported { .. } => Self::NotImplemented(err.to_string()),
            CoreError::Rpc(_) => Self::BadGateway(err.to_string()),
            CoreError::IncompleteSignature | CoreError::Store(_) | CoreError::Io(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::NotImplemented(msg) => (StatusCode::NOT_IMPLEMENTED, msg),
            Self::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
