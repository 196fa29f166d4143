//! HTTP API for health checks, quotes, order status and secret submission

pub mod relay;

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::CoordinationEngine;
use crate::error::{EscrowError, ResolverError, ResolverResult};
use crate::pricing::{Quote, QuoteEngine, QuoteRequest};
use crate::state::{OrderQuery, OrderStats, StateStore};
use crate::types::{
    now_secs, EscrowSide, Hashlock, Intent, Order, OrderStatus, Secret, Stage, StageOffsets,
    Timelocks,
};

use axum::{
    async_trait,
    extract::rejection::{JsonRejection, QueryRejection},
    extract::{FromRequest, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::H256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub chains: Arc<ChainManager>,
    pub store: Arc<dyn StateStore>,
    pub quotes: Arc<QuoteEngine>,
    pub engine: Arc<CoordinationEngine>,
    /// Offsets used when publishing demo orders on simulated chains
    pub timelocks: StageOffsets,
    pub started_at: Instant,
}

/// Response envelope shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Error rendered as `{ "success": false, "error": ... }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ResolverError> for ApiError {
    fn from(err: ResolverError) -> Self {
        let status = match &err {
            ResolverError::OrderNotFound { .. } | ResolverError::SecretUnavailable { .. } => {
                StatusCode::NOT_FOUND
            }
            ResolverError::Escrow(EscrowError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ResolverError::UnsupportedChain { .. }
            | ResolverError::InvalidIntent(_)
            | ResolverError::Quote(_)
            | ResolverError::Escrow(_) => StatusCode::BAD_REQUEST,
            ResolverError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// JSON body whose rejections are rendered in the response envelope
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/chains", get(get_chains))
        .route("/stats", get(get_stats))
        .route("/quote", post(create_quote))
        .route("/quote/:id", get(get_quote))
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/:hash", get(get_order))
        .route("/orders/:hash/secret", post(submit_secret))
        .route("/escrows/:hash/:side/timelocks", get(get_timelocks))
        .route("/relay", get(relay::relay_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> ResolverResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ResolverError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ResolverError::Internal(format!("API server: {}", e)))
}

fn parse_hash(raw: &str) -> Result<H256, ApiError> {
    H256::from_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid order hash: {}", raw)))
}

/// Health check endpoint - basic liveness
async fn health_check() -> Json<ApiResponse<HealthResponse>> {
    ok(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify store and chains
async fn readiness_check(State(state): State<AppState>) -> Response {
    let store_ok = state.store.health_check().await.is_ok();
    let chain_health = state.chains.health_check().await;
    let chains_ok = !chain_health.is_empty() && chain_health.iter().all(|(_, healthy)| *healthy);

    let body = ReadinessResponse {
        ready: store_ok && chains_ok,
        store: store_ok,
        chains: chains_ok,
        details: chain_status(chain_health),
    };

    if body.ready {
        (StatusCode::OK, ok(body)).into_response()
    } else {
        let envelope = ApiResponse {
            success: false,
            data: Some(body),
            error: Some("not ready".to_string()),
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(envelope)).into_response()
    }
}

/// Get resolver status
async fn get_status(State(state): State<AppState>) -> ApiResult<StatusResponse> {
    let chain_health = state.chains.health_check().await;

    Ok(ok(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        store_backend: state.store.backend(),
        connected_chains: state.chains.connected_chains(),
        chain_status: chain_status(chain_health),
        active_executions: state.engine.active_executions().await,
        pending_refunds: state.engine.pending_refunds(),
        cached_quotes: state.quotes.cached(),
    }))
}

/// Get connected chains
async fn get_chains(State(state): State<AppState>) -> ApiResult<ChainsResponse> {
    Ok(ok(ChainsResponse {
        chains: state.chains.connected_chains(),
    }))
}

/// Get order statistics
async fn get_stats(State(state): State<AppState>) -> ApiResult<StatsResponse> {
    let stats = state.store.stats().await?;
    Ok(ok(StatsResponse {
        total: stats.total(),
        orders: stats,
    }))
}

async fn create_quote(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QuoteRequest>,
) -> ApiResult<Quote> {
    Ok(ok(state.quotes.quote(&request, now_secs())?))
}

async fn get_quote(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Quote> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::bad_request(format!("Invalid quote id: {}", id)))?;
    state
        .quotes
        .get(&id, now_secs())
        .map(ok)
        .ok_or_else(|| ApiError::not_found(format!("Quote {} not found or expired", id)))
}

/// Publish an order on a simulated source chain
async fn create_order(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateOrderRequest>,
) -> ApiResult<CreateOrderResponse> {
    let chain = state.chains.simulated(request.intent.src_chain_id)?;
    state.chains.get(request.intent.dst_chain_id)?;

    let order_hash = chain
        .submit_order(
            request.intent,
            request.hashlock,
            Timelocks::pack(&state.timelocks, 0),
        )
        .await?;
    Ok(ok(CreateOrderResponse { order_hash }))
}

/// Page through known orders, optionally by status
async fn list_orders(
    State(state): State<AppState>,
    params: Result<Query<ListOrdersParams>, QueryRejection>,
) -> ApiResult<ListOrdersResponse> {
    let Query(params) = params?;
    let status = params
        .status
        .as_deref()
        .map(OrderStatus::from_str)
        .transpose()
        .map_err(ApiError::bad_request)?;

    let query = OrderQuery {
        status,
        offset: params.offset.unwrap_or(0),
        limit: params.limit,
    };
    let orders = state.store.list_orders(&query).await?;

    Ok(ok(ListOrdersResponse {
        offset: query.offset,
        limit: query.page_size(),
        count: orders.len(),
        orders,
    }))
}

async fn get_order(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult<Order> {
    let order_hash = parse_hash(&hash)?;
    let order = state
        .store
        .get_order(order_hash)
        .await?
        .ok_or_else(|| ResolverError::OrderNotFound {
            order_hash: format!("{:?}", order_hash),
        })?;
    Ok(ok(order))
}

async fn submit_secret(
    State(state): State<AppState>,
    Path(hash): Path<String>,
    ApiJson(request): ApiJson<SecretRequest>,
) -> ApiResult<SecretResponse> {
    let order_hash = parse_hash(&hash)?;
    let accepted = state.engine.submit_secret(order_hash, request.secret)?;
    Ok(ok(SecretResponse { order_hash, accepted }))
}

async fn get_timelocks(
    State(state): State<AppState>,
    Path((hash, side)): Path<(String, String)>,
) -> ApiResult<TimelocksResponse> {
    let order_hash = parse_hash(&hash)?;
    let side = EscrowSide::from_str(&side).map_err(ApiError::bad_request)?;

    let order = state
        .store
        .get_order(order_hash)
        .await?
        .ok_or_else(|| ResolverError::OrderNotFound {
            order_hash: format!("{:?}", order_hash),
        })?;
    let chain_id = match side {
        EscrowSide::Source => order.intent.src_chain_id,
        EscrowSide::Destination => order.intent.dst_chain_id,
    };

    let escrow = state
        .chains
        .simulated(chain_id)?
        .registry()
        .get(order_hash, side)
        .ok_or_else(|| EscrowError::NotFound {
            order_hash: format!("{:?}", order_hash),
            side,
        })
        .map_err(ResolverError::from)?;

    let stages = match side {
        EscrowSide::Source => &Stage::ALL[..4],
        EscrowSide::Destination => &Stage::ALL[4..],
    };

    Ok(ok(TimelocksResponse {
        order_hash,
        side,
        chain_id,
        state: escrow.state.as_str(),
        deployed_at: escrow.immutables.timelocks.deployed_at(),
        stages: stages
            .iter()
            .map(|stage| StageTime {
                stage: stage.name(),
                opens_at: escrow.get_timelock(*stage),
            })
            .collect(),
    }))
}

fn chain_status(health: Vec<(u64, bool)>) -> Vec<ChainHealth> {
    health
        .into_iter()
        .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
        .collect()
}

// Request types

#[derive(Deserialize)]
struct CreateOrderRequest {
    intent: Intent,
    hashlock: Hashlock,
}

#[derive(Deserialize)]
struct SecretRequest {
    secret: Secret,
}

#[derive(Deserialize)]
struct ListOrdersParams {
    status: Option<String>,
    offset: Option<u64>,
    limit: Option<u32>,
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    store_backend: &'static str,
    connected_chains: Vec<u64>,
    chain_status: Vec<ChainHealth>,
    active_executions: usize,
    pending_refunds: usize,
    cached_quotes: usize,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<u64>,
}

#[derive(Serialize)]
struct StatsResponse {
    total: u64,
    orders: OrderStats,
}

#[derive(Serialize)]
struct ListOrdersResponse {
    orders: Vec<Order>,
    offset: u64,
    limit: u32,
    count: usize,
}

#[derive(Serialize)]
struct CreateOrderResponse {
    order_hash: H256,
}

#[derive(Serialize)]
struct SecretResponse {
    order_hash: H256,
    accepted: bool,
}

#[derive(Serialize)]
struct TimelocksResponse {
    order_hash: H256,
    side: EscrowSide,
    chain_id: u64,
    state: &'static str,
    deployed_at: u32,
    stages: Vec<StageTime>,
}

#[derive(Serialize)]
struct StageTime {
    stage: &'static str,
    opens_at: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::ChainClient;
    use crate::config::tests::sample_settings;
    use crate::coordination::SecretStore;
    use crate::state::MemoryStore;
    use crate::types::order::tests::sample_intent;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::Address;
    use serde_json::{json, Value};
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    pub(crate) struct TestApp {
        pub state: AppState,
        pub secrets: Arc<SecretStore>,
    }

    pub(crate) async fn test_app() -> TestApp {
        let settings = sample_settings();
        let chains = Arc::new(ChainManager::from_settings(&settings).await.unwrap());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let quotes = Arc::new(QuoteEngine::new(&settings.pricing).unwrap());
        let secrets = Arc::new(SecretStore::new());
        let engine = Arc::new(CoordinationEngine::new(
            chains.clone(),
            store.clone(),
            secrets.clone(),
            quotes.clone(),
            &settings,
            Arc::new(RwLock::new(false)),
        ));

        TestApp {
            state: AppState {
                chains,
                store,
                quotes,
                engine,
                timelocks: settings.timelocks,
                started_at: Instant::now(),
            },
            secrets,
        }
    }

    async fn call(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn quote_body(src_chain_id: u64) -> Value {
        json!({
            "src_chain_id": src_chain_id,
            "dst_chain_id": 137,
            "src_token": "0x1111111111111111111111111111111111111111",
            "dst_token": "0x2222222222222222222222222222222222222222",
            "src_amount": "1000000000000000000"
        })
    }

    #[tokio::test]
    async fn test_health_and_chains() {
        let app = test_app().await;

        let (status, body) = call(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");

        let (_, body) = call(&app, get("/chains")).await;
        assert_eq!(body["data"]["chains"], json!([1, 137]));

        let (status, body) = call(&app, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ready"], true);

        let (_, body) = call(&app, get("/status")).await;
        assert_eq!(body["data"]["pending_refunds"], 0);
        assert_eq!(body["data"]["store_backend"], "memory");
    }

    #[tokio::test]
    async fn test_quote_roundtrip_through_cache() {
        let app = test_app().await;

        let (status, body) = call(&app, post("/quote", quote_body(1))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["dst_amount"], "1994000000");
        assert_eq!(body["data"]["min_dst_amount"], "1984030000");

        let id = body["data"]["id"].as_str().unwrap().to_string();
        let (status, body) = call(&app, get(&format!("/quote/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_errors_use_envelope() {
        let app = test_app().await;

        let (status, body) = call(&app, post("/quote", quote_body(42))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "Unsupported chain 42"}));

        let (status, body) = call(&app, get(&format!("/orders/{:?}", H256::repeat_byte(5)))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = call(&app, get("/orders/not-a-hash")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, get(&format!("/quote/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_bodies_use_envelope() {
        let app = test_app().await;

        let (status, body) = call(&app, post("/quote", json!({"src_chain_id": "oops"}))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("Failed to deserialize"));

        let broken = Request::post("/quote")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(&app, broken).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let untyped = Request::post(format!("/orders/{:?}/secret", H256::repeat_byte(1)))
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = call(&app, untyped).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_list_orders() {
        let app = test_app().await;
        let resolver = Address::repeat_byte(0xbb);
        for salt in 0..3u64 {
            let mut intent = sample_intent();
            intent.salt = salt.into();
            let mut order = Order::from_intent(
                intent,
                Secret::random().hashlock(),
                Timelocks::default(),
                resolver,
                resolver,
                1,
            );
            if salt == 0 {
                order.set_status(OrderStatus::Completed);
            }
            app.state.store.upsert_order(&order).await.unwrap();
        }

        let (status, body) = call(&app, get("/orders")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["count"], 3);
        assert_eq!(body["data"]["limit"], 30);

        let (_, body) = call(&app, get("/orders?status=completed")).await;
        assert_eq!(body["data"]["count"], 1);
        assert_eq!(body["data"]["orders"][0]["status"], "completed");

        let (_, body) = call(&app, get("/orders?offset=1&limit=1")).await;
        assert_eq!(body["data"]["count"], 1);
        assert_eq!(body["data"]["offset"], 1);

        let (status, body) = call(&app, get("/orders?status=bogus")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown order status: bogus");

        let (status, body) = call(&app, get("/orders?limit=-1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_secret_submission() {
        let app = test_app().await;
        let secret = Secret::random();
        let order_hash = H256::repeat_byte(7);
        app.secrets.register(order_hash, secret.hashlock());
        let uri = format!("/orders/{:?}/secret", order_hash);

        let wrong = json!({ "secret": Secret::new([1u8; 32]).to_hex() });
        let (status, body) = call(&app, post(&uri, wrong)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid secret");

        let (status, body) = call(&app, post(&uri, json!({ "secret": secret.to_hex() }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["accepted"], true);
        assert_eq!(app.secrets.get(order_hash), Some(secret));
    }

    #[tokio::test]
    async fn test_create_order_on_simulated_chain() {
        let app = test_app().await;
        let intent = sample_intent();
        let body = json!({
            "intent": serde_json::to_value(&intent).unwrap(),
            "hashlock": Secret::random().hashlock(),
        });

        let (status, body) = call(&app, post("/orders", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["data"]["order_hash"],
            serde_json::to_value(intent.order_hash()).unwrap()
        );

        let chain = app.state.chains.simulated(1).unwrap();
        assert_eq!(chain.block_number().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_escrow_timelocks() {
        let app = test_app().await;
        let resolver = Address::from_str("0x00000000000000000000000000000000000000bb").unwrap();
        let order = Order::from_intent(
            sample_intent(),
            Secret::random().hashlock(),
            Timelocks::pack(&app.state.timelocks, 0),
            resolver,
            resolver,
            1,
        );
        app.state.store.upsert_order(&order).await.unwrap();
        let chain = app.state.chains.simulated(1).unwrap();
        chain.deploy_src_escrow(&order.src_immutables).await.unwrap();

        let uri = format!("/escrows/{:?}/src/timelocks", order.order_hash);
        let (status, body) = call(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "locked");

        let deployed_at = body["data"]["deployed_at"].as_u64().unwrap();
        let stages = body["data"]["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 4);
        assert_eq!(stages[2]["stage"], "src_cancellation");
        assert_eq!(stages[2]["opens_at"].as_u64().unwrap(), deployed_at + 300);

        let uri = format!("/escrows/{:?}/dst/timelocks", order.order_hash);
        let (status, _) = call(&app, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
