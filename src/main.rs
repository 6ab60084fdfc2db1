//! Thin HTTP surface over the exchange boundary adapters.
//!
//! Allow-listing, per-user market visibility, and the per-(user, market)
//! trade cooldown all live here, outside the engine.

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use exchange_engine::api;
use exchange_engine::bots;
use exchange_engine::config::Config;
use exchange_engine::database;
use exchange_engine::error::ExchangeError;
use exchange_engine::ledger;
use exchange_engine::lmsr::Side;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    config: Arc<Config>,
    /// Last trade instant per (username, market), for the cooldown.
    cooldowns: Arc<Mutex<HashMap<(String, i64), Instant>>>,
}

fn message(status: StatusCode, text: impl Into<String>) -> ApiError {
    (status, Json(json!({ "message": text.into() })))
}

/// Map engine errors onto HTTP statuses. Fatal kinds indicate engine/state
/// bugs: they are logged for the operator and reported as 500.
fn engine_error(err: ExchangeError) -> ApiError {
    if err.is_fatal() {
        error!(error = %err, "engine failure");
        return message(StatusCode::INTERNAL_SERVER_ERROR, format!("Trade failed: {err}"));
    }
    let status = match err {
        ExchangeError::MarketNotFound
        | ExchangeError::UserNotFound
        | ExchangeError::PositionNotFound => StatusCode::NOT_FOUND,
        ExchangeError::AccessDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::BAD_REQUEST,
    };
    message(status, err.to_string())
}

fn check_allowed(state: &AppState, username: &str) -> Result<(), ApiError> {
    if ledger::is_system_username(username) {
        return Err(message(StatusCode::FORBIDDEN, "User not allowed"));
    }
    if let Some(allowed) = &state.config.http.allowed_usernames {
        if !allowed.contains(username) {
            return Err(message(StatusCode::FORBIDDEN, "User not allowed"));
        }
    }
    Ok(())
}

fn parse_side(raw: &str) -> Result<Side, ApiError> {
    raw.parse::<Side>().map_err(engine_error)
}

fn is_market_visible(config: &Config, market_name: &str, username: &str) -> bool {
    config
        .http
        .hidden_prefixes
        .get(username)
        .map_or(true, |prefixes| {
            !prefixes.iter().any(|p| market_name.starts_with(p))
        })
}

async fn check_cooldown(state: &AppState, username: &str, market_id: i64) -> Result<(), ApiError> {
    let cooldown = state.config.http.cooldown_seconds;
    if cooldown == 0 {
        return Ok(());
    }
    let cooldowns = state.cooldowns.lock().await;
    if let Some(last) = cooldowns.get(&(username.to_string(), market_id)) {
        let elapsed = last.elapsed();
        if elapsed < Duration::from_secs(cooldown) {
            let remaining = cooldown - elapsed.as_secs();
            return Err(message(
                StatusCode::TOO_MANY_REQUESTS,
                format!("Too many trades in this market. Please wait {remaining} seconds."),
            ));
        }
    }
    Ok(())
}

async fn record_trade_time(state: &AppState, username: &str, market_id: i64) {
    state
        .cooldowns
        .lock()
        .await
        .insert((username.to_string(), market_id), Instant::now());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL env var is not set")?;

    let pool = database::create_pool(&database_url, &config.pool).await?;
    database::create_schema(&pool).await?;

    if config.bots.enabled {
        info!("launching bot trading loop");
        tokio::spawn(bots::run_bot_loop(pool.clone(), config.clone()));
    } else {
        info!("bots disabled (set ENABLE_BOTS=true to enable)");
    }

    let state = AppState {
        pool,
        config: config.clone(),
        cooldowns: Arc::new(Mutex::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/users/create", post(create_user))
        .route("/users/login", post(login_user))
        .route("/users/:username", get(get_user))
        .route("/users/:username/portfolio", get(get_portfolio))
        .route("/markets/create", post(create_market))
        .route("/markets", get(get_markets))
        .route("/markets/for_user", get(get_markets_for_user))
        .route("/markets/preview", get(preview))
        .route("/markets/buy", post(buy))
        .route("/markets/sell", post(sell))
        .route("/markets/settle", post(settle))
        .route("/markets/:market_id", get(get_market))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    info!(%addr, "exchange listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "bots_enabled": state.config.bots.enabled }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "healthy", "bots_active": state.config.bots.enabled }))
}

#[derive(Deserialize)]
struct UserQuery {
    username: String,
}

async fn create_user(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Value> {
    check_allowed(&state, &query.username)?;
    let account = api::register_user(&state.pool, &state.config, &query.username)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "message": format!("User {} created", account.username),
        "points": account.points,
    })))
}

async fn login_user(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Value> {
    check_allowed(&state, &query.username)?;
    let account = api::register_user(&state.pool, &state.config, &query.username)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "username": account.username,
        "points": account.points,
    })))
}

async fn get_user(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<api::UserSnapshot> {
    check_allowed(&state, &username)?;
    let snapshot = api::snapshot_user(&state.pool, &username)
        .await
        .map_err(engine_error)?;
    Ok(Json(snapshot))
}

async fn get_portfolio(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<api::PortfolioSnapshot> {
    check_allowed(&state, &username)?;
    let snapshot = api::snapshot_portfolio(&state.pool, &username)
        .await
        .map_err(engine_error)?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
struct CreateMarketQuery {
    name: String,
    b: Option<f64>,
}

async fn create_market(
    State(state): State<AppState>,
    Query(query): Query<CreateMarketQuery>,
) -> ApiResult<Value> {
    let market = api::create_market(&state.pool, &state.config, &query.name, query.b)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "message": format!("Market '{}' created successfully.", market.name),
        "b": market.b,
    })))
}

async fn get_markets(State(state): State<AppState>) -> ApiResult<Vec<api::MarketSummary>> {
    let markets = api::list_markets(&state.pool, None)
        .await
        .map_err(engine_error)?;
    Ok(Json(markets))
}

async fn get_markets_for_user(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Vec<api::MarketSummary>> {
    check_allowed(&state, &query.username)?;
    let config = state.config.clone();
    let visible = move |market: &str, user: &str| is_market_visible(&config, market, user);
    let markets = api::list_markets(&state.pool, Some((&query.username, &visible)))
        .await
        .map_err(engine_error)?;
    Ok(Json(markets))
}

async fn get_market(
    State(state): State<AppState>,
    Path(market_id): Path<i64>,
) -> ApiResult<api::MarketDetail> {
    let detail = api::market_detail(&state.pool, market_id)
        .await
        .map_err(engine_error)?;
    Ok(Json(detail))
}

#[derive(Deserialize)]
struct TradeQuery {
    market_id: i64,
    username: String,
    quantity: Option<i64>,
    #[serde(rename = "yesOrNo", default = "default_side")]
    yes_or_no: String,
    points: Option<f64>,
}

fn default_side() -> String {
    "yes".to_string()
}

async fn preview(
    State(state): State<AppState>,
    Query(query): Query<TradeQuery>,
) -> ApiResult<api::PreviewOutcome> {
    check_allowed(&state, &query.username)?;
    let side = parse_side(&query.yes_or_no)?;
    let config = state.config.clone();
    let visible = move |market: &str, user: &str| is_market_visible(&config, market, user);
    let outcome = api::preview(
        &state.pool,
        query.market_id,
        &query.username,
        side,
        query.quantity,
        query.points,
        Some(&visible),
    )
    .await
    .map_err(engine_error)?;
    Ok(Json(outcome))
}

async fn buy(State(state): State<AppState>, Query(query): Query<TradeQuery>) -> ApiResult<Value> {
    trade(state, query, TradeKind::Buy).await
}

async fn sell(State(state): State<AppState>, Query(query): Query<TradeQuery>) -> ApiResult<Value> {
    trade(state, query, TradeKind::Sell).await
}

enum TradeKind {
    Buy,
    Sell,
}

async fn trade(state: AppState, query: TradeQuery, kind: TradeKind) -> ApiResult<Value> {
    check_allowed(&state, &query.username)?;
    let side = parse_side(&query.yes_or_no)?;

    let has_quantity = query.quantity.is_some_and(|q| q > 0);
    let has_budget = query.points.is_some_and(|p| p > 0.0);
    if !has_quantity && !has_budget {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "quantity or points must be > 0",
        ));
    }

    check_cooldown(&state, &query.username, query.market_id).await?;

    let config = state.config.clone();
    let visible = move |market: &str, user: &str| is_market_visible(&config, market, user);

    let result = match kind {
        TradeKind::Buy => {
            api::buy(
                &state.pool,
                &state.config,
                query.market_id,
                &query.username,
                side,
                query.quantity,
                query.points,
                Some(&visible),
            )
            .await
        }
        TradeKind::Sell => {
            api::sell(
                &state.pool,
                &state.config,
                query.market_id,
                &query.username,
                side,
                query.quantity,
                query.points,
                Some(&visible),
            )
            .await
        }
    }
    .map_err(engine_error)?;

    record_trade_time(&state, &query.username, query.market_id).await;

    let verb = match kind {
        TradeKind::Buy => "bought",
        TradeKind::Sell => "sold",
    };
    Ok(Json(json!({
        "message": format!(
            "{} {verb} {} {side} contracts in market {}",
            query.username, result.quantity, query.market_id
        ),
        "new_balance": api::round_points(result.new_balance),
        "new_price": api::round_price(result.new_price),
        "order_cost": api::round_points(result.order_cost),
        "quantity": result.quantity,
        "status": "success",
    })))
}

#[derive(Deserialize)]
struct SettleQuery {
    market_id: i64,
    outcome: String,
}

async fn settle(
    State(state): State<AppState>,
    Query(query): Query<SettleQuery>,
) -> ApiResult<Value> {
    let outcome = parse_side(&query.outcome)?;
    let settled = api::settle(&state.pool, query.market_id, outcome)
        .await
        .map_err(engine_error)?;
    Ok(Json(json!({
        "message": format!("{} has settled at {}", settled.market_name, settled.outcome),
    })))
}
