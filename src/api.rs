//! Boundary adapters invoked by the HTTP layer and the bot loop.
//!
//! Each operation opens one transaction around the engine, retries on
//! transient database conflicts, and applies boundary rounding (prices to
//! 4 decimals, point amounts to 2) — never inside the engine.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::Config;
use crate::database::{AmmRow, MarketRow, UserRow};
use crate::error::ExchangeError;
use crate::exchange::{self, TradeRequest, TradeResult, VisibilityFn};
use crate::ledger::LedgerCtx;
use crate::lmsr::{self, QuoteMode, Side};

const MAX_RETRY_ATTEMPTS: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 10;

/// Run a transaction body, committing on success and retrying (bounded, with
/// exponential backoff + jitter) when the database reports a transient
/// conflict.
macro_rules! with_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        let mut attempt = 1;
        loop {
            let mut $tx_var = $pool.begin().await.map_err(ExchangeError::from)?;

            let result: Result<_, ExchangeError> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await.map_err(ExchangeError::from)?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();

                    if e.is_retryable() && attempt < MAX_RETRY_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(0..10);
                        let delay_ms = BASE_RETRY_DELAY_MS * (1 << (attempt - 1)) + jitter;
                        sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

/// Round a price to 4 decimals for responses.
pub fn round_price(p: f64) -> f64 {
    (p * 10_000.0).round() / 10_000.0
}

/// Round a point amount to 2 decimals for responses.
pub fn round_points(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Serialize)]
pub struct UserAccount {
    pub username: String,
    pub points: f64,
}

#[derive(Debug, Serialize)]
pub struct PreviewOutcome {
    pub order_cost: f64,
    /// Points per contract if this side wins: one each.
    pub payout: f64,
    pub quantity: i64,
    pub new_price: f64,
    pub current_price: f64,
}

#[derive(Debug, Serialize)]
pub struct PositionSummary {
    pub market: String,
    pub yes: i64,
    pub no: i64,
}

#[derive(Debug, Serialize)]
pub struct UserSnapshot {
    pub username: String,
    pub points: f64,
    pub positions: Vec<PositionSummary>,
}

#[derive(Debug, Serialize)]
pub struct PortfolioPosition {
    pub market_id: i64,
    pub market_name: String,
    pub yes: i64,
    pub no: i64,
    pub current_yes_price: f64,
    pub current_no_price: f64,
    /// Mark-to-market value of the held contracts.
    pub current_value: f64,
}

#[derive(Debug, Serialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<PortfolioPosition>,
}

#[derive(Debug, Serialize)]
pub struct MarketSummary {
    pub id: i64,
    pub name: String,
    pub b: f64,
    pub amm_points: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct MarketDetail {
    pub id: i64,
    pub name: String,
    pub b: f64,
    pub amm_points: f64,
    pub resolved: bool,
    pub outcome: Option<&'static str>,
    pub settled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SettlementOutcome {
    pub market_name: String,
    pub outcome: &'static str,
}

impl From<MarketRow> for MarketSummary {
    fn from(m: MarketRow) -> Self {
        Self {
            id: m.id,
            name: m.name,
            b: m.b,
            amm_points: m.amm_points,
            created_at: m.created_at,
        }
    }
}

impl From<MarketRow> for MarketDetail {
    fn from(m: MarketRow) -> Self {
        Self {
            id: m.id,
            name: m.name,
            b: m.b,
            amm_points: m.amm_points,
            resolved: m.resolved,
            outcome: m.outcome.map(|yes| if yes { "yes" } else { "no" }),
            settled_at: m.settled_at,
            created_at: m.created_at,
        }
    }
}

/// Idempotent user provisioning with the configured starting balance.
pub async fn register_user(
    pool: &PgPool,
    config: &Config,
    username: &str,
) -> Result<UserAccount, ExchangeError> {
    if username.trim().is_empty() {
        return Err(ExchangeError::InvalidArgument(
            "username must not be empty".to_string(),
        ));
    }
    with_tx!(pool, tx, {
        let user =
            exchange::get_or_create_user(&mut tx, username, config.market.initial_user_points)
                .await?;
        Ok(UserAccount {
            username: user.username,
            points: user.points,
        })
    })
}

/// Idempotent market provisioning (auto-creates AMM + clearing house).
pub async fn create_market(
    pool: &PgPool,
    config: &Config,
    name: &str,
    b: Option<f64>,
) -> Result<MarketSummary, ExchangeError> {
    with_tx!(pool, tx, {
        let market = exchange::get_or_create_market(&mut tx, name, b, &config.market).await?;
        Ok(MarketSummary::from(market))
    })
}

pub async fn buy(
    pool: &PgPool,
    config: &Config,
    market_id: i64,
    username: &str,
    side: Side,
    quantity: Option<i64>,
    budget_points: Option<f64>,
    is_visible: Option<&VisibilityFn>,
) -> Result<TradeResult, ExchangeError> {
    let ledger_ctx = LedgerCtx::resolve(pool, config.ledger_mode).await?;
    let request = TradeRequest {
        username,
        market_id,
        side,
        quantity: quantity.unwrap_or(0),
        budget_points,
    };
    with_tx!(pool, tx, {
        exchange::trade_buy(&mut tx, &config.market, &ledger_ctx, &request, is_visible).await
    })
}

pub async fn sell(
    pool: &PgPool,
    config: &Config,
    market_id: i64,
    username: &str,
    side: Side,
    quantity: Option<i64>,
    budget_points: Option<f64>,
    is_visible: Option<&VisibilityFn>,
) -> Result<TradeResult, ExchangeError> {
    let ledger_ctx = LedgerCtx::resolve(pool, config.ledger_mode).await?;
    let request = TradeRequest {
        username,
        market_id,
        side,
        quantity: quantity.unwrap_or(0),
        budget_points,
    };
    with_tx!(pool, tx, {
        exchange::trade_sell(&mut tx, &config.market, &ledger_ctx, &request, is_visible).await
    })
}

pub async fn settle(
    pool: &PgPool,
    market_id: i64,
    outcome: Side,
) -> Result<SettlementOutcome, ExchangeError> {
    let result = with_tx!(pool, tx, {
        exchange::settle_market(&mut tx, market_id, outcome).await
    })?;
    Ok(SettlementOutcome {
        market_name: result.market_name,
        outcome: result.outcome.as_str(),
    })
}

/// Quote a buy without mutating anything. Plain reads, no locks.
pub async fn preview(
    pool: &PgPool,
    market_id: i64,
    username: &str,
    side: Side,
    quantity: Option<i64>,
    budget_points: Option<f64>,
    is_visible: Option<&VisibilityFn>,
) -> Result<PreviewOutcome, ExchangeError> {
    let market = find_market(pool, market_id)
        .await?
        .ok_or(ExchangeError::MarketNotFound)?;
    if market.resolved {
        return Err(ExchangeError::MarketSettled);
    }
    if let Some(visible) = is_visible {
        if !visible(&market.name, username) {
            return Err(ExchangeError::AccessDenied);
        }
    }

    let amm = sqlx::query_as::<_, AmmRow>(
        "SELECT id, market_id, points, q_yes, q_no FROM amms WHERE market_id = $1",
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ExchangeError::ConsistencyViolation("AMM row missing".to_string()))?;

    let b = market.b;
    let q_yes_total = -(amm.q_yes as f64);
    let q_no_total = -(amm.q_no as f64);

    let quantity = match quantity.filter(|q| *q > 0) {
        Some(q) => q,
        None => {
            let budget = budget_points.filter(|p| *p > 0.0).ok_or_else(|| {
                ExchangeError::InvalidArgument("quantity or points is required".to_string())
            })?;
            lmsr::max_quantity_for_budget(b, q_yes_total, q_no_total, side, budget, QuoteMode::Buy)?
        }
    };

    let current_yes = lmsr::yes_price(b, q_yes_total, q_no_total);
    let cost = lmsr::trade_cost(b, q_yes_total, q_no_total, quantity as f64, side)?;
    let new_yes = match side {
        Side::Yes => lmsr::yes_price(b, q_yes_total + quantity as f64, q_no_total),
        Side::No => lmsr::yes_price(b, q_yes_total, q_no_total + quantity as f64),
    };

    if !cost.is_finite() || !new_yes.is_finite() || !current_yes.is_finite() {
        return Err(ExchangeError::PricingOverflow);
    }

    Ok(PreviewOutcome {
        order_cost: round_points(cost),
        payout: quantity as f64,
        quantity,
        new_price: round_price(new_yes),
        current_price: round_price(current_yes),
    })
}

/// Balance and raw position list for a user.
pub async fn snapshot_user(pool: &PgPool, username: &str) -> Result<UserSnapshot, ExchangeError> {
    let user = find_user(pool, username)
        .await?
        .ok_or(ExchangeError::UserNotFound)?;

    let positions = sqlx::query_as::<_, (String, i64, i64)>(
        "SELECT m.name, p.q_yes, p.q_no
         FROM positions p
         JOIN markets m ON m.id = p.market_id
         WHERE p.user_id = $1
         ORDER BY p.id",
    )
    .bind(user.id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(market, yes, no)| PositionSummary { market, yes, no })
    .collect();

    Ok(UserSnapshot {
        username: user.username,
        points: user.points,
        positions,
    })
}

/// Non-empty positions with current prices and mark-to-market value.
pub async fn snapshot_portfolio(
    pool: &PgPool,
    username: &str,
) -> Result<PortfolioSnapshot, ExchangeError> {
    let user = find_user(pool, username)
        .await?
        .ok_or(ExchangeError::UserNotFound)?;

    let rows = sqlx::query_as::<_, (i64, String, f64, i64, i64, i64, i64)>(
        "SELECT m.id, m.name, m.b, p.q_yes, p.q_no, a.q_yes AS amm_q_yes, a.q_no AS amm_q_no
         FROM positions p
         JOIN markets m ON m.id = p.market_id
         JOIN amms a ON a.market_id = m.id
         WHERE p.user_id = $1
         ORDER BY m.id",
    )
    .bind(user.id)
    .fetch_all(pool)
    .await?;

    let mut positions = Vec::new();
    for (market_id, market_name, b, yes, no, amm_q_yes, amm_q_no) in rows {
        if yes <= 0 && no <= 0 {
            continue;
        }
        let yes_price = lmsr::yes_price(b, -(amm_q_yes as f64), -(amm_q_no as f64));
        let no_price = 1.0 - yes_price;
        let current_value = yes as f64 * yes_price + no as f64 * no_price;
        positions.push(PortfolioPosition {
            market_id,
            market_name,
            yes,
            no,
            current_yes_price: round_price(yes_price),
            current_no_price: round_price(no_price),
            current_value: round_points(current_value),
        });
    }

    Ok(PortfolioSnapshot { positions })
}

/// Unresolved markets, optionally filtered through the viewer's visibility
/// predicate.
pub async fn list_markets(
    pool: &PgPool,
    viewer: Option<(&str, &VisibilityFn)>,
) -> Result<Vec<MarketSummary>, ExchangeError> {
    let markets = sqlx::query_as::<_, MarketRow>(
        "SELECT id, name, b, amm_points, created_at, resolved, outcome, settled_at
         FROM markets WHERE resolved = FALSE ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    Ok(markets
        .into_iter()
        .filter(|m| match viewer {
            Some((username, visible)) => visible(&m.name, username),
            None => true,
        })
        .map(MarketSummary::from)
        .collect())
}

pub async fn market_detail(pool: &PgPool, market_id: i64) -> Result<MarketDetail, ExchangeError> {
    let market = find_market(pool, market_id)
        .await?
        .ok_or(ExchangeError::MarketNotFound)?;
    Ok(MarketDetail::from(market))
}

async fn find_market(pool: &PgPool, market_id: i64) -> Result<Option<MarketRow>, ExchangeError> {
    let market = sqlx::query_as::<_, MarketRow>(
        "SELECT id, name, b, amm_points, created_at, resolved, outcome, settled_at
         FROM markets WHERE id = $1",
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await?;
    Ok(market)
}

async fn find_user(pool: &PgPool, username: &str) -> Result<Option<UserRow>, ExchangeError> {
    let user =
        sqlx::query_as::<_, UserRow>("SELECT id, username, points FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(pool)
            .await?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_rounding() {
        assert_eq!(round_price(0.62245933), 0.6225);
        assert_eq!(round_price(0.5), 0.5);
        assert_eq!(round_points(5.61859607), 5.62);
        assert_eq!(round_points(-0.005), -0.01);
    }
}
