//! Trade engine: buy, sell, settle, and idempotent provisioning.
//!
//! Every operation runs inside a caller-supplied transaction and acquires row
//! locks in a fixed order — user, then the market bundle (market + AMM +
//! clearing house in one statement), then the position — so concurrent trades
//! serialize without deadlocking. Settlement locks market → positions →
//! users; the market lock makes it mutually exclusive with trading.
//!
//! Points are conserved across user balances, the AMM reserve, and
//! clearing-house collateral: every mutation here moves points between those
//! three pots, never creates or destroys them.

use chrono::Utc;
use serde::Serialize;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, info};

use crate::config::MarketConfig;
use crate::database::{AmmRow, ClearingHouseRow, MarketRow, PositionRow, UserRow};
use crate::error::ExchangeError;
use crate::ledger::{self, LedgerCtx};
use crate::lmsr::{self, QuoteMode, Side};

/// Per-call market visibility capability supplied by the boundary.
pub type VisibilityFn = dyn Fn(&str, &str) -> bool + Sync;

/// Slack allowed when checking that collateral never exceeds the requirement;
/// absorbs float noise in the points columns only, contract counts are exact.
const COLLATERAL_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct TradeRequest<'a> {
    pub username: &'a str,
    pub market_id: i64,
    pub side: Side,
    /// Ignored when `budget_points` is set and positive.
    pub quantity: i64,
    pub budget_points: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeResult {
    pub new_balance: f64,
    /// Price of the traded side after the trade.
    pub new_price: f64,
    pub quantity: i64,
    pub order_cost: f64,
}

#[derive(Debug, Clone)]
pub struct SettlementResult {
    pub market_name: String,
    pub outcome: Side,
    pub winners: usize,
    pub points_disbursed: f64,
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

async fn lock_user(
    tx: &mut Transaction<'_, Postgres>,
    username: &str,
) -> Result<Option<UserRow>, ExchangeError> {
    let user = sqlx::query_as::<_, UserRow>(
        "SELECT id, username, points FROM users WHERE username = $1 FOR UPDATE",
    )
    .bind(username)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(user)
}

/// Fetch-and-lock a user, creating it with the starting balance on first
/// reference. The insert-then-reselect handles provisioning races: on
/// conflict the reselect blocks on the winning transaction's lock.
pub async fn get_or_create_user(
    tx: &mut Transaction<'_, Postgres>,
    username: &str,
    initial_points: f64,
) -> Result<UserRow, ExchangeError> {
    if let Some(user) = lock_user(tx, username).await? {
        return Ok(user);
    }

    sqlx::query("INSERT INTO users (username, points) VALUES ($1, $2) ON CONFLICT (username) DO NOTHING")
        .bind(username)
        .bind(initial_points)
        .execute(tx.as_mut())
        .await?;

    let user = sqlx::query_as::<_, UserRow>(
        "SELECT id, username, points FROM users WHERE username = $1 FOR UPDATE",
    )
    .bind(username)
    .fetch_one(tx.as_mut())
    .await?;

    debug!(username, user_id = user.id, "provisioned user");
    Ok(user)
}

/// Lock the market, its AMM, and its clearing house with one statement so the
/// bundle is always acquired atomically and in the same order.
pub async fn market_bundle_for_update(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
) -> Result<(MarketRow, AmmRow, ClearingHouseRow), ExchangeError> {
    let row = sqlx::query(
        "SELECT m.id AS market_id, m.name, m.b, m.amm_points, m.created_at,
                m.resolved, m.outcome, m.settled_at,
                a.id AS amm_id, a.points AS amm_reserve, a.q_yes, a.q_no,
                c.id AS ch_id, c.points AS ch_points
         FROM markets m
         JOIN amms a ON a.market_id = m.id
         JOIN clearing_houses c ON c.market_id = m.id
         WHERE m.id = $1
         FOR UPDATE",
    )
    .bind(market_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(ExchangeError::MarketNotFound)?;

    let market = MarketRow {
        id: row.get("market_id"),
        name: row.get("name"),
        b: row.get("b"),
        amm_points: row.get("amm_points"),
        created_at: row.get("created_at"),
        resolved: row.get("resolved"),
        outcome: row.get("outcome"),
        settled_at: row.get("settled_at"),
    };
    let amm = AmmRow {
        id: row.get("amm_id"),
        market_id: market.id,
        points: row.get("amm_reserve"),
        q_yes: row.get("q_yes"),
        q_no: row.get("q_no"),
    };
    let ch = ClearingHouseRow {
        id: row.get("ch_id"),
        market_id: market.id,
        points: row.get("ch_points"),
    };
    Ok((market, amm, ch))
}

async fn lock_position(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    market_id: i64,
) -> Result<Option<PositionRow>, ExchangeError> {
    let position = sqlx::query_as::<_, PositionRow>(
        "SELECT id, market_id, user_id, q_yes, q_no FROM positions
         WHERE user_id = $1 AND market_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(position)
}

/// Lock the (user, market) position, creating an empty one lazily.
pub async fn get_or_create_position_for_update(
    tx: &mut Transaction<'_, Postgres>,
    user_id: i64,
    market_id: i64,
) -> Result<PositionRow, ExchangeError> {
    if let Some(position) = lock_position(tx, user_id, market_id).await? {
        return Ok(position);
    }

    sqlx::query(
        "INSERT INTO positions (market_id, user_id, q_yes, q_no) VALUES ($1, $2, 0, 0)
         ON CONFLICT (market_id, user_id) DO NOTHING",
    )
    .bind(market_id)
    .bind(user_id)
    .execute(tx.as_mut())
    .await?;

    let position = sqlx::query_as::<_, PositionRow>(
        "SELECT id, market_id, user_id, q_yes, q_no FROM positions
         WHERE user_id = $1 AND market_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(position)
}

/// Idempotent market creation; provisions the AMM row (reserve R0, empty
/// inventory) and the clearing-house row (0 collateral) alongside.
pub async fn get_or_create_market(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
    b: Option<f64>,
    market_cfg: &MarketConfig,
) -> Result<MarketRow, ExchangeError> {
    if name.trim().is_empty() {
        return Err(ExchangeError::InvalidArgument(
            "market name must not be empty".to_string(),
        ));
    }
    let b = b.unwrap_or(market_cfg.default_b);
    if !(b > 0.0) || !b.is_finite() {
        return Err(ExchangeError::InvalidArgument(
            "liquidity parameter b must be positive and finite".to_string(),
        ));
    }

    let existing = sqlx::query_as::<_, MarketRow>(
        "SELECT id, name, b, amm_points, created_at, resolved, outcome, settled_at
         FROM markets WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(tx.as_mut())
    .await?;
    if let Some(market) = existing {
        return Ok(market);
    }

    let inserted = sqlx::query_as::<_, MarketRow>(
        "INSERT INTO markets (name, b, amm_points) VALUES ($1, $2, $3)
         ON CONFLICT (name) DO NOTHING
         RETURNING id, name, b, amm_points, created_at, resolved, outcome, settled_at",
    )
    .bind(name)
    .bind(b)
    .bind(market_cfg.initial_amm_points)
    .fetch_optional(tx.as_mut())
    .await?;

    let market = match inserted {
        Some(market) => {
            sqlx::query("INSERT INTO amms (market_id, points, q_yes, q_no) VALUES ($1, $2, 0, 0)")
                .bind(market.id)
                .bind(market_cfg.initial_amm_points)
                .execute(tx.as_mut())
                .await?;
            sqlx::query("INSERT INTO clearing_houses (market_id, points) VALUES ($1, 0)")
                .bind(market.id)
                .execute(tx.as_mut())
                .await?;
            info!(market = name, market_id = market.id, b, "created market");
            market
        }
        // Lost a creation race; the winner provisioned the bundle.
        None => {
            sqlx::query_as::<_, MarketRow>(
                "SELECT id, name, b, amm_points, created_at, resolved, outcome, settled_at
                 FROM markets WHERE name = $1",
            )
            .bind(name)
            .fetch_one(tx.as_mut())
            .await?
        }
    };
    Ok(market)
}

// ---------------------------------------------------------------------------
// Trading
// ---------------------------------------------------------------------------

struct PostTradeState {
    user_id: i64,
    new_balance: f64,
    market_id: i64,
    amm_id: i64,
    amm_points: f64,
    amm_q_yes: i64,
    amm_q_no: i64,
    ch_id: i64,
    ch_points: f64,
    position_id: i64,
    pos_q_yes: i64,
    pos_q_no: i64,
}

async fn persist_trade(
    tx: &mut Transaction<'_, Postgres>,
    state: &PostTradeState,
) -> Result<(), ExchangeError> {
    sqlx::query("UPDATE users SET points = $1 WHERE id = $2")
        .bind(state.new_balance)
        .bind(state.user_id)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("UPDATE amms SET points = $1, q_yes = $2, q_no = $3 WHERE id = $4")
        .bind(state.amm_points)
        .bind(state.amm_q_yes)
        .bind(state.amm_q_no)
        .bind(state.amm_id)
        .execute(tx.as_mut())
        .await?;
    // Mirror the reserve onto the market row.
    sqlx::query("UPDATE markets SET amm_points = $1 WHERE id = $2")
        .bind(state.amm_points)
        .bind(state.market_id)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("UPDATE clearing_houses SET points = $1 WHERE id = $2")
        .bind(state.ch_points)
        .bind(state.ch_id)
        .execute(tx.as_mut())
        .await?;
    sqlx::query("UPDATE positions SET q_yes = $1, q_no = $2 WHERE id = $3")
        .bind(state.pos_q_yes)
        .bind(state.pos_q_no)
        .bind(state.position_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// Buy `quantity` contracts of `side` (or as many as `budget_points` buys).
pub async fn trade_buy(
    tx: &mut Transaction<'_, Postgres>,
    market_cfg: &MarketConfig,
    ledger_ctx: &LedgerCtx,
    req: &TradeRequest<'_>,
    is_visible: Option<&VisibilityFn>,
) -> Result<TradeResult, ExchangeError> {
    let budget = req.budget_points.filter(|b| *b > 0.0);
    if req.quantity <= 0 && budget.is_none() {
        return Err(ExchangeError::InvalidArgument(
            "quantity must be > 0".to_string(),
        ));
    }

    let user = get_or_create_user(tx, req.username, market_cfg.initial_user_points).await?;
    let (market, amm, ch) = market_bundle_for_update(tx, req.market_id).await?;

    if market.resolved {
        return Err(ExchangeError::MarketSettled);
    }
    if let Some(visible) = is_visible {
        if !visible(&market.name, req.username) {
            return Err(ExchangeError::AccessDenied);
        }
    }

    let position = get_or_create_position_for_update(tx, user.id, market.id).await?;

    let b = market.b;
    let q_yes_total = -(amm.q_yes as f64);
    let q_no_total = -(amm.q_no as f64);

    let quantity = match budget {
        Some(budget) => lmsr::max_quantity_for_budget(
            b,
            q_yes_total,
            q_no_total,
            req.side,
            budget,
            QuoteMode::Buy,
        )?,
        None => req.quantity,
    };

    let cost = lmsr::trade_cost(b, q_yes_total, q_no_total, quantity as f64, req.side)?;
    if user.points < cost {
        return Err(ExchangeError::InsufficientFunds);
    }

    let new_balance = user.points - cost;
    let mut amm_points = amm.points + cost;

    let (amm_q_yes, amm_q_no, pos_q_yes, pos_q_no) = match req.side {
        Side::Yes => (
            amm.q_yes - quantity,
            amm.q_no,
            position.q_yes + quantity,
            position.q_no,
        ),
        Side::No => (
            amm.q_yes,
            amm.q_no - quantity,
            position.q_yes,
            position.q_no + quantity,
        ),
    };

    // Collateral must cover the larger outstanding side so every winning
    // contract can pay one point at settlement.
    let required = outstanding_requirement(amm_q_yes, amm_q_no);
    let mut ch_points = ch.points;
    let delta = required - ch_points;
    let mut collateral_delta = 0.0;
    if delta > 0.0 {
        if amm_points < delta {
            return Err(ExchangeError::CollateralShortfall);
        }
        amm_points -= delta;
        ch_points += delta;
        collateral_delta = delta;
    } else if delta < -COLLATERAL_TOLERANCE {
        return Err(ExchangeError::ConsistencyViolation(
            "clearing house holds more points than required after buy".to_string(),
        ));
    }

    persist_trade(
        tx,
        &PostTradeState {
            user_id: user.id,
            new_balance,
            market_id: market.id,
            amm_id: amm.id,
            amm_points,
            amm_q_yes,
            amm_q_no,
            ch_id: ch.id,
            ch_points,
            position_id: position.id,
            pos_q_yes,
            pos_q_no,
        },
    )
    .await?;

    ledger::record_buy(
        tx,
        ledger_ctx,
        market.id,
        user.id,
        req.side,
        quantity,
        cost,
        collateral_delta,
    )
    .await?;

    let new_price = lmsr::side_price(b, -(amm_q_yes as f64), -(amm_q_no as f64), req.side);
    if !new_price.is_finite() {
        return Err(ExchangeError::PricingOverflow);
    }

    debug!(
        user = req.username,
        market = %market.name,
        side = %req.side,
        quantity,
        cost,
        new_price,
        "buy executed"
    );

    Ok(TradeResult {
        new_balance,
        new_price,
        quantity,
        order_cost: cost,
    })
}

/// Sell `quantity` held contracts of `side` (or as many as needed to raise
/// `budget_points`, capped by the holding).
pub async fn trade_sell(
    tx: &mut Transaction<'_, Postgres>,
    _market_cfg: &MarketConfig,
    ledger_ctx: &LedgerCtx,
    req: &TradeRequest<'_>,
    is_visible: Option<&VisibilityFn>,
) -> Result<TradeResult, ExchangeError> {
    let budget = req.budget_points.filter(|b| *b > 0.0);
    if req.quantity <= 0 && budget.is_none() {
        return Err(ExchangeError::InvalidArgument(
            "quantity must be > 0".to_string(),
        ));
    }

    let user = lock_user(tx, req.username)
        .await?
        .ok_or(ExchangeError::UserNotFound)?;
    let (market, amm, ch) = market_bundle_for_update(tx, req.market_id).await?;

    if market.resolved {
        return Err(ExchangeError::MarketSettled);
    }
    if let Some(visible) = is_visible {
        if !visible(&market.name, req.username) {
            return Err(ExchangeError::AccessDenied);
        }
    }

    let position = lock_position(tx, user.id, market.id)
        .await?
        .ok_or(ExchangeError::PositionNotFound)?;

    let b = market.b;
    let q_yes_total = -(amm.q_yes as f64);
    let q_no_total = -(amm.q_no as f64);

    let held = match req.side {
        Side::Yes => position.q_yes,
        Side::No => position.q_no,
    };

    let quantity = match budget {
        Some(budget) => lmsr::max_quantity_for_budget(
            b,
            q_yes_total,
            q_no_total,
            req.side,
            budget,
            QuoteMode::Sell,
        )?
        .min(held),
        None => req.quantity,
    };

    if held < quantity {
        return Err(ExchangeError::InsufficientHoldings {
            side: match req.side {
                Side::Yes => "YES",
                Side::No => "NO",
            },
        });
    }
    if quantity <= 0 {
        return Err(ExchangeError::InvalidArgument(
            "quantity must be > 0".to_string(),
        ));
    }

    let payout = -lmsr::trade_cost(b, q_yes_total, q_no_total, -(quantity as f64), req.side)?;
    if amm.points < payout {
        return Err(ExchangeError::AmmInsolvent);
    }

    let new_balance = user.points + payout;
    let mut amm_points = amm.points - payout;

    let (amm_q_yes, amm_q_no, pos_q_yes, pos_q_no) = match req.side {
        Side::Yes => (
            amm.q_yes + quantity,
            amm.q_no,
            position.q_yes - quantity,
            position.q_no,
        ),
        Side::No => (
            amm.q_yes,
            amm.q_no + quantity,
            position.q_yes,
            position.q_no - quantity,
        ),
    };

    // Release collateral the smaller outstanding side no longer needs.
    let required = outstanding_requirement(amm_q_yes, amm_q_no);
    let mut ch_points = ch.points;
    let delta = ch_points - required;
    let mut collateral_delta = 0.0;
    if delta > 0.0 {
        ch_points -= delta;
        amm_points += delta;
        collateral_delta = delta;
    } else if delta < -COLLATERAL_TOLERANCE {
        return Err(ExchangeError::ConsistencyViolation(
            "collateral increased after sell".to_string(),
        ));
    }

    persist_trade(
        tx,
        &PostTradeState {
            user_id: user.id,
            new_balance,
            market_id: market.id,
            amm_id: amm.id,
            amm_points,
            amm_q_yes,
            amm_q_no,
            ch_id: ch.id,
            ch_points,
            position_id: position.id,
            pos_q_yes,
            pos_q_no,
        },
    )
    .await?;

    ledger::record_sell(
        tx,
        ledger_ctx,
        market.id,
        user.id,
        req.side,
        quantity,
        payout,
        collateral_delta,
    )
    .await?;

    let new_price = lmsr::side_price(b, -(amm_q_yes as f64), -(amm_q_no as f64), req.side);
    if !new_price.is_finite() {
        return Err(ExchangeError::PricingOverflow);
    }

    debug!(
        user = req.username,
        market = %market.name,
        side = %req.side,
        quantity,
        payout,
        new_price,
        "sell executed"
    );

    Ok(TradeResult {
        new_balance,
        new_price,
        quantity,
        order_cost: payout,
    })
}

/// Collateral requirement: the larger outstanding side, never negative.
fn outstanding_requirement(amm_q_yes: i64, amm_q_no: i64) -> f64 {
    let outstanding_yes = (-amm_q_yes).max(0);
    let outstanding_no = (-amm_q_no).max(0);
    outstanding_yes.max(outstanding_no) as f64
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Resolve the market and credit one point per winning contract. The AMM
/// reserve and any clearing-house surplus are retained on the market's rows;
/// the payout is guaranteed by the collateral held during trading.
pub async fn settle_market(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
    outcome: Side,
) -> Result<SettlementResult, ExchangeError> {
    let market = sqlx::query_as::<_, MarketRow>(
        "SELECT id, name, b, amm_points, created_at, resolved, outcome, settled_at
         FROM markets WHERE id = $1 FOR UPDATE",
    )
    .bind(market_id)
    .fetch_optional(tx.as_mut())
    .await?
    .ok_or(ExchangeError::MarketNotFound)?;

    if market.resolved {
        return Err(ExchangeError::MarketSettled);
    }

    sqlx::query("UPDATE markets SET resolved = TRUE, outcome = $1, settled_at = $2 WHERE id = $3")
        .bind(outcome == Side::Yes)
        .bind(Utc::now())
        .bind(market.id)
        .execute(tx.as_mut())
        .await?;

    let positions = sqlx::query_as::<_, PositionRow>(
        "SELECT id, market_id, user_id, q_yes, q_no FROM positions
         WHERE market_id = $1 ORDER BY id FOR UPDATE",
    )
    .bind(market.id)
    .fetch_all(tx.as_mut())
    .await?;

    let mut winners = 0usize;
    let mut points_disbursed = 0.0;
    for position in &positions {
        let locked: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(position.user_id)
            .fetch_optional(tx.as_mut())
            .await?;
        if locked.is_none() {
            continue;
        }

        let payout = match outcome {
            Side::Yes => position.q_yes,
            Side::No => position.q_no,
        };
        if payout > 0 {
            sqlx::query("UPDATE users SET points = points + $1 WHERE id = $2")
                .bind(payout as f64)
                .bind(position.user_id)
                .execute(tx.as_mut())
                .await?;
            winners += 1;
            points_disbursed += payout as f64;
        }
    }

    info!(
        market = %market.name,
        outcome = %outcome,
        winners,
        points_disbursed,
        "market settled"
    );

    Ok(SettlementResult {
        market_name: market.name,
        outcome,
        winners,
        points_disbursed,
    })
}
