//! Append-only audit trail.
//!
//! Three modes: `off` writes nothing, `light` writes one row per user trade,
//! `full` additionally writes AMM counterparty rows and clearing-house
//! transfer pairs. The AMM and clearing house are attributed to reserved
//! system user rows that hold no balance and never trade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::ExchangeError;
use crate::lmsr::Side;

pub const SYSTEM_AMM_USERNAME: &str = "__system_amm__";
pub const SYSTEM_CH_USERNAME: &str = "__system_clearing_house__";

/// Reserved-name prefix; usernames carrying it are excluded from end-user
/// listings.
pub const SYSTEM_USERNAME_PREFIX: &str = "__system_";

pub fn is_system_username(username: &str) -> bool {
    username.starts_with(SYSTEM_USERNAME_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerMode {
    Off,
    Light,
    Full,
}

impl LedgerMode {
    /// Unknown values fall back to `Off`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "light" => LedgerMode::Light,
            "full" => LedgerMode::Full,
            _ => LedgerMode::Off,
        }
    }
}

/// Per-process memo of the two system actor IDs; the rows are immutable once
/// created, so a one-shot cell is safe under concurrency.
static SYSTEM_IDS: OnceCell<(i64, i64)> = OnceCell::const_new();

async fn get_or_create_system_user(pool: &PgPool, username: &str) -> Result<i64, ExchangeError> {
    sqlx::query("INSERT INTO users (username, points) VALUES ($1, 0) ON CONFLICT (username) DO NOTHING")
        .bind(username)
        .execute(pool)
        .await?;
    let id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE username = $1")
        .bind(username)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

/// Resolve (and memoize) the AMM and clearing-house system user IDs.
pub async fn system_actor_ids(pool: &PgPool) -> Result<(i64, i64), ExchangeError> {
    SYSTEM_IDS
        .get_or_try_init(|| async {
            let amm_id = get_or_create_system_user(pool, SYSTEM_AMM_USERNAME).await?;
            let ch_id = get_or_create_system_user(pool, SYSTEM_CH_USERNAME).await?;
            debug!(amm_id, ch_id, "resolved system actor ids");
            Ok((amm_id, ch_id))
        })
        .await
        .copied()
}

/// Resolved ledger context handed to the trade engine. In `Full` mode the
/// system counterparty IDs are looked up ahead of the trade transaction.
#[derive(Debug, Clone, Copy)]
pub enum LedgerCtx {
    Off,
    Light,
    Full { amm_user_id: i64, ch_user_id: i64 },
}

impl LedgerCtx {
    pub async fn resolve(pool: &PgPool, mode: LedgerMode) -> Result<Self, ExchangeError> {
        Ok(match mode {
            LedgerMode::Off => LedgerCtx::Off,
            LedgerMode::Light => LedgerCtx::Light,
            LedgerMode::Full => {
                let (amm_user_id, ch_user_id) = system_actor_ids(pool).await?;
                LedgerCtx::Full {
                    amm_user_id,
                    ch_user_id,
                }
            }
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    market_id: i64,
    user_id: i64,
    recorded_at: DateTime<Utc>,
    reason: &str,
    delta: f64,
    side: &str,
    amount: Option<i64>,
) -> Result<(), ExchangeError> {
    sqlx::query(
        "INSERT INTO ledger_entries (market_id, user_id, recorded_at, reason, delta, side, amount)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(market_id)
    .bind(user_id)
    .bind(recorded_at)
    .bind(reason)
    .bind(delta)
    .bind(side)
    .bind(amount)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Ledger rows for a user buy. `collateral_delta` is the amount moved from
/// the AMM reserve into clearing-house collateral, 0 when none moved.
pub async fn record_buy(
    tx: &mut Transaction<'_, Postgres>,
    ctx: &LedgerCtx,
    market_id: i64,
    user_id: i64,
    side: Side,
    quantity: i64,
    cost: f64,
    collateral_delta: f64,
) -> Result<(), ExchangeError> {
    if matches!(ctx, LedgerCtx::Off) {
        return Ok(());
    }

    let now = Utc::now();
    insert_entry(
        tx,
        market_id,
        user_id,
        now,
        "trade buy",
        -cost,
        side.as_str(),
        Some(quantity),
    )
    .await?;

    if let LedgerCtx::Full {
        amm_user_id,
        ch_user_id,
    } = *ctx
    {
        // Counterparty row carries the opposite trade label.
        insert_entry(
            tx,
            market_id,
            amm_user_id,
            now,
            "trade sell",
            cost,
            side.as_str(),
            Some(quantity),
        )
        .await?;

        if collateral_delta > 0.0 {
            insert_entry(
                tx,
                market_id,
                amm_user_id,
                now,
                "clearing house",
                -collateral_delta,
                "N/A",
                None,
            )
            .await?;
            insert_entry(
                tx,
                market_id,
                ch_user_id,
                now,
                "clearing house",
                collateral_delta,
                "N/A",
                None,
            )
            .await?;
        }
    }
    Ok(())
}

/// Ledger rows for a user sell. `collateral_delta` is the amount released
/// from clearing-house collateral back to the AMM reserve.
pub async fn record_sell(
    tx: &mut Transaction<'_, Postgres>,
    ctx: &LedgerCtx,
    market_id: i64,
    user_id: i64,
    side: Side,
    quantity: i64,
    payout: f64,
    collateral_delta: f64,
) -> Result<(), ExchangeError> {
    if matches!(ctx, LedgerCtx::Off) {
        return Ok(());
    }

    let now = Utc::now();
    insert_entry(
        tx,
        market_id,
        user_id,
        now,
        "trade sell",
        payout,
        side.as_str(),
        Some(quantity),
    )
    .await?;

    if let LedgerCtx::Full {
        amm_user_id,
        ch_user_id,
    } = *ctx
    {
        insert_entry(
            tx,
            market_id,
            amm_user_id,
            now,
            "trade buy",
            -payout,
            side.as_str(),
            Some(quantity),
        )
        .await?;

        if collateral_delta > 0.0 {
            insert_entry(
                tx,
                market_id,
                ch_user_id,
                now,
                "clearing house",
                -collateral_delta,
                "N/A",
                None,
            )
            .await?;
            insert_entry(
                tx,
                market_id,
                amm_user_id,
                now,
                "clearing house",
                collateral_delta,
                "N/A",
                None,
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_falls_back_to_off() {
        assert_eq!(LedgerMode::parse("off"), LedgerMode::Off);
        assert_eq!(LedgerMode::parse(" LIGHT "), LedgerMode::Light);
        assert_eq!(LedgerMode::parse("Full"), LedgerMode::Full);
        assert_eq!(LedgerMode::parse("verbose"), LedgerMode::Off);
        assert_eq!(LedgerMode::parse(""), LedgerMode::Off);
    }

    #[test]
    fn system_usernames_carry_the_reserved_prefix() {
        assert!(is_system_username(SYSTEM_AMM_USERNAME));
        assert!(is_system_username(SYSTEM_CH_USERNAME));
        assert!(!is_system_username("alice"));
    }
}
