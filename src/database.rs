//! Connection pool, schema, and row types.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::info;

use crate::config::PoolConfig;

/// Build the connection pool. `size + max_overflow` bounds total connections;
/// `pre_ping` health-checks connections on acquire and `recycle_seconds`
/// retires long-lived connections, which pooled databases require.
pub async fn create_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .min_connections(config.size)
        .max_connections(config.size + config.max_overflow)
        .test_before_acquire(config.pre_ping)
        .max_lifetime(Duration::from_secs(config.recycle_seconds))
        .connect(database_url)
        .await?;

    info!(
        size = config.size,
        max_overflow = config.max_overflow,
        "connected to database"
    );
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id BIGSERIAL PRIMARY KEY,
        username TEXT NOT NULL UNIQUE,
        points DOUBLE PRECISION NOT NULL DEFAULT 1000
    )",
    "CREATE TABLE IF NOT EXISTS markets (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        b DOUBLE PRECISION NOT NULL DEFAULT 20,
        amm_points DOUBLE PRECISION NOT NULL DEFAULT 10000,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        resolved BOOLEAN NOT NULL DEFAULT FALSE,
        outcome BOOLEAN,
        settled_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS amms (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL UNIQUE REFERENCES markets(id),
        points DOUBLE PRECISION NOT NULL DEFAULT 10000,
        q_yes BIGINT NOT NULL DEFAULT 0,
        q_no BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS clearing_houses (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL UNIQUE REFERENCES markets(id),
        points DOUBLE PRECISION NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS positions (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL REFERENCES markets(id),
        user_id BIGINT NOT NULL REFERENCES users(id),
        q_yes BIGINT NOT NULL DEFAULT 0,
        q_no BIGINT NOT NULL DEFAULT 0,
        UNIQUE (market_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS ledger_entries (
        id BIGSERIAL PRIMARY KEY,
        market_id BIGINT NOT NULL REFERENCES markets(id),
        user_id BIGINT NOT NULL REFERENCES users(id),
        recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        reason TEXT NOT NULL,
        delta DOUBLE PRECISION NOT NULL,
        side TEXT NOT NULL,
        amount BIGINT
    )",
];

/// Advisory-lock key serializing schema DDL across connections; concurrent
/// `CREATE TABLE IF NOT EXISTS` statements can otherwise race in Postgres.
const SCHEMA_LOCK_KEY: i64 = 0x00EC_C0DE;

/// Create all tables if they do not exist. Idempotent and safe to call from
/// concurrent processes.
pub async fn create_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(conn.as_mut())
        .await?;

    let mut result = Ok(());
    for statement in SCHEMA {
        if let Err(e) = sqlx::query(statement).execute(conn.as_mut()).await {
            result = Err(e);
            break;
        }
    }

    sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(conn.as_mut())
        .await?;
    result
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub points: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct MarketRow {
    pub id: i64,
    pub name: String,
    pub b: f64,
    pub amm_points: f64,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub outcome: Option<bool>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// AMM inventory is a signed counter that *decreases* when users buy: the
/// outstanding quantity the pricing kernel sees is `-q_yes` / `-q_no`.
#[derive(Debug, Clone, FromRow)]
pub struct AmmRow {
    pub id: i64,
    pub market_id: i64,
    pub points: f64,
    pub q_yes: i64,
    pub q_no: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ClearingHouseRow {
    pub id: i64,
    pub market_id: i64,
    pub points: f64,
}

#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub id: i64,
    pub market_id: i64,
    pub user_id: i64,
    pub q_yes: i64,
    pub q_no: i64,
}
