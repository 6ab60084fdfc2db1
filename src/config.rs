//! Configuration for the exchange engine.
//! Environment variables with defaults; values are validated once at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::str::FromStr;

use crate::ledger::LedgerMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ledger emission mode, read once at startup.
    pub ledger_mode: LedgerMode,
    pub market: MarketConfig,
    pub pool: PoolConfig,
    pub http: HttpConfig,
    pub bots: BotConfig,
}

/// Market provisioning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Starting balance for users created on first reference (default: 1000).
    pub initial_user_points: f64,

    /// AMM reserve R0 provisioned with each new market (default: 10000).
    pub initial_amm_points: f64,

    /// Liquidity parameter when market creation omits one (default: 20).
    pub default_b: f64,
}

/// Connection-pool sizing. Base + overflow maps onto the pool's max
/// connections; pre-ping and recycle tolerate long-lived deployments behind
/// a pooled database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub size: u32,
    pub max_overflow: u32,
    pub recycle_seconds: u64,
    pub pre_ping: bool,
}

/// Collaborator policy enforced at the HTTP boundary, outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub port: u16,

    /// Seconds a (user, market) pair must wait between trades.
    pub cooldown_seconds: u64,

    /// When set, requests for any other username are rejected.
    pub allowed_usernames: Option<HashSet<String>>,

    /// Market-name prefixes hidden per user.
    pub hidden_prefixes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub enabled: bool,
    pub target_balance: f64,
    pub min_balance: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            initial_user_points: 1000.0,
            initial_amm_points: 10000.0,
            default_b: 20.0,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            max_overflow: 10,
            recycle_seconds: 1800,
            pre_ping: true,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            cooldown_seconds: 3,
            allowed_usernames: None,
            hidden_prefixes: HashMap::new(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_balance: 10_000.0,
            min_balance: 500.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger_mode: LedgerMode::Off,
            market: MarketConfig::default(),
            pool: PoolConfig::default(),
            http: HttpConfig::default(),
            bots: BotConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables with fallback to
    /// defaults.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        config.ledger_mode = env::var("LEDGER_MODE")
            .map(|raw| LedgerMode::parse(&raw))
            .unwrap_or(LedgerMode::Off);

        config.market.initial_user_points =
            env_parse("INITIAL_USER_POINTS", config.market.initial_user_points);
        config.market.initial_amm_points =
            env_parse("INITIAL_AMM_POINTS", config.market.initial_amm_points);
        config.market.default_b = env_parse("DEFAULT_B", config.market.default_b);

        config.pool.size = env_parse("DB_POOL_SIZE", config.pool.size);
        config.pool.max_overflow = env_parse("DB_MAX_OVERFLOW", config.pool.max_overflow);
        config.pool.recycle_seconds =
            env_parse("DB_POOL_RECYCLE_SECONDS", config.pool.recycle_seconds);
        config.pool.pre_ping = env_parse("DB_POOL_PRE_PING", config.pool.pre_ping);

        config.http.port = env_parse("PORT", config.http.port);
        config.http.cooldown_seconds =
            env_parse("TRADE_COOLDOWN_SECONDS", config.http.cooldown_seconds);
        config.http.allowed_usernames = env::var("ALLOWED_USERNAMES")
            .ok()
            .map(|raw| parse_username_list(&raw))
            .filter(|set| !set.is_empty());
        config.http.hidden_prefixes = env::var("HIDDEN_MARKET_PREFIXES")
            .map(|raw| parse_hidden_prefixes(&raw))
            .unwrap_or_default();

        config.bots.enabled = env_parse("ENABLE_BOTS", config.bots.enabled);
        config.bots.target_balance = env_parse("BOT_TARGET_BALANCE", config.bots.target_balance);
        config.bots.min_balance = env_parse("BOT_MIN_BALANCE", config.bots.min_balance);

        config.validate();
        config
    }

    fn validate(&mut self) {
        if !(self.market.default_b > 0.0) || !self.market.default_b.is_finite() {
            tracing::warn!(
                default_b = self.market.default_b,
                "invalid DEFAULT_B, using default"
            );
            self.market.default_b = 20.0;
        }
        if self.market.initial_user_points < 0.0 || !self.market.initial_user_points.is_finite() {
            tracing::warn!(
                initial_user_points = self.market.initial_user_points,
                "invalid INITIAL_USER_POINTS, using default"
            );
            self.market.initial_user_points = 1000.0;
        }
        if self.market.initial_amm_points < 0.0 || !self.market.initial_amm_points.is_finite() {
            tracing::warn!(
                initial_amm_points = self.market.initial_amm_points,
                "invalid INITIAL_AMM_POINTS, using default"
            );
            self.market.initial_amm_points = 10000.0;
        }
        if self.pool.size == 0 {
            tracing::warn!("DB_POOL_SIZE must be at least 1, using default");
            self.pool.size = 5;
        }
        if self.bots.min_balance > self.bots.target_balance {
            tracing::warn!(
                min = self.bots.min_balance,
                target = self.bots.target_balance,
                "BOT_MIN_BALANCE above BOT_TARGET_BALANCE, clamping"
            );
            self.bots.min_balance = self.bots.target_balance;
        }
    }
}

fn parse_username_list(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// `user:prefix[|prefix...][,user:...]`
fn parse_hidden_prefixes(raw: &str) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    for entry in raw.split(',') {
        let Some((user, prefixes)) = entry.split_once(':') else {
            continue;
        };
        let user = user.trim();
        if user.is_empty() {
            continue;
        }
        let prefixes: Vec<String> = prefixes
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if !prefixes.is_empty() {
            map.insert(user.to_string(), prefixes);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.market.initial_user_points, 1000.0);
        assert_eq!(config.market.initial_amm_points, 10000.0);
        assert_eq!(config.market.default_b, 20.0);
        assert_eq!(config.pool.size, 5);
        assert_eq!(config.pool.max_overflow, 10);
        assert_eq!(config.pool.recycle_seconds, 1800);
        assert!(config.pool.pre_ping);
        assert_eq!(config.ledger_mode, LedgerMode::Off);
    }

    #[test]
    fn hidden_prefix_map_parses() {
        let map = parse_hidden_prefixes("alice:secret_|beta_,bob:ops_, :bad,broken");
        assert_eq!(map.get("alice").unwrap(), &vec!["secret_", "beta_"]);
        assert_eq!(map.get("bob").unwrap(), &vec!["ops_"]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn username_list_parses() {
        let set = parse_username_list("alice, bob ,,carol");
        assert_eq!(set.len(), 3);
        assert!(set.contains("bob"));
    }
}
