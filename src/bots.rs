//! Bot traders that keep markets moving.
//!
//! Four strategies with different temperaments run on a single loop over all
//! unresolved markets. Bots trade through the same boundary adapters as human
//! clients; a failed bot trade is logged and swallowed so the loop never dies.

use rand::Rng;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::api;
use crate::config::Config;
use crate::error::ExchangeError;
use crate::exchange;
use crate::lmsr::{self, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy)]
pub struct BotOrder {
    pub action: TradeAction,
    pub side: Side,
    pub quantity: i64,
}

pub trait Bot: Send + Sync {
    fn username(&self) -> &str;

    /// Probability of acting on a market in a given cycle.
    fn trade_chance(&self) -> f64;

    /// `current_price` is the YES price.
    fn order(&self, current_price: f64, market_name: &str) -> Option<BotOrder>;
}

/// Uniformly random trader.
pub struct RandomBot {
    username: String,
}

impl RandomBot {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

impl Bot for RandomBot {
    fn username(&self) -> &str {
        &self.username
    }

    fn trade_chance(&self) -> f64 {
        0.4
    }

    fn order(&self, _current_price: f64, _market_name: &str) -> Option<BotOrder> {
        let mut rng = rand::thread_rng();
        Some(BotOrder {
            action: if rng.gen_bool(0.5) {
                TradeAction::Buy
            } else {
                TradeAction::Sell
            },
            side: if rng.gen_bool(0.5) { Side::Yes } else { Side::No },
            // Small trades for frequent visible activity.
            quantity: rng.gen_range(1..=3),
        })
    }
}

/// Trades toward a fixed per-market belief; size scales with mispricing.
pub struct BeliefBot {
    username: String,
    default_belief: f64,
    aggressiveness: f64,
    dead_zone: f64,
    max_qty: i64,
    beliefs: HashMap<String, f64>,
}

impl BeliefBot {
    pub fn new(username: impl Into<String>, default_belief: f64, aggressiveness: f64) -> Self {
        Self {
            username: username.into(),
            default_belief,
            aggressiveness,
            dead_zone: 0.02,
            max_qty: 10,
            beliefs: default_market_beliefs(),
        }
    }
}

impl Bot for BeliefBot {
    fn username(&self) -> &str {
        &self.username
    }

    fn trade_chance(&self) -> f64 {
        0.3
    }

    fn order(&self, current_price: f64, market_name: &str) -> Option<BotOrder> {
        let belief = self
            .beliefs
            .get(market_name)
            .copied()
            .unwrap_or(self.default_belief);
        let diff = belief - current_price;
        if diff.abs() < self.dead_zone {
            return None;
        }

        let side = if diff > 0.0 { Side::Yes } else { Side::No };
        let quantity = ((diff.abs() * self.aggressiveness).round() as i64).clamp(1, self.max_qty);
        Some(BotOrder {
            action: TradeAction::Buy,
            side,
            quantity,
        })
    }
}

/// Leans one way with configurable intensity; occasionally takes profit.
pub struct BiasedBot {
    username: String,
    default_bias: Side,
    default_intensity: f64,
    bias_config: HashMap<String, (Side, f64)>,
}

impl BiasedBot {
    pub fn new(username: impl Into<String>, default_bias: Side, default_intensity: f64) -> Self {
        Self {
            username: username.into(),
            default_bias,
            default_intensity,
            bias_config: default_market_bias(),
        }
    }
}

impl Bot for BiasedBot {
    fn username(&self) -> &str {
        &self.username
    }

    fn trade_chance(&self) -> f64 {
        0.5
    }

    fn order(&self, _current_price: f64, market_name: &str) -> Option<BotOrder> {
        let (side, intensity) = self
            .bias_config
            .get(market_name)
            .copied()
            .unwrap_or((self.default_bias, self.default_intensity));

        let mut rng = rand::thread_rng();
        let action = if rng.gen::<f64>() < 0.2 * (1.0 - intensity) {
            TradeAction::Sell
        } else {
            TradeAction::Buy
        };

        let max_qty = ((5.0 * (0.5 + 0.5 * intensity)) as i64).max(1);
        Some(BotOrder {
            action,
            side,
            quantity: rng.gen_range(1..=max_qty),
        })
    }
}

/// Trades very frequently in small size, mean-reverting at the extremes.
pub struct HyperActiveBot {
    username: String,
}

impl HyperActiveBot {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

impl Bot for HyperActiveBot {
    fn username(&self) -> &str {
        &self.username
    }

    fn trade_chance(&self) -> f64 {
        0.9
    }

    fn order(&self, current_price: f64, _market_name: &str) -> Option<BotOrder> {
        let mut rng = rand::thread_rng();
        let (action, side) = if current_price > 0.7 {
            if rng.gen_bool(0.6) {
                (TradeAction::Buy, Side::No)
            } else {
                (TradeAction::Sell, Side::Yes)
            }
        } else if current_price < 0.3 {
            if rng.gen_bool(0.6) {
                (TradeAction::Buy, Side::Yes)
            } else {
                (TradeAction::Sell, Side::No)
            }
        } else {
            (
                if rng.gen_bool(0.5) {
                    TradeAction::Buy
                } else {
                    TradeAction::Sell
                },
                if rng.gen_bool(0.5) { Side::Yes } else { Side::No },
            )
        };

        Some(BotOrder {
            action,
            side,
            quantity: rng.gen_range(1..=2),
        })
    }
}

fn default_market_beliefs() -> HashMap<String, f64> {
    HashMap::from([
        ("TestMarketOne".to_string(), 0.7),
        ("TestMarketTwo".to_string(), 0.3),
        ("TestMarketThree".to_string(), 0.5),
    ])
}

fn default_market_bias() -> HashMap<String, (Side, f64)> {
    HashMap::from([
        ("TestMarketOne".to_string(), (Side::Yes, 0.9)),
        ("TestMarketTwo".to_string(), (Side::No, 0.7)),
        ("TestMarketThree".to_string(), (Side::Yes, 0.6)),
    ])
}

pub fn default_bots() -> Vec<Box<dyn Bot>> {
    vec![
        Box::new(HyperActiveBot::new("botHyper1")),
        Box::new(HyperActiveBot::new("botHyper2")),
        Box::new(RandomBot::new("botR")),
        Box::new(BiasedBot::new("botB", Side::Yes, 0.7)),
        Box::new(BiasedBot::new("botN", Side::No, 0.7)),
        Box::new(BeliefBot::new("botBull", 0.6, 15.0)),
        Box::new(BeliefBot::new("botBear", 0.4, 15.0)),
    ]
}

/// Top-level bot loop; spawned once at startup when bots are enabled.
pub async fn run_bot_loop(pool: PgPool, config: Arc<Config>) {
    sleep(Duration::from_secs(3)).await;
    info!("starting bot trading loop");

    let bots = default_bots();
    loop {
        match run_bot_cycle(&pool, &config, &bots).await {
            Ok(traded_any_market) => {
                if !traded_any_market {
                    // Nothing to trade; back off.
                    sleep(Duration::from_secs(30)).await;
                    continue;
                }
            }
            Err(e) => warn!(error = %e, "bot cycle failed"),
        }
        sleep(Duration::from_secs(5)).await;
    }
}

async fn run_bot_cycle(
    pool: &PgPool,
    config: &Config,
    bots: &[Box<dyn Bot>],
) -> Result<bool, ExchangeError> {
    let markets = api::list_markets(pool, None).await?;
    if markets.is_empty() {
        return Ok(false);
    }

    for market in &markets {
        let state: Option<(f64, i64, i64)> = sqlx::query_as(
            "SELECT m.b, a.q_yes, a.q_no
             FROM markets m JOIN amms a ON a.market_id = m.id
             WHERE m.id = $1",
        )
        .bind(market.id)
        .fetch_optional(pool)
        .await?;
        let Some((b, amm_q_yes, amm_q_no)) = state else {
            continue;
        };
        let current_price = lmsr::yes_price(b, -(amm_q_yes as f64), -(amm_q_no as f64));

        for bot in bots {
            if rand::thread_rng().gen::<f64>() > bot.trade_chance() {
                continue;
            }

            if let Err(e) = ensure_bot_balance(pool, config, bot.username()).await {
                warn!(bot = bot.username(), error = %e, "bot balance check failed");
                continue;
            }

            let Some(order) = bot.order(current_price, &market.name) else {
                continue;
            };
            if order.quantity <= 0 {
                continue;
            }

            let result = match order.action {
                TradeAction::Buy => {
                    api::buy(
                        pool,
                        config,
                        market.id,
                        bot.username(),
                        order.side,
                        Some(order.quantity),
                        None,
                        None,
                    )
                    .await
                }
                TradeAction::Sell => {
                    api::sell(
                        pool,
                        config,
                        market.id,
                        bot.username(),
                        order.side,
                        Some(order.quantity),
                        None,
                        None,
                    )
                    .await
                }
            };

            // Failed bot trades (insufficient holdings, settled race, ...) are
            // expected noise.
            if let Err(e) = result {
                debug!(
                    bot = bot.username(),
                    market = %market.name,
                    error = %e,
                    "bot trade rejected"
                );
            }
        }
    }

    Ok(true)
}

/// Provision the bot user at its target balance, topping back up when it
/// drains below the minimum.
async fn ensure_bot_balance(
    pool: &PgPool,
    config: &Config,
    username: &str,
) -> Result<(), ExchangeError> {
    let mut tx = pool.begin().await?;
    let user = exchange::get_or_create_user(&mut tx, username, config.bots.target_balance).await?;
    if user.points < config.bots.min_balance {
        let top_up = config.bots.target_balance - user.points;
        sqlx::query("UPDATE users SET points = points + $1 WHERE id = $2")
            .bind(top_up)
            .bind(user.id)
            .execute(tx.as_mut())
            .await?;
        info!(bot = username, top_up, "topped up bot balance");
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn belief_bot_respects_dead_zone() {
        let bot = BeliefBot::new("bull", 0.5, 15.0);
        assert!(bot.order(0.49, "SomeMarket").is_none());
        assert!(bot.order(0.51, "SomeMarket").is_none());
    }

    #[test]
    fn belief_bot_buys_toward_belief() {
        let bot = BeliefBot::new("bull", 0.6, 15.0);
        let order = bot.order(0.4, "SomeMarket").unwrap();
        assert_eq!(order.action, TradeAction::Buy);
        assert_eq!(order.side, Side::Yes);
        assert!(order.quantity >= 1 && order.quantity <= 10);

        let order = bot.order(0.8, "SomeMarket").unwrap();
        assert_eq!(order.side, Side::No);
    }

    #[test]
    fn belief_bot_uses_per_market_table() {
        let bot = BeliefBot::new("bull", 0.5, 12.0);
        // TestMarketOne belief is 0.7: at 0.5 it buys YES.
        let order = bot.order(0.5, "TestMarketOne").unwrap();
        assert_eq!(order.side, Side::Yes);
        // aggressiveness 12 * 0.2 mispricing rounds to 2 contracts
        assert_eq!(order.quantity, 2);
    }

    #[test]
    fn hyperactive_bot_fades_extremes() {
        let bot = HyperActiveBot::new("hyper");
        for _ in 0..50 {
            let order = bot.order(0.9, "m").unwrap();
            match order.action {
                TradeAction::Buy => assert_eq!(order.side, Side::No),
                TradeAction::Sell => assert_eq!(order.side, Side::Yes),
            }
            assert!(order.quantity >= 1 && order.quantity <= 2);
        }
    }

    #[test]
    fn biased_bot_size_scales_with_intensity() {
        let bot = BiasedBot::new("b", Side::Yes, 1.0);
        for _ in 0..50 {
            let order = bot.order(0.5, "unknown-market").unwrap();
            assert!(order.quantity >= 1 && order.quantity <= 5);
        }
    }
}
