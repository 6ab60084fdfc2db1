//! Numerically stable LMSR pricing kernel.
//!
//! Pure functions over `(b, q_yes, q_no)` — no I/O, no state. Quantities are
//! the *outstanding* contract counts per side; the persistence layer stores
//! the sign-flipped AMM inventory and negates it before calling in here.

use crate::error::ExchangeError;

/// Market side for a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn other(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::str::FromStr for Side {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yes" => Ok(Side::Yes),
            "no" => Ok(Side::No),
            other => Err(ExchangeError::InvalidArgument(format!(
                "side must be 'yes' or 'no', got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a budget quote is for buying contracts or selling them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteMode {
    Buy,
    Sell,
}

/// Stable `log(exp(a) + exp(b))`.
#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> Result<f64, ExchangeError> {
    let m = a.max(b);
    if !m.is_finite() {
        return Err(ExchangeError::PricingOverflow);
    }
    Ok(m + ((a - m).exp() + (b - m).exp()).ln())
}

/// LMSR cost potential `C(q_yes, q_no) = b * lse(q_yes/b, q_no/b)`.
#[inline]
pub fn cost_potential(b: f64, q_yes: f64, q_no: f64) -> Result<f64, ExchangeError> {
    Ok(b * log_sum_exp(q_yes / b, q_no / b)?)
}

/// Cost of moving the outstanding quantity of `side` by `dq` contracts.
///
/// Positive `dq` is a buy (positive cost); negative `dq` is a sell, whose
/// payout is `-trade_cost(..., -qty, ...)`.
pub fn trade_cost(
    b: f64,
    q_yes: f64,
    q_no: f64,
    dq: f64,
    side: Side,
) -> Result<f64, ExchangeError> {
    let c_old = cost_potential(b, q_yes, q_no)?;
    let c_new = match side {
        Side::Yes => cost_potential(b, q_yes + dq, q_no)?,
        Side::No => cost_potential(b, q_yes, q_no + dq)?,
    };
    let cost = c_new - c_old;
    if !cost.is_finite() {
        return Err(ExchangeError::PricingOverflow);
    }
    Ok(cost)
}

/// YES price `exp(q_yes/b) / (exp(q_yes/b) + exp(q_no/b))`, always in [0, 1]
/// for finite inputs.
#[inline]
pub fn yes_price(b: f64, q_yes: f64, q_no: f64) -> f64 {
    let a = q_yes / b;
    let c = q_no / b;
    let m = a.max(c);
    let exp_yes = (a - m).exp();
    let exp_no = (c - m).exp();
    exp_yes / (exp_yes + exp_no)
}

/// Price of the given side.
#[inline]
pub fn side_price(b: f64, q_yes: f64, q_no: f64, side: Side) -> f64 {
    let p = yes_price(b, q_yes, q_no);
    match side {
        Side::Yes => p,
        Side::No => 1.0 - p,
    }
}

/// Expansion cap for the doubling search. Budgets that support more contracts
/// than this are still answered exactly within the final bracket.
const QTY_SEARCH_CAP: i64 = 1_000_000_000;

/// Largest whole number of contracts whose buy cost (or sell payout) fits the
/// budget: `cost(q) <= budget < cost(q + 1)`, treating a non-finite cost at
/// the upper edge as exceeding the budget.
pub fn max_quantity_for_budget(
    b: f64,
    q_yes: f64,
    q_no: f64,
    side: Side,
    budget: f64,
    mode: QuoteMode,
) -> Result<i64, ExchangeError> {
    if !(budget > 0.0) {
        return Err(ExchangeError::InvalidArgument(
            "budget must be > 0".to_string(),
        ));
    }

    let quote = |qty: i64| -> Option<f64> {
        let dq = qty as f64;
        let cost = match mode {
            QuoteMode::Buy => trade_cost(b, q_yes, q_no, dq, side),
            QuoteMode::Sell => trade_cost(b, q_yes, q_no, -dq, side).map(|c| -c),
        };
        match cost {
            Ok(c) if c.is_finite() => Some(c),
            _ => None,
        }
    };

    // Doubling search brackets the answer.
    let mut low: i64 = 0;
    let mut high: i64 = 1;
    loop {
        match quote(high) {
            Some(c) if c <= budget => {
                low = high;
                high = high.saturating_mul(2);
                if high > QTY_SEARCH_CAP {
                    break;
                }
            }
            _ => break,
        }
    }

    if low == 0 {
        return Err(ExchangeError::BudgetInsufficient);
    }

    // Integer binary search inside the bracket.
    while low < high {
        let mid = low + (high - low + 1) / 2;
        match quote(mid) {
            Some(c) if c <= budget => low = mid,
            _ => high = mid - 1,
        }
    }

    Ok(low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() < tol,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn fresh_market_is_even_money() {
        assert_close(yes_price(20.0, 0.0, 0.0), 0.5, 1e-12);
        assert_close(side_price(20.0, 0.0, 0.0, Side::No), 0.5, 1e-12);
    }

    #[test]
    fn ten_yes_on_fresh_default_market() {
        // b = 20: C(10,0) - C(0,0) = 20*ln(e^0.5 + 1) - 20*ln(2)
        let cost = trade_cost(20.0, 0.0, 0.0, 10.0, Side::Yes).unwrap();
        assert_close(cost, 5.618596072403228, 1e-9);
        assert_close(yes_price(20.0, 10.0, 0.0), 0.6224593312018546, 1e-12);
    }

    #[test]
    fn sell_is_negative_delta() {
        let buy = trade_cost(20.0, 0.0, 0.0, 10.0, Side::Yes).unwrap();
        let payout = -trade_cost(20.0, 10.0, 0.0, -10.0, Side::Yes).unwrap();
        assert_close(buy, payout, 1e-9);
    }

    #[test]
    fn saturated_inputs_overflow() {
        assert!(matches!(
            log_sum_exp(f64::INFINITY, 0.0),
            Err(ExchangeError::PricingOverflow)
        ));
        assert!(matches!(
            trade_cost(20.0, f64::INFINITY, 0.0, 1.0, Side::Yes),
            Err(ExchangeError::PricingOverflow)
        ));
    }

    #[test]
    fn budget_of_thousand_on_fresh_default_market() {
        let q =
            max_quantity_for_budget(20.0, 0.0, 0.0, Side::Yes, 1000.0, QuoteMode::Buy).unwrap();
        let at = trade_cost(20.0, 0.0, 0.0, q as f64, Side::Yes).unwrap();
        let next = trade_cost(20.0, 0.0, 0.0, (q + 1) as f64, Side::Yes).unwrap();
        assert!(at <= 1000.0 && next > 1000.0, "q={q} at={at} next={next}");
        // ~budget + b*ln(2) contracts once the price saturates near 1.
        assert_eq!(q, 1013);
    }

    #[test]
    fn tiny_budget_is_insufficient() {
        let err = max_quantity_for_budget(20.0, 0.0, 0.0, Side::Yes, 0.01, QuoteMode::Buy)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::BudgetInsufficient));
    }

    #[test]
    fn sell_quote_respects_budget() {
        // 100 YES outstanding; quote how many to sell to raise ~20 points.
        let q = max_quantity_for_budget(20.0, 100.0, 0.0, Side::Yes, 20.0, QuoteMode::Sell)
            .unwrap();
        let payout = -trade_cost(20.0, 100.0, 0.0, -(q as f64), Side::Yes).unwrap();
        let next = -trade_cost(20.0, 100.0, 0.0, -((q + 1) as f64), Side::Yes).unwrap();
        assert!(payout <= 20.0 && next > 20.0);
    }

    proptest! {
        #[test]
        fn price_stays_in_unit_interval(
            b in 1.0f64..1000.0,
            q_yes in -1_000_000.0f64..1_000_000.0,
            q_no in -1_000_000.0f64..1_000_000.0,
        ) {
            let p = yes_price(b, q_yes, q_no);
            prop_assert!((0.0..=1.0).contains(&p), "p={}", p);
        }

        #[test]
        fn buying_yes_raises_the_yes_price(
            b in 20.0f64..100.0,
            q_yes in -200.0f64..200.0,
            q_no in -200.0f64..200.0,
            dq in 1i64..50,
        ) {
            let before = yes_price(b, q_yes, q_no);
            let after = yes_price(b, q_yes + dq as f64, q_no);
            prop_assert!(after > before, "before={} after={}", before, after);
            let after_no = yes_price(b, q_yes, q_no + dq as f64);
            prop_assert!(after_no < before, "before={} after_no={}", before, after_no);
        }

        #[test]
        fn trade_costs_are_path_independent(
            b in 10.0f64..100.0,
            q_yes in -200.0f64..200.0,
            q_no in -200.0f64..200.0,
            dq1 in 1i64..100,
            dq2 in 1i64..100,
        ) {
            let step1 = trade_cost(b, q_yes, q_no, dq1 as f64, Side::Yes).unwrap();
            let step2 = trade_cost(b, q_yes + dq1 as f64, q_no, dq2 as f64, Side::Yes).unwrap();
            let direct = trade_cost(b, q_yes, q_no, (dq1 + dq2) as f64, Side::Yes).unwrap();
            prop_assert!(
                (step1 + step2 - direct).abs() < 1e-8,
                "split={} direct={}",
                step1 + step2,
                direct
            );
        }

        #[test]
        fn round_trip_never_profits(
            b in 10.0f64..100.0,
            q_yes in -200.0f64..200.0,
            q_no in -200.0f64..200.0,
            qty in 1i64..100,
        ) {
            let cost = trade_cost(b, q_yes, q_no, qty as f64, Side::Yes).unwrap();
            let payout =
                -trade_cost(b, q_yes + qty as f64, q_no, -(qty as f64), Side::Yes).unwrap();
            // Exact LMSR round trips net to zero; float noise must not let the
            // trader come out ahead by more than rounding dust.
            prop_assert!((payout - cost).abs() < 1e-8, "cost={} payout={}", cost, payout);
        }

        #[test]
        fn budget_inversion_is_tight(
            b in 5.0f64..100.0,
            q_yes in -100.0f64..100.0,
            q_no in -100.0f64..100.0,
            budget in 1.0f64..5000.0,
        ) {
            match max_quantity_for_budget(b, q_yes, q_no, Side::Yes, budget, QuoteMode::Buy) {
                Ok(q) => {
                    let at = trade_cost(b, q_yes, q_no, q as f64, Side::Yes).unwrap();
                    prop_assert!(at <= budget, "cost({})={} > budget {}", q, at, budget);
                    match trade_cost(b, q_yes, q_no, (q + 1) as f64, Side::Yes) {
                        Ok(next) => prop_assert!(next > budget),
                        Err(_) => {} // non-finite at the edge counts as exceeding
                    }
                }
                Err(ExchangeError::BudgetInsufficient) => {
                    let one = trade_cost(b, q_yes, q_no, 1.0, Side::Yes).unwrap();
                    prop_assert!(one > budget);
                }
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }
    }
}
