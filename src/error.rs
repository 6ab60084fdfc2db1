//! Error taxonomy for the exchange engine.
//!
//! Every externally observable failure maps to exactly one variant, so callers
//! (and tests) can match on the condition instead of parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("market not found")]
    MarketNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("no position for this market")]
    PositionNotFound,

    #[error("market is settled")]
    MarketSettled,

    #[error("you cannot trade this market")]
    AccessDenied,

    #[error("not enough points for order")]
    InsufficientFunds,

    #[error("not enough {side} contracts to sell")]
    InsufficientHoldings { side: &'static str },

    #[error("budget insufficient for 1 contract")]
    BudgetInsufficient,

    #[error("AMM does not have enough points to pay this sell")]
    AmmInsolvent,

    #[error("AMM lacks points for required collateral")]
    CollateralShortfall,

    #[error("state inconsistent: {0}")]
    ConsistencyViolation(String),

    #[error("pricing overflow")]
    PricingOverflow,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ExchangeError {
    /// Engine/state bugs that must surface to an operator channel rather than
    /// to the end user.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConsistencyViolation(_)
                | Self::AmmInsolvent
                | Self::CollateralShortfall
                | Self::PricingOverflow
                | Self::Database(_)
        )
    }

    /// Whether retrying the whole transaction may succeed.
    ///
    /// SQLSTATE reference: 40001 serialization failure, 40P01 deadlock
    /// detected, 23505 unique violation (provisioning races).
    pub fn is_retryable(&self) -> bool {
        let Self::Database(sqlx::Error::Database(db_err)) = self else {
            return false;
        };
        match db_err.code() {
            Some(code) => matches!(code.as_ref(), "40001" | "40P01" | "23505"),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_not_fatal() {
        for err in [
            ExchangeError::InvalidArgument("side must be 'yes' or 'no'".into()),
            ExchangeError::MarketSettled,
            ExchangeError::AccessDenied,
            ExchangeError::InsufficientFunds,
            ExchangeError::InsufficientHoldings { side: "YES" },
            ExchangeError::BudgetInsufficient,
        ] {
            assert!(!err.is_fatal(), "{err} should be user-visible");
        }
    }

    #[test]
    fn invariant_errors_are_fatal() {
        for err in [
            ExchangeError::ConsistencyViolation("collateral exceeds requirement".into()),
            ExchangeError::AmmInsolvent,
            ExchangeError::CollateralShortfall,
            ExchangeError::PricingOverflow,
        ] {
            assert!(err.is_fatal(), "{err} should be fatal");
        }
    }

    #[test]
    fn non_database_errors_never_retry() {
        assert!(!ExchangeError::MarketSettled.is_retryable());
        assert!(!ExchangeError::PricingOverflow.is_retryable());
    }
}
