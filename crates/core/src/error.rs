//! Engine error taxonomy.
//!
//! Every failure aborts the whole enclosing operation with no partial
//! ledger mutation; there is no in-engine retry. Variants are specific
//! so callers learn exactly which condition failed, and [`ErrorClass`]
//! groups them for policy decisions (reject-before-effect vs external).

use alloy::primitives::{Address, I256, U256};
use thiserror::Error;

use crate::position::PositionId;

#[derive(Debug, Error)]
pub enum EngineError {
    // --- input validation (rejected before any external effect) ---
    #[error("amount must be positive")]
    ZeroAmount,

    #[error("leverage {0} outside supported range [2, 20]")]
    LeverageOutOfRange(u8),

    #[error("no lending market configured for asset {0}")]
    NoLendingMarket(Address),

    #[error("no liquidation threshold configured for asset {0}")]
    NoLiquidationThreshold(Address),

    #[error("liquidation threshold {0} bps outside (0, 9500]")]
    InvalidThreshold(u16),

    #[error("protocol fee {0} bps outside [0, 100]")]
    InvalidFee(u16),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- authorization ---
    #[error("caller {caller} does not own position {id}")]
    NotOwner { id: PositionId, caller: Address },

    #[error("caller {0} lacks the admin capability")]
    NotAdmin(Address),

    #[error("flash callback from untrusted lender {0}")]
    UntrustedLender(Address),

    #[error("flash callback for unknown loan reference {0}")]
    UnknownLoan(u64),

    // --- external call failures ---
    #[error("swap returned {out}, below required minimum {min_out}")]
    SwapShortfall { out: U256, min_out: U256 },

    #[error("no price feed configured for asset {0}")]
    MissingPriceFeed(Address),

    #[error("price feed for asset {0} reported a non-positive price")]
    NonPositivePrice(Address),

    #[error("venue call failed: {0}")]
    Venue(anyhow::Error),

    // --- accounting ---
    #[error("value exceeds the 128-bit accounting field width")]
    AccountingOverflow,

    // --- health violations ---
    #[error("position is healthy (health factor {health}), cannot liquidate")]
    PositionHealthy { health: U256 },

    #[error("removal would drop health factor to {health}, below the safety buffer")]
    HealthBufferBreached { health: U256 },

    #[error("stored equity {available} is below requested amount {requested}")]
    InsufficientEquity { available: I256, requested: U256 },

    // --- lookup ---
    #[error("unknown position {0}")]
    UnknownPosition(PositionId),
}

/// Coarse failure classes mirroring the operational taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InputValidation,
    Authorization,
    ExternalCallFailure,
    AccountingOverflow,
    HealthViolation,
    NotFound,
}

impl EngineError {
    /// Wrap an adapter failure.
    pub fn venue(err: anyhow::Error) -> Self {
        Self::Venue(err)
    }

    pub fn class(&self) -> ErrorClass {
        use EngineError::*;
        match self {
            ZeroAmount | LeverageOutOfRange(_) | NoLendingMarket(_)
            | NoLiquidationThreshold(_) | InvalidThreshold(_) | InvalidFee(_)
            | InvalidConfig(_) => ErrorClass::InputValidation,
            NotOwner { .. } | NotAdmin(_) | UntrustedLender(_) | UnknownLoan(_) => {
                ErrorClass::Authorization
            }
            SwapShortfall { .. } | MissingPriceFeed(_) | NonPositivePrice(_) | Venue(_) => {
                ErrorClass::ExternalCallFailure
            }
            AccountingOverflow => ErrorClass::AccountingOverflow,
            PositionHealthy { .. } | HealthBufferBreached { .. } | InsufficientEquity { .. } => {
                ErrorClass::HealthViolation
            }
            UnknownPosition(_) => ErrorClass::NotFound,
        }
    }
}

/// Recover a typed engine error that crossed the lender's `anyhow`
/// boundary, wrapping anything else as a venue failure.
pub fn from_venue_boundary(err: anyhow::Error) -> EngineError {
    match err.downcast::<EngineError>() {
        Ok(engine_err) => engine_err,
        Err(other) => EngineError::Venue(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(EngineError::ZeroAmount.class(), ErrorClass::InputValidation);
        assert_eq!(
            EngineError::UnknownLoan(7).class(),
            ErrorClass::Authorization
        );
        assert_eq!(
            EngineError::AccountingOverflow.class(),
            ErrorClass::AccountingOverflow
        );
        assert_eq!(
            EngineError::PositionHealthy { health: U256::MAX }.class(),
            ErrorClass::HealthViolation
        );
    }

    #[test]
    fn test_venue_boundary_downcast() {
        let err = anyhow::Error::new(EngineError::AccountingOverflow);
        assert!(matches!(
            from_venue_boundary(err),
            EngineError::AccountingOverflow
        ));

        let other = from_venue_boundary(anyhow::anyhow!("socket closed"));
        assert!(matches!(other, EngineError::Venue(_)));
    }
}
