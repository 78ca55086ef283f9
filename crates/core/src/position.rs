//! Position data structures for the leveraged position engine.

use alloy::primitives::{keccak256, Address, B256, I256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque position identifier, backed by the ownership token id.
/// Assigned once at creation and never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn is_long(self) -> bool {
        matches!(self, Self::Long)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Instrument fingerprint: a keccak hash of the pair, direction,
/// leverage, and creation time. Strictly opaque; token identities and
/// direction live as explicit ledger fields and are never recovered
/// from this hash.
pub type Symbol = B256;

pub fn derive_symbol(
    collateral_token: Address,
    borrow_token: Address,
    leverage: u8,
    direction: Direction,
    created_at: i64,
) -> Symbol {
    let mut buf = [0u8; 20 + 20 + 1 + 1 + 8];
    buf[..20].copy_from_slice(collateral_token.as_slice());
    buf[20..40].copy_from_slice(borrow_token.as_slice());
    buf[40] = leverage;
    buf[41] = direction.is_long() as u8;
    buf[42..].copy_from_slice(&created_at.to_be_bytes());
    keccak256(buf)
}

/// Immutable per-position metadata, stored alongside the packed words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMeta {
    pub symbol: Symbol,
    pub collateral_token: Address,
    pub borrow_token: Address,
    pub direction: Direction,
    pub leverage: u8,
    pub liquidation_threshold_bps: u16,
}

impl PositionMeta {
    /// Asset supplied to the lending market as collateral.
    pub fn supply_asset(&self) -> Address {
        match self.direction {
            Direction::Long => self.collateral_token,
            Direction::Short => self.borrow_token,
        }
    }

    /// Asset the position owes to the lending market.
    pub fn debt_asset(&self) -> Address {
        match self.direction {
            Direction::Long => self.borrow_token,
            Direction::Short => self.collateral_token,
        }
    }

    /// Asset the trader deposits and receives back. A short's equity is
    /// already stable-denominated, so it deposits the borrow asset.
    pub fn deposit_asset(&self) -> Address {
        self.supply_asset()
    }
}

/// Decoded ledger view of one position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub id: PositionId,
    pub meta: PositionMeta,
    /// Total supplied notional (supply-asset units).
    pub open_quantity: U256,
    /// Total owed against that notional: borrowed principal plus the
    /// accrued flash-loan fee (debt-asset units).
    pub open_cost: U256,
    /// Trader equity; losses may drive it negative before liquidation.
    pub collateral: I256,
    /// Fees accrued to the protocol, not yet swept.
    pub protocol_fees: U256,
}

impl Position {
    /// A position with no outstanding cost is debt-free and by
    /// definition maximally healthy.
    pub fn is_debt_free(&self) -> bool {
        self.open_cost.is_zero()
    }
}

/// Signed difference `quantity - cost`, widened through I256 so the
/// subtraction itself cannot overflow; width is enforced at encode.
pub fn signed_equity(quantity: U256, cost: U256) -> I256 {
    if quantity >= cost {
        I256::from_raw(quantity - cost)
    } else {
        -I256::from_raw(cost - quantity)
    }
}

/// Loop iteration count per leverage tier. A single swap-and-supply
/// pass under-shoots the target ratio by slippage and fee drag; higher
/// tiers get more convergence passes.
pub fn iterations_for_leverage(leverage: u8) -> u8 {
    match leverage {
        0..=2 => 1,
        3..=5 => 2,
        6..=10 => 3,
        _ => 4,
    }
}

/// Transient request created by `open_position`, consumed exactly once
/// by the flash-loan callback, then discarded.
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub id: PositionId,
    pub owner: Address,
    pub meta: PositionMeta,
    /// Trader deposit, in deposit-asset units.
    pub collateral_amount: U256,
    pub flash_amount: U256,
    pub iterations: u8,
    pub venue: VenueParams,
}

/// Venue routing parameters carried through the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueParams {
    /// Swap pool fee tier (e.g. 3000 = 0.3%).
    pub swap_fee_tier: u32,
}

impl Default for VenueParams {
    fn default() -> Self {
        Self { swap_fee_tier: 3000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_tiers() {
        assert_eq!(iterations_for_leverage(2), 1);
        assert_eq!(iterations_for_leverage(5), 2);
        assert_eq!(iterations_for_leverage(10), 3);
        assert_eq!(iterations_for_leverage(11), 4);
        assert_eq!(iterations_for_leverage(20), 4);
    }

    #[test]
    fn test_symbol_is_direction_sensitive() {
        let a = Address::with_last_byte(1);
        let b = Address::with_last_byte(2);
        let long = derive_symbol(a, b, 5, Direction::Long, 1_700_000_000);
        let short = derive_symbol(a, b, 5, Direction::Short, 1_700_000_000);
        let later = derive_symbol(a, b, 5, Direction::Long, 1_700_000_001);
        assert_ne!(long, short);
        assert_ne!(long, later);
    }

    #[test]
    fn test_signed_equity() {
        let q = U256::from(200u64);
        let c = U256::from(150u64);
        assert_eq!(signed_equity(q, c), I256::try_from(50i64).unwrap());
        assert_eq!(signed_equity(c, q), I256::try_from(-50i64).unwrap());
    }

    #[test]
    fn test_role_assets() {
        let meta = PositionMeta {
            symbol: B256::ZERO,
            collateral_token: Address::with_last_byte(1),
            borrow_token: Address::with_last_byte(2),
            direction: Direction::Short,
            leverage: 3,
            liquidation_threshold_bps: 8000,
        };
        assert_eq!(meta.supply_asset(), meta.borrow_token);
        assert_eq!(meta.debt_asset(), meta.collateral_token);
        assert_eq!(meta.deposit_asset(), meta.borrow_token);
    }
}
