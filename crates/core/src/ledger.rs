//! Shared position ledger.
//!
//! One entry per live `PositionId`, stored as two packed 256-bit words
//! plus immutable metadata. Encoding and decoding happen here, at the
//! repository boundary; the orchestrator and the health engine both
//! read and write through this type and never touch raw words.
//!
//! Serialization: every mutating operation on a position holds that
//! position's async lock for its whole duration, so operations on the
//! same id are strictly ordered while distinct ids proceed in parallel.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::codec;
use crate::error::EngineError;
use crate::position::{Position, PositionId, PositionMeta};

#[derive(Debug, Clone)]
struct StoredEntry {
    meta: PositionMeta,
    /// `(open_quantity | open_cost)` packed word.
    notional: alloy::primitives::U256,
    /// `(collateral | protocol_fees)` packed word.
    balance: alloy::primitives::U256,
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: DashMap<PositionId, StoredEntry>,
    locks: DashMap<PositionId, Arc<Mutex<()>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-position operation lock. Held across a whole mutating
    /// operation to serialize same-id operations by arrival.
    pub fn lock_for(&self, id: PositionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn contains(&self, id: PositionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<PositionId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Decode the entry for `id`.
    pub fn get(&self, id: PositionId) -> Result<Position, EngineError> {
        let entry = self
            .entries
            .get(&id)
            .ok_or(EngineError::UnknownPosition(id))?;
        let (open_quantity, open_cost) = codec::decode_notional(entry.notional);
        let (collateral, protocol_fees) = codec::decode_balance(entry.balance);
        Ok(Position {
            id,
            meta: entry.meta.clone(),
            open_quantity,
            open_cost,
            collateral,
            protocol_fees,
        })
    }

    /// Encode and store `position`, inserting or replacing its entry.
    /// Fails with `AccountingOverflow` before touching stored state.
    pub fn put(&self, position: &Position) -> Result<(), EngineError> {
        let notional = codec::encode_notional(position.open_quantity, position.open_cost)?;
        let balance = codec::encode_balance(position.collateral, position.protocol_fees)?;
        self.entries.insert(
            position.id,
            StoredEntry {
                meta: position.meta.clone(),
                notional,
                balance,
            },
        );
        Ok(())
    }

    /// Drop the entry and its lock slot. Part of the atomic clear that
    /// accompanies the ownership-token burn.
    pub fn delete(&self, id: PositionId) -> Result<(), EngineError> {
        self.entries
            .remove(&id)
            .ok_or(EngineError::UnknownPosition(id))?;
        self.locks.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{derive_symbol, Direction};
    use alloy::primitives::{Address, I256, U256};

    fn sample(id: u64) -> Position {
        let collateral_token = Address::with_last_byte(1);
        let borrow_token = Address::with_last_byte(2);
        Position {
            id: PositionId(id),
            meta: PositionMeta {
                symbol: derive_symbol(collateral_token, borrow_token, 4, Direction::Long, 0),
                collateral_token,
                borrow_token,
                direction: Direction::Long,
                leverage: 4,
                liquidation_threshold_bps: 8000,
            },
            open_quantity: U256::from(400u64),
            open_cost: U256::from(303u64),
            collateral: I256::try_from(97i64).unwrap(),
            protocol_fees: U256::ZERO,
        }
    }

    #[test]
    fn test_put_get_round_trip() {
        let ledger = Ledger::new();
        let pos = sample(1);
        ledger.put(&pos).unwrap();
        assert_eq!(ledger.get(PositionId(1)).unwrap(), pos);
    }

    #[test]
    fn test_unknown_position() {
        let ledger = Ledger::new();
        assert!(matches!(
            ledger.get(PositionId(9)),
            Err(EngineError::UnknownPosition(_))
        ));
        assert!(matches!(
            ledger.delete(PositionId(9)),
            Err(EngineError::UnknownPosition(_))
        ));
    }

    #[test]
    fn test_put_rejects_overflow_without_mutation() {
        let ledger = Ledger::new();
        let mut pos = sample(1);
        ledger.put(&pos).unwrap();

        pos.open_quantity = U256::from(1u64) << 128;
        assert!(matches!(
            ledger.put(&pos),
            Err(EngineError::AccountingOverflow)
        ));
        // Prior entry untouched.
        assert_eq!(
            ledger.get(PositionId(1)).unwrap().open_quantity,
            U256::from(400u64)
        );
    }

    #[test]
    fn test_delete_clears_entry() {
        let ledger = Ledger::new();
        ledger.put(&sample(3)).unwrap();
        ledger.delete(PositionId(3)).unwrap();
        assert!(!ledger.contains(PositionId(3)));
        assert!(ledger.is_empty());
    }
}
