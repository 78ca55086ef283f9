//! Observable engine records.
//!
//! Each state transition emits one typed record into the in-process
//! event log (and a matching tracing line). The log is the engine's
//! observable side-effect surface: the binary drains it for display
//! and the integration tests assert against it.

use alloy::primitives::{Address, I256, U256};
use parking_lot::RwLock;

use crate::position::PositionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionOpened {
    pub id: PositionId,
    pub owner: Address,
    pub collateral_token: Address,
    pub borrow_token: Address,
    pub collateral_amount: U256,
    pub leverage: u8,
    pub is_long: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionClosed {
    pub id: PositionId,
    pub owner: Address,
    /// Residual value returned to the owner, deposit-asset units.
    pub returned_amount: U256,
    pub pnl: I256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionLiquidated {
    pub id: PositionId,
    pub owner: Address,
    pub liquidator: Address,
    pub debt_repaid: U256,
    pub collateral_liquidated: U256,
    pub bonus: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdated {
    pub id: PositionId,
    pub owner: Address,
    pub health_factor: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Opened(PositionOpened),
    Closed(PositionClosed),
    Liquidated(PositionLiquidated),
    Health(HealthUpdated),
}

/// Append-only in-process event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<EngineEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: EngineEvent) {
        self.events.write().push(event);
    }

    /// Take every recorded event, leaving the log empty.
    pub fn drain(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut *self.events.write())
    }

    pub fn snapshot(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let log = EventLog::new();
        log.record(EngineEvent::Health(HealthUpdated {
            id: PositionId(1),
            owner: Address::ZERO,
            health_factor: U256::MAX,
        }));
        assert_eq!(log.len(), 1);
        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert!(log.is_empty());
    }
}
