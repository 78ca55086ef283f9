//! Leveraged position engine core.
//!
//! This crate provides the engine's core functionality:
//! - Position accounting codec (two packed 256-bit words per position)
//! - Shared position ledger with per-position operation serialization
//! - Flash-loan-driven leverage loop orchestration (open/close)
//! - Health factor computation, liquidation, collateral adjustment
//! - Admin-gated configuration registry (markets, thresholds, fees)
//! - Typed event records with an in-process event log
//!
//! External collaborators (custody, ownership tokens, lending market,
//! flash lender, swap venue, price oracle) live behind the adapter
//! traits in `levengine-venue`.

pub mod codec;
mod engine;
mod error;
mod events;
mod ledger;
mod position;
mod registry;
pub mod wad;

pub use engine::{
    Adapters, Engine, OpenParams, LIQUIDATION_BONUS_BPS, SAFE_HEALTH_BUFFER_WAD,
};
pub use error::{from_venue_boundary, EngineError, ErrorClass};
pub use events::{
    EngineEvent, EventLog, HealthUpdated, PositionClosed, PositionLiquidated, PositionOpened,
};
pub use ledger::Ledger;
pub use position::{
    derive_symbol, iterations_for_leverage, signed_equity, Direction, LoopRequest, Position,
    PositionId, PositionMeta, Symbol, VenueParams,
};
pub use registry::{
    AssetEntry, Registry, RegistryConfig, MAX_LIQUIDATION_THRESHOLD_BPS, MAX_PROTOCOL_FEE_BPS,
};
