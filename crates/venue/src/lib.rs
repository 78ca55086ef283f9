//! Venue adapter layer for the leveraged position engine.
//!
//! This crate provides:
//! - Adapter traits for every external collaborator the engine touches:
//!   custody transfers, ownership-token issuance, the lending market,
//!   the flash lender, the swap venue, and the price oracle
//! - An in-memory simulated venue backing all of those traits, used by
//!   the demo binary and the engine integration tests
//!
//! Adapters are `async_trait` objects returning `anyhow::Result` at the
//! boundary; the engine classifies failures into its own error taxonomy.

mod custody;
mod market;
mod oracle;
mod sim;
mod swap;

pub use custody::{Custody, Ownership, TokenId};
pub use market::{FlashBorrower, FlashLender, LendingMarket};
pub use oracle::{PriceOracle, PriceQuote};
pub use sim::{SimBank, SimCustody, SimFlashLender, SimMarket, SimOracle, SimOwnership, SimSwap, SimVenue};
pub use swap::SwapVenue;
