//! Price feed adapter.

use alloy::primitives::{Address, I256};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// A single feed reading. Feeds may report non-positive prices during
/// outages; consumers must reject those rather than compute on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceQuote {
    /// Latest answer, scaled by `10^decimals`.
    pub price: I256,
    /// Feed decimals (typically 8 for Chainlink-style aggregators).
    pub decimals: u8,
}

/// Price oracle adapter keyed by asset.
#[async_trait]
pub trait PriceOracle: Send + Sync + Debug {
    /// Latest quote for `token`, or `None` when no feed is configured.
    async fn latest_price(&self, token: Address) -> Result<Option<PriceQuote>>;
}
