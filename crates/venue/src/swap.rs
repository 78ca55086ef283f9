//! Swap venue adapter.

use alloy::primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Exact-input swap venue.
#[async_trait]
pub trait SwapVenue: Send + Sync + Debug {
    /// Swap `amount_in` of `token_in` for `token_out` at the pool
    /// selected by `fee_tier`, returning the realized output amount.
    async fn exact_in(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee_tier: u32,
    ) -> Result<U256>;
}
