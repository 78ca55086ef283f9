//! Custody and ownership-token adapters.

use alloy::primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Raw ownership-token identifier. The engine wraps this in its own
/// `PositionId` newtype; issuance and transfer live outside the engine.
pub type TokenId = u64;

/// Asset custody: moves funds between the trader, the engine vault, and
/// liquidators. Fails when balance or allowance is insufficient.
#[async_trait]
pub trait Custody: Send + Sync + Debug {
    /// Pull `amount` of `asset` from `from` into the engine vault.
    async fn transfer_in(&self, asset: Address, from: Address, amount: U256) -> Result<()>;

    /// Push `amount` of `asset` from the engine vault to `to`.
    async fn transfer_out(&self, asset: Address, to: Address, amount: U256) -> Result<()>;
}

/// Position-ownership token registry. The token is the source of truth
/// for "who may act on this position"; the engine never stores owners.
#[async_trait]
pub trait Ownership: Send + Sync + Debug {
    /// Mint a fresh token for `owner`. Identifiers are never reused.
    async fn mint(&self, owner: Address) -> Result<TokenId>;

    /// Resolve the current owner. Fails for unknown or burned tokens.
    async fn owner_of(&self, id: TokenId) -> Result<Address>;

    /// Retire a token. Fails if it does not exist.
    async fn burn(&self, id: TokenId) -> Result<()>;
}
