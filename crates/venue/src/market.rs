//! Lending market and flash lender adapters.

use alloy::primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Lending venue operations. Each call returns the realized amount,
/// which may differ from the requested amount (rounding, share math).
#[async_trait]
pub trait LendingMarket: Send + Sync + Debug {
    /// Supply `amount` of `asset` as collateral on behalf of `on_behalf`.
    async fn supply(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256>;

    /// Borrow `amount` of `asset` against `on_behalf`'s collateral.
    async fn borrow(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256>;

    /// Repay up to `amount` of `on_behalf`'s `asset` debt.
    async fn repay(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256>;

    /// Withdraw `amount` of supplied `asset` collateral.
    async fn withdraw(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256>;
}

/// Receiver side of a flash loan. The lender invokes this synchronously,
/// inside the same logical operation, after delivering the funds.
#[async_trait]
pub trait FlashBorrower: Send + Sync {
    /// `lender` identifies the calling venue, `fee` is owed on top of
    /// `amount`, and `loan_ref` is the opaque reference the borrower
    /// attached when requesting the loan.
    async fn on_flash_loan(
        &self,
        lender: Address,
        asset: Address,
        amount: U256,
        fee: U256,
        loan_ref: u64,
    ) -> Result<()>;
}

/// Flash lender venue. A loan is delivered, the callback runs, and
/// repayment of `amount + fee` is collected before `flash_loan` returns;
/// any failure along the way fails the whole call.
#[async_trait]
pub trait FlashLender: Send + Sync + Debug {
    async fn flash_loan(
        &self,
        asset: Address,
        amount: U256,
        loan_ref: u64,
        borrower: &dyn FlashBorrower,
    ) -> Result<()>;

    /// Fee charged on the borrowed amount, in basis points.
    fn flash_fee_bps(&self) -> u16;

    /// Identity the lender presents to the callback.
    fn lender_id(&self) -> Address;
}
