//! In-memory simulated venue.
//!
//! Backs every adapter trait with a shared token bank so the engine can
//! be exercised end to end without a chain: custody moves balances,
//! the market tracks supply/debt per account, the flash lender delivers
//! and collects loans around the borrower callback, the swap venue
//! applies a fixed rate table, and the oracle serves settable quotes.
//!
//! The market is deliberately permissive (no LTV check on borrow); the
//! engine owns the economics, the sim only owns the bookkeeping.

use alloy::primitives::{Address, I256, U256};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::custody::{Custody, Ownership, TokenId};
use crate::market::{FlashBorrower, FlashLender, LendingMarket};
use crate::oracle::{PriceOracle, PriceQuote};
use crate::swap::SwapVenue;

/// 1e18, the fixed-point scale used for swap rates.
const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

const BPS: u64 = 10_000;

/// Shared token bank: balances per (account, asset).
#[derive(Debug, Default)]
pub struct SimBank {
    balances: DashMap<(Address, Address), U256>,
}

impl SimBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create balance out of thin air (test/demo funding).
    pub fn mint(&self, account: Address, asset: Address, amount: U256) {
        *self.balances.entry((account, asset)).or_default() += amount;
    }

    pub fn balance_of(&self, account: Address, asset: Address) -> U256 {
        self.balances
            .get(&(account, asset))
            .map(|b| *b)
            .unwrap_or(U256::ZERO)
    }

    pub fn transfer(&self, asset: Address, from: Address, to: Address, amount: U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(());
        }
        {
            let mut src = self
                .balances
                .get_mut(&(from, asset))
                .ok_or_else(|| anyhow!("no balance: account {from} asset {asset}"))?;
            if *src < amount {
                bail!(
                    "insufficient balance: account {from} asset {asset} has {}, needs {amount}",
                    *src
                );
            }
            *src -= amount;
        }
        *self.balances.entry((to, asset)).or_default() += amount;
        Ok(())
    }
}

/// Custody adapter moving funds in and out of a fixed vault account.
#[derive(Debug)]
pub struct SimCustody {
    bank: Arc<SimBank>,
    vault: Address,
}

#[async_trait]
impl Custody for SimCustody {
    async fn transfer_in(&self, asset: Address, from: Address, amount: U256) -> Result<()> {
        self.bank.transfer(asset, from, self.vault, amount)
    }

    async fn transfer_out(&self, asset: Address, to: Address, amount: U256) -> Result<()> {
        self.bank.transfer(asset, self.vault, to, amount)
    }
}

/// Ownership-token registry with a monotonic, never-reused id counter.
#[derive(Debug, Default)]
pub struct SimOwnership {
    next: AtomicU64,
    owners: DashMap<TokenId, Address>,
}

#[async_trait]
impl Ownership for SimOwnership {
    async fn mint(&self, owner: Address) -> Result<TokenId> {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.owners.insert(id, owner);
        Ok(id)
    }

    async fn owner_of(&self, id: TokenId) -> Result<Address> {
        self.owners
            .get(&id)
            .map(|o| *o)
            .ok_or_else(|| anyhow!("unknown ownership token {id}"))
    }

    async fn burn(&self, id: TokenId) -> Result<()> {
        self.owners
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown ownership token {id}"))
    }
}

/// Lending market tracking supply and debt per (on_behalf, asset).
#[derive(Debug)]
pub struct SimMarket {
    bank: Arc<SimBank>,
    account: Address,
    supplied: DashMap<(Address, Address), U256>,
    debt: DashMap<(Address, Address), U256>,
}

impl SimMarket {
    pub fn supplied_of(&self, on_behalf: Address, asset: Address) -> U256 {
        self.supplied
            .get(&(on_behalf, asset))
            .map(|v| *v)
            .unwrap_or(U256::ZERO)
    }

    pub fn debt_of(&self, on_behalf: Address, asset: Address) -> U256 {
        self.debt
            .get(&(on_behalf, asset))
            .map(|v| *v)
            .unwrap_or(U256::ZERO)
    }
}

#[async_trait]
impl LendingMarket for SimMarket {
    async fn supply(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256> {
        self.bank.transfer(asset, on_behalf, self.account, amount)?;
        *self.supplied.entry((on_behalf, asset)).or_default() += amount;
        debug!(%asset, %amount, %on_behalf, "sim market supply");
        Ok(amount)
    }

    async fn borrow(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256> {
        self.bank.transfer(asset, self.account, on_behalf, amount)?;
        *self.debt.entry((on_behalf, asset)).or_default() += amount;
        debug!(%asset, %amount, %on_behalf, "sim market borrow");
        Ok(amount)
    }

    async fn repay(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256> {
        let owed = self.debt_of(on_behalf, asset);
        let realized = if amount < owed { amount } else { owed };
        if realized.is_zero() {
            return Ok(U256::ZERO);
        }
        self.bank.transfer(asset, on_behalf, self.account, realized)?;
        *self.debt.entry((on_behalf, asset)).or_default() -= realized;
        debug!(%asset, %realized, %on_behalf, "sim market repay");
        Ok(realized)
    }

    async fn withdraw(&self, asset: Address, amount: U256, on_behalf: Address) -> Result<U256> {
        let held = self.supplied_of(on_behalf, asset);
        if held < amount {
            bail!("withdraw exceeds supplied collateral: {held} < {amount}");
        }
        self.bank.transfer(asset, self.account, on_behalf, amount)?;
        *self.supplied.entry((on_behalf, asset)).or_default() -= amount;
        debug!(%asset, %amount, %on_behalf, "sim market withdraw");
        Ok(amount)
    }
}

/// Flash lender delivering funds to a fixed borrower account and
/// collecting `amount + fee` once the callback returns.
#[derive(Debug)]
pub struct SimFlashLender {
    bank: Arc<SimBank>,
    account: Address,
    borrower_account: Address,
    fee_bps: u16,
}

#[async_trait]
impl FlashLender for SimFlashLender {
    async fn flash_loan(
        &self,
        asset: Address,
        amount: U256,
        loan_ref: u64,
        borrower: &dyn FlashBorrower,
    ) -> Result<()> {
        let fee = amount * U256::from(self.fee_bps) / U256::from(BPS);
        self.bank
            .transfer(asset, self.account, self.borrower_account, amount)?;

        borrower
            .on_flash_loan(self.account, asset, amount, fee, loan_ref)
            .await?;

        self.bank
            .transfer(asset, self.borrower_account, self.account, amount + fee)
            .map_err(|e| anyhow!("flash loan not repaid: {e}"))
    }

    fn flash_fee_bps(&self) -> u16 {
        self.fee_bps
    }

    fn lender_id(&self) -> Address {
        self.account
    }
}

/// Fixed-rate AMM. Rates are WAD-scaled output-per-input and must be
/// configured per direction; the fee is taken from the output side.
#[derive(Debug)]
pub struct SimSwap {
    bank: Arc<SimBank>,
    account: Address,
    caller: Address,
    rates: DashMap<(Address, Address), U256>,
    fee_bps: u16,
}

impl SimSwap {
    pub fn set_rate(&self, token_in: Address, token_out: Address, rate_wad: U256) {
        self.rates.insert((token_in, token_out), rate_wad);
    }

    /// Configure both directions of a pair from one WAD rate.
    pub fn set_pair(&self, token_a: Address, token_b: Address, rate_wad: U256) {
        self.rates.insert((token_a, token_b), rate_wad);
        self.rates.insert((token_b, token_a), WAD * WAD / rate_wad);
    }
}

#[async_trait]
impl SwapVenue for SimSwap {
    async fn exact_in(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        _fee_tier: u32,
    ) -> Result<U256> {
        let rate = self
            .rates
            .get(&(token_in, token_out))
            .map(|r| *r)
            .ok_or_else(|| anyhow!("no route {token_in} -> {token_out}"))?;
        let gross = amount_in * rate / WAD;
        let out = gross * U256::from(BPS - self.fee_bps as u64) / U256::from(BPS);

        self.bank.transfer(token_in, self.caller, self.account, amount_in)?;
        self.bank.transfer(token_out, self.account, self.caller, out)?;
        debug!(%token_in, %token_out, %amount_in, %out, "sim swap");
        Ok(out)
    }
}

/// Settable price feeds keyed by asset.
#[derive(Debug, Default)]
pub struct SimOracle {
    feeds: DashMap<Address, PriceQuote>,
}

impl SimOracle {
    pub fn set_price(&self, token: Address, price: I256, decimals: u8) {
        self.feeds.insert(token, PriceQuote { price, decimals });
    }

    pub fn remove_feed(&self, token: Address) {
        self.feeds.remove(&token);
    }
}

#[async_trait]
impl PriceOracle for SimOracle {
    async fn latest_price(&self, token: Address) -> Result<Option<PriceQuote>> {
        Ok(self.feeds.get(&token).map(|q| *q))
    }
}

/// Complete simulated venue sharing one bank.
#[derive(Debug)]
pub struct SimVenue {
    pub bank: Arc<SimBank>,
    pub custody: Arc<SimCustody>,
    pub ownership: Arc<SimOwnership>,
    pub market: Arc<SimMarket>,
    pub lender: Arc<SimFlashLender>,
    pub swap: Arc<SimSwap>,
    pub oracle: Arc<SimOracle>,
}

impl SimVenue {
    /// Accounts the venue components transact under.
    pub const MARKET_ACCOUNT: Address = Address::with_last_byte(0xA1);
    pub const LENDER_ACCOUNT: Address = Address::with_last_byte(0xA2);
    pub const SWAP_ACCOUNT: Address = Address::with_last_byte(0xA3);

    /// Build a venue whose custody vault / flash borrower / swap caller
    /// is `engine_account`, with the given flash and swap fees.
    pub fn new(engine_account: Address, flash_fee_bps: u16, swap_fee_bps: u16) -> Self {
        let bank = Arc::new(SimBank::new());
        Self {
            custody: Arc::new(SimCustody {
                bank: bank.clone(),
                vault: engine_account,
            }),
            ownership: Arc::new(SimOwnership::default()),
            market: Arc::new(SimMarket {
                bank: bank.clone(),
                account: Self::MARKET_ACCOUNT,
                supplied: DashMap::new(),
                debt: DashMap::new(),
            }),
            lender: Arc::new(SimFlashLender {
                bank: bank.clone(),
                account: Self::LENDER_ACCOUNT,
                borrower_account: engine_account,
                fee_bps: flash_fee_bps,
            }),
            swap: Arc::new(SimSwap {
                bank: bank.clone(),
                account: Self::SWAP_ACCOUNT,
                caller: engine_account,
                rates: DashMap::new(),
                fee_bps: swap_fee_bps,
            }),
            oracle: Arc::new(SimOracle::default()),
            bank,
        }
    }

    /// Seed liquidity into the market, lender, and swap accounts.
    pub fn fund_venue(&self, asset: Address, amount: U256) {
        self.bank.mint(Self::MARKET_ACCOUNT, asset, amount);
        self.bank.mint(Self::LENDER_ACCOUNT, asset, amount);
        self.bank.mint(Self::SWAP_ACCOUNT, asset, amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::with_last_byte(b)
    }

    #[test]
    fn bank_transfer_checks_balance() {
        let bank = SimBank::new();
        let (alice, bob, token) = (addr(1), addr(2), addr(9));
        bank.mint(alice, token, U256::from(100u64));

        bank.transfer(token, alice, bob, U256::from(60u64)).unwrap();
        assert_eq!(bank.balance_of(alice, token), U256::from(40u64));
        assert_eq!(bank.balance_of(bob, token), U256::from(60u64));

        let err = bank
            .transfer(token, alice, bob, U256::from(41u64))
            .unwrap_err();
        assert!(err.to_string().contains("has 40, needs 41"));
    }

    #[tokio::test]
    async fn ownership_ids_never_reused() {
        let own = SimOwnership::default();
        let a = own.mint(addr(1)).await.unwrap();
        own.burn(a).await.unwrap();
        let b = own.mint(addr(1)).await.unwrap();
        assert_ne!(a, b);
        assert!(own.owner_of(a).await.is_err());
    }

    #[tokio::test]
    async fn market_round_trip() {
        let engine = addr(7);
        let token = addr(9);
        let venue = SimVenue::new(engine, 0, 0);
        venue.fund_venue(token, U256::from(1_000u64));
        venue.bank.mint(engine, token, U256::from(100u64));

        let m = &venue.market;
        m.supply(token, U256::from(100u64), engine).await.unwrap();
        m.borrow(token, U256::from(50u64), engine).await.unwrap();
        assert_eq!(m.supplied_of(engine, token), U256::from(100u64));
        assert_eq!(m.debt_of(engine, token), U256::from(50u64));

        // Repay caps at outstanding debt.
        let realized = m.repay(token, U256::from(80u64), engine).await.unwrap();
        assert_eq!(realized, U256::from(50u64));
        assert!(m
            .withdraw(token, U256::from(101u64), engine)
            .await
            .is_err());
        m.withdraw(token, U256::from(100u64), engine).await.unwrap();
    }

    #[tokio::test]
    async fn swap_applies_rate_and_fee() {
        let engine = addr(7);
        let (a, b) = (addr(10), addr(11));
        let venue = SimVenue::new(engine, 0, 100); // 1% swap fee
        venue.fund_venue(a, U256::from(10_000u64));
        venue.fund_venue(b, U256::from(10_000u64));
        venue.bank.mint(engine, a, U256::from(1_000u64));
        venue.swap.set_pair(a, b, WAD * U256::from(2u64)); // 1 a = 2 b

        let out = venue
            .swap
            .exact_in(a, b, U256::from(100u64), 3000)
            .await
            .unwrap();
        assert_eq!(out, U256::from(198u64)); // 200 minus 1%
    }

    #[tokio::test]
    async fn flash_loan_collects_fee() {
        struct NoopBorrower;
        #[async_trait]
        impl FlashBorrower for NoopBorrower {
            async fn on_flash_loan(
                &self,
                _lender: Address,
                _asset: Address,
                _amount: U256,
                _fee: U256,
                _loan_ref: u64,
            ) -> Result<()> {
                Ok(())
            }
        }

        let engine = addr(7);
        let token = addr(9);
        let venue = SimVenue::new(engine, 100, 0); // 1% flash fee
        venue.fund_venue(token, U256::from(10_000u64));
        // Borrower holds the fee up front so repayment succeeds.
        venue.bank.mint(engine, token, U256::from(10u64));

        venue
            .lender
            .flash_loan(token, U256::from(1_000u64), 1, &NoopBorrower)
            .await
            .unwrap();
        assert_eq!(venue.bank.balance_of(engine, token), U256::ZERO);
        assert_eq!(
            venue.bank.balance_of(SimVenue::LENDER_ACCOUNT, token),
            U256::from(10_010u64)
        );
    }

    #[tokio::test]
    async fn flash_loan_fails_without_repayment() {
        struct KeepBorrower;
        #[async_trait]
        impl FlashBorrower for KeepBorrower {
            async fn on_flash_loan(
                &self,
                _lender: Address,
                _asset: Address,
                _amount: U256,
                _fee: U256,
                _loan_ref: u64,
            ) -> Result<()> {
                Ok(())
            }
        }

        let engine = addr(7);
        let token = addr(9);
        let venue = SimVenue::new(engine, 100, 0);
        venue.fund_venue(token, U256::from(10_000u64));
        // No fee balance: repayment of amount + fee must fail.
        let err = venue
            .lender
            .flash_loan(token, U256::from(1_000u64), 1, &KeepBorrower)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not repaid"));
    }
}
