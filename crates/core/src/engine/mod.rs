//! Leveraged position engine.
//!
//! One `Engine` owns the position ledger and orchestrates every
//! operation against it: the flash-loan leverage loop (`open`), the
//! full unwind (`close`), and the health/liquidation surface
//! (`health`). External collaborators are reached through the venue
//! adapter traits; the engine itself is the flash-loan borrower.

mod close;
mod health;
mod open;

pub use open::OpenParams;

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use levengine_venue::{
    Custody, FlashLender, LendingMarket, Ownership, PriceOracle, SwapVenue,
};

use crate::error::EngineError;
use crate::events::EventLog;
use crate::ledger::Ledger;
use crate::position::{LoopRequest, Position};
use crate::registry::Registry;
use crate::wad;

/// Liquidation bonus paid on top of the repaid value: 10%.
pub const LIQUIDATION_BONUS_BPS: u16 = 1_000;

/// Minimum post-removal health factor: 1.05, a buffer above the bare
/// liquidation line.
pub const SAFE_HEALTH_BUFFER_WAD: U256 =
    U256::from_limbs([1_050_000_000_000_000_000u64, 0, 0, 0]);

/// External collaborators the engine consumes.
pub struct Adapters {
    pub custody: Arc<dyn Custody>,
    pub ownership: Arc<dyn Ownership>,
    pub market: Arc<dyn LendingMarket>,
    pub lender: Arc<dyn FlashLender>,
    pub swap: Arc<dyn SwapVenue>,
    pub oracle: Arc<dyn PriceOracle>,
}

/// Result of one completed leverage loop, staged by the flash callback
/// and committed to the ledger once the loan has settled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopOutcome {
    pub quantity: U256,
    pub cost: U256,
}

pub struct Engine {
    pub(crate) custody: Arc<dyn Custody>,
    pub(crate) ownership: Arc<dyn Ownership>,
    pub(crate) market: Arc<dyn LendingMarket>,
    pub(crate) lender: Arc<dyn FlashLender>,
    pub(crate) swap: Arc<dyn SwapVenue>,
    pub(crate) oracle: Arc<dyn PriceOracle>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) ledger: Ledger,
    pub(crate) events: EventLog,
    /// Account the engine transacts under (custody vault, market
    /// position holder, flash borrower).
    pub(crate) account: Address,
    /// In-flight loop requests keyed by loan reference; each entry is
    /// consumed exactly once by the flash callback.
    pub(crate) in_flight: DashMap<u64, LoopRequest>,
    /// Staged loop outcomes awaiting commit after loan settlement.
    pub(crate) outcomes: DashMap<u64, LoopOutcome>,
    pub(crate) loan_nonce: AtomicU64,
    /// Protocol fees retained in the vault, per asset, not yet swept.
    pub(crate) accrued_fees: DashMap<Address, U256>,
}

impl Engine {
    pub fn new(account: Address, registry: Arc<Registry>, adapters: Adapters) -> Self {
        Self {
            custody: adapters.custody,
            ownership: adapters.ownership,
            market: adapters.market,
            lender: adapters.lender,
            swap: adapters.swap,
            oracle: adapters.oracle,
            registry,
            ledger: Ledger::new(),
            events: EventLog::new(),
            account,
            in_flight: DashMap::new(),
            outcomes: DashMap::new(),
            loan_nonce: AtomicU64::new(0),
            accrued_fees: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Protocol fees retained for `asset`, not yet swept.
    pub fn accrued_protocol_fees(&self, asset: Address) -> U256 {
        self.accrued_fees
            .get(&asset)
            .map(|f| *f)
            .unwrap_or(U256::ZERO)
    }

    /// Resolve `caller` against the ownership token for `position`.
    pub(crate) async fn require_owner(
        &self,
        position: &Position,
        caller: Address,
    ) -> Result<Address, EngineError> {
        let owner = self
            .ownership
            .owner_of(position.id.0)
            .await
            .map_err(EngineError::venue)?;
        if caller != owner {
            return Err(EngineError::NotOwner {
                id: position.id,
                caller,
            });
        }
        Ok(owner)
    }

    /// `amount * price / 10^feed_decimals`: the 18-decimal-normalized
    /// quote value of `amount` units of `token`.
    pub(crate) async fn price_value(
        &self,
        token: Address,
        amount: U256,
    ) -> Result<U256, EngineError> {
        let quote = self
            .oracle
            .latest_price(token)
            .await
            .map_err(EngineError::venue)?
            .ok_or(EngineError::MissingPriceFeed(token))?;
        if quote.price.is_negative() || quote.price.is_zero() {
            return Err(EngineError::NonPositivePrice(token));
        }
        wad::mul_div(amount, quote.price.into_raw(), wad::pow10(quote.decimals))
            .ok_or(EngineError::AccountingOverflow)
    }

    /// Value-preserving conversion of `amount` of `token_in` into
    /// `token_out` units, through both feeds.
    pub(crate) async fn convert(
        &self,
        token_in: Address,
        token_out: Address,
        amount: U256,
    ) -> Result<U256, EngineError> {
        if token_in == token_out || amount.is_zero() {
            return Ok(amount);
        }
        let value = self.price_value(token_in, amount).await?;
        let quote = self
            .oracle
            .latest_price(token_out)
            .await
            .map_err(EngineError::venue)?
            .ok_or(EngineError::MissingPriceFeed(token_out))?;
        if quote.price.is_negative() || quote.price.is_zero() {
            return Err(EngineError::NonPositivePrice(token_out));
        }
        wad::mul_div(value, wad::pow10(quote.decimals), quote.price.into_raw())
            .ok_or(EngineError::AccountingOverflow)
    }

    /// Health factor for given notional fields, WAD-scaled. Long
    /// positions value collateral through the oracle against
    /// borrow-asset debt; shorts hold stable-denominated collateral
    /// against oracle-valued debt.
    pub(crate) async fn health_for(
        &self,
        position: &Position,
        quantity: U256,
        cost: U256,
    ) -> Result<U256, EngineError> {
        if cost.is_zero() {
            return Ok(U256::MAX);
        }
        let (collateral_value, debt_value) = if position.meta.direction.is_long() {
            let cv = self
                .price_value(position.meta.collateral_token, quantity)
                .await?;
            (cv, cost)
        } else {
            let dv = self
                .price_value(position.meta.collateral_token, cost)
                .await?;
            (quantity, dv)
        };
        wad::health_factor_wad(collateral_value, debt_value).ok_or(EngineError::AccountingOverflow)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::position::{Direction, VenueParams};
    use crate::registry::Registry;
    use alloy::primitives::I256;
    use levengine_venue::SimVenue;

    pub const WAD_U: U256 = wad::WAD;

    pub fn addr(b: u8) -> Address {
        Address::with_last_byte(b)
    }

    pub fn admin() -> Address {
        addr(0xAD)
    }

    pub fn trader() -> Address {
        addr(0x71)
    }

    pub fn engine_account() -> Address {
        addr(0xEE)
    }

    /// Collateral-side asset (e.g. WETH).
    pub fn weth() -> Address {
        addr(0x10)
    }

    /// Borrow-side stable asset (e.g. USDC).
    pub fn usdc() -> Address {
        addr(0x20)
    }

    pub struct Harness {
        pub engine: Engine,
        pub venue: SimVenue,
    }

    /// Engine over a 1:1-priced sim venue with generous liquidity.
    /// `flash_fee_bps` is the lender's fee; most tests keep swaps
    /// fee-free so the arithmetic in assertions stays exact.
    pub fn harness(flash_fee_bps: u16) -> Harness {
        harness_with(flash_fee_bps, 0)
    }

    pub fn harness_with(flash_fee_bps: u16, swap_fee_bps: u16) -> Harness {
        let venue = SimVenue::new(engine_account(), flash_fee_bps, swap_fee_bps);
        let registry = Arc::new(Registry::new(admin()));
        for token in [weth(), usdc()] {
            registry
                .set_market(admin(), token, SimVenue::MARKET_ACCOUNT)
                .unwrap();
            registry
                .set_liquidation_threshold(admin(), token, 8_000)
                .unwrap();
            // $1.00 with 8 feed decimals.
            venue
                .oracle
                .set_price(token, I256::try_from(100_000_000i64).unwrap(), 8);
            venue.fund_venue(token, U256::from(1_000_000u64) * WAD_U);
        }
        venue.swap.set_pair(weth(), usdc(), WAD_U);
        venue.bank.mint(trader(), weth(), U256::from(1_000u64) * WAD_U);
        venue.bank.mint(trader(), usdc(), U256::from(1_000u64) * WAD_U);

        let adapters = Adapters {
            custody: venue.custody.clone(),
            ownership: venue.ownership.clone(),
            market: venue.market.clone(),
            lender: venue.lender.clone(),
            swap: venue.swap.clone(),
            oracle: venue.oracle.clone(),
        };
        let engine = Engine::new(engine_account(), registry, adapters);
        Harness { engine, venue }
    }

    pub fn open_params(direction: Direction, amount: U256, leverage: u8) -> OpenParams {
        OpenParams {
            collateral_token: weth(),
            borrow_token: usdc(),
            collateral_amount: amount,
            leverage,
            direction,
            venue: VenueParams::default(),
        }
    }
}
