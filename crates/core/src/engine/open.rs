//! Position opening: the flash-loan-driven leverage loop.

use alloy::primitives::{Address, U256};
use anyhow::Result as VenueResult;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, instrument, warn};

use levengine_venue::FlashBorrower;

use crate::error::{from_venue_boundary, EngineError};
use crate::events::{EngineEvent, PositionOpened};
use crate::position::{
    derive_symbol, iterations_for_leverage, signed_equity, Direction, LoopRequest, Position,
    PositionId, PositionMeta, VenueParams,
};
use crate::wad;

use super::{Engine, LoopOutcome};

/// Inputs to `open_position`.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub collateral_token: Address,
    pub borrow_token: Address,
    /// Trader deposit, in deposit-asset units (collateral asset for
    /// longs, borrow asset for shorts).
    pub collateral_amount: U256,
    pub leverage: u8,
    pub direction: Direction,
    pub venue: VenueParams,
}

/// Flash-loan size for a target leverage multiple. Longs flash the
/// borrow asset to buy collateral; shorts flash the collateral asset to
/// establish the short, so the deposit itself also gets levered.
pub fn compute_flash_amount(
    direction: Direction,
    collateral_amount: U256,
    leverage: u8,
) -> Result<U256, EngineError> {
    let multiple = match direction {
        Direction::Long => leverage - 1,
        Direction::Short => leverage,
    };
    collateral_amount
        .checked_mul(U256::from(multiple))
        .ok_or(EngineError::AccountingOverflow)
}

/// Running totals of a loop's market effects, tracked so a failure can
/// be rolled back precisely.
#[derive(Debug, Default, Clone, Copy)]
struct LoopProgress {
    supplied: U256,
    borrowed: U256,
}

impl Engine {
    /// Open a position at `params.leverage`, converting the trader's
    /// deposit plus a flash loan into a fully collateralized borrowed
    /// position in one atomic operation. Any failure after the custody
    /// transfer unwinds the transfer and the freshly minted id; no
    /// partial ledger state is ever observable.
    #[instrument(skip(self, params), fields(owner = %owner, direction = %params.direction))]
    pub async fn open_position(
        &self,
        owner: Address,
        params: OpenParams,
    ) -> Result<PositionId, EngineError> {
        // Preconditions, all checked before any external effect.
        if params.collateral_amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        if !(2..=20).contains(&params.leverage) {
            return Err(EngineError::LeverageOutOfRange(params.leverage));
        }
        if self.registry.market(params.borrow_token).is_none() {
            return Err(EngineError::NoLendingMarket(params.borrow_token));
        }
        let threshold_bps = self
            .registry
            .liquidation_threshold_bps(params.collateral_token)
            .ok_or(EngineError::NoLiquidationThreshold(params.collateral_token))?;

        let flash_amount =
            compute_flash_amount(params.direction, params.collateral_amount, params.leverage)?;
        let iterations = iterations_for_leverage(params.leverage);

        let meta = PositionMeta {
            symbol: derive_symbol(
                params.collateral_token,
                params.borrow_token,
                params.leverage,
                params.direction,
                chrono::Utc::now().timestamp(),
            ),
            collateral_token: params.collateral_token,
            borrow_token: params.borrow_token,
            direction: params.direction,
            leverage: params.leverage,
            liquidation_threshold_bps: threshold_bps,
        };
        let deposit_asset = meta.deposit_asset();
        let loan_asset = meta.debt_asset();

        // Step 1: take custody of the deposit. Everything after this
        // point must unwind on failure.
        self.custody
            .transfer_in(deposit_asset, owner, params.collateral_amount)
            .await
            .map_err(EngineError::venue)?;

        let id = match self.ownership.mint(owner).await {
            Ok(token) => PositionId(token),
            Err(e) => {
                self.refund_deposit(owner, deposit_asset, params.collateral_amount)
                    .await;
                return Err(EngineError::venue(e));
            }
        };

        let loan_ref = self.loan_nonce.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            loan_ref,
            LoopRequest {
                id,
                owner,
                meta: meta.clone(),
                collateral_amount: params.collateral_amount,
                flash_amount,
                iterations,
                venue: params.venue,
            },
        );

        debug!(
            %id, %flash_amount, iterations, loan_ref,
            "requesting flash loan"
        );

        let loan = self
            .lender
            .flash_loan(loan_asset, flash_amount, loan_ref, self)
            .await;

        match loan {
            Ok(()) => {
                let outcome = match self.outcomes.remove(&loan_ref) {
                    Some((_, outcome)) => outcome,
                    None => {
                        self.unwind_open(id, owner, deposit_asset, params.collateral_amount, loan_ref)
                            .await;
                        return Err(EngineError::Venue(anyhow::anyhow!(
                            "flash lender returned without invoking the callback"
                        )));
                    }
                };

                let position = Position {
                    id,
                    meta,
                    open_quantity: outcome.quantity,
                    open_cost: outcome.cost,
                    collateral: signed_equity(outcome.quantity, outcome.cost),
                    protocol_fees: U256::ZERO,
                };
                if let Err(e) = self.ledger.put(&position) {
                    self.unwind_open(id, owner, deposit_asset, params.collateral_amount, loan_ref)
                        .await;
                    return Err(e);
                }

                info!(
                    %id, owner = %owner,
                    quantity = %outcome.quantity,
                    cost = %outcome.cost,
                    leverage = params.leverage,
                    "position opened"
                );
                self.events.record(EngineEvent::Opened(PositionOpened {
                    id,
                    owner,
                    collateral_token: params.collateral_token,
                    borrow_token: params.borrow_token,
                    collateral_amount: params.collateral_amount,
                    leverage: params.leverage,
                    is_long: params.direction.is_long(),
                }));
                Ok(id)
            }
            Err(e) => {
                self.unwind_open(id, owner, deposit_asset, params.collateral_amount, loan_ref)
                    .await;
                Err(from_venue_boundary(e))
            }
        }
    }

    /// Undo a failed open as one unit: drop transient state, retire the
    /// minted id, refund the deposit.
    async fn unwind_open(
        &self,
        id: PositionId,
        owner: Address,
        deposit_asset: Address,
        deposit: U256,
        loan_ref: u64,
    ) {
        self.in_flight.remove(&loan_ref);
        self.outcomes.remove(&loan_ref);
        let _ = self.ledger.delete(id);
        if let Err(e) = self.ownership.burn(id.0).await {
            warn!(%id, "failed to burn ownership token during unwind: {e}");
        }
        self.refund_deposit(owner, deposit_asset, deposit).await;
    }

    async fn refund_deposit(&self, owner: Address, asset: Address, amount: U256) {
        if let Err(e) = self.custody.transfer_out(asset, owner, amount).await {
            // Custody now holds trader funds with no ledger entry;
            // this needs operator intervention, not just a trace line.
            error!(owner = %owner, %asset, %amount, "failed to refund deposit during unwind: {e}");
        }
    }

    /// Swap with an oracle-implied minimum-output guard.
    async fn swap_checked(
        &self,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
        fee_tier: u32,
    ) -> Result<U256, EngineError> {
        let expected = self.convert(token_in, token_out, amount_in).await?;
        let min_out = wad::apply_basis_points(expected, self.registry.slippage_bps())
            .ok_or(EngineError::AccountingOverflow)?;
        let out = self
            .swap
            .exact_in(token_in, token_out, amount_in, fee_tier)
            .await
            .map_err(EngineError::venue)?;
        if out < min_out {
            return Err(EngineError::SwapShortfall { out, min_out });
        }
        Ok(out)
    }

    /// The leverage loop proper, run inside the flash callback while
    /// the borrowed funds sit in the engine account. A failed loop
    /// rolls its market effects back before the error propagates, so
    /// the deposit is refundable from custody.
    async fn run_leverage_loop(
        &self,
        req: &LoopRequest,
        flash_amount: U256,
        flash_fee: U256,
    ) -> Result<LoopOutcome, EngineError> {
        let mut progress = LoopProgress::default();
        match self
            .leverage_passes(req, flash_amount, flash_fee, &mut progress)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.rollback_passes(req, progress).await;
                Err(err)
            }
        }
    }

    /// Undo the market effects of a failed loop: settle what it
    /// borrowed with the funds still in custody, then pull back what
    /// it supplied. Best-effort; the open fails either way.
    async fn rollback_passes(&self, req: &LoopRequest, progress: LoopProgress) {
        let supply_asset = req.meta.supply_asset();
        let loan_asset = req.meta.debt_asset();
        if !progress.borrowed.is_zero() {
            if let Err(e) = self
                .market
                .repay(loan_asset, progress.borrowed, self.account)
                .await
            {
                warn!(id = %req.id, "failed to repay during loop rollback: {e}");
            }
        }
        if !progress.supplied.is_zero() {
            if let Err(e) = self
                .market
                .withdraw(supply_asset, progress.supplied, self.account)
                .await
            {
                warn!(id = %req.id, "failed to withdraw during loop rollback: {e}");
            }
        }
    }

    /// Pass 1 swaps the whole loan into the supply asset, supplies it
    /// together with the deposit, and borrows the loan plus fee back to
    /// settle the lender. Each further pass borrows the remaining
    /// shortfall toward the target notional, swaps, and re-supplies,
    /// stopping early once the shortfall is dust.
    async fn leverage_passes(
        &self,
        req: &LoopRequest,
        flash_amount: U256,
        flash_fee: U256,
        progress: &mut LoopProgress,
    ) -> Result<LoopOutcome, EngineError> {
        let supply_asset = req.meta.supply_asset();
        let loan_asset = req.meta.debt_asset();
        let fee_tier = req.venue.swap_fee_tier;

        let swapped = self
            .swap_checked(loan_asset, supply_asset, flash_amount, fee_tier)
            .await?;
        let total = swapped
            .checked_add(req.collateral_amount)
            .ok_or(EngineError::AccountingOverflow)?;

        let mut quantity = self
            .market
            .supply(supply_asset, total, self.account)
            .await
            .map_err(EngineError::venue)?;
        progress.supplied = quantity;

        let borrow_back = flash_amount
            .checked_add(flash_fee)
            .ok_or(EngineError::AccountingOverflow)?;
        self.market
            .borrow(loan_asset, borrow_back, self.account)
            .await
            .map_err(EngineError::venue)?;
        progress.borrowed = borrow_back;
        let mut cost = borrow_back;

        // Target notional in supply-asset units. A long levers the
        // deposit to `leverage` times itself; a short targets deposit
        // plus the full value of the flashed collateral asset.
        let target = match req.meta.direction {
            Direction::Long => req
                .collateral_amount
                .checked_mul(U256::from(req.meta.leverage))
                .ok_or(EngineError::AccountingOverflow)?,
            Direction::Short => {
                let loan_value = self
                    .convert(loan_asset, supply_asset, flash_amount)
                    .await?;
                req.collateral_amount
                    .checked_add(loan_value)
                    .ok_or(EngineError::AccountingOverflow)?
            }
        };
        let dust = target / wad::BPS_DENOMINATOR;

        for pass in 1..req.iterations {
            let shortfall = target.saturating_sub(quantity);
            if shortfall <= dust {
                break;
            }
            let borrow_amount = self.convert(supply_asset, loan_asset, shortfall).await?;
            if borrow_amount.is_zero() {
                break;
            }
            self.market
                .borrow(loan_asset, borrow_amount, self.account)
                .await
                .map_err(EngineError::venue)?;
            progress.borrowed = progress
                .borrowed
                .checked_add(borrow_amount)
                .ok_or(EngineError::AccountingOverflow)?;
            let out = self
                .swap_checked(loan_asset, supply_asset, borrow_amount, fee_tier)
                .await?;
            let supplied = self
                .market
                .supply(supply_asset, out, self.account)
                .await
                .map_err(EngineError::venue)?;
            progress.supplied = progress
                .supplied
                .checked_add(supplied)
                .ok_or(EngineError::AccountingOverflow)?;
            quantity = quantity
                .checked_add(supplied)
                .ok_or(EngineError::AccountingOverflow)?;
            cost = cost
                .checked_add(borrow_amount)
                .ok_or(EngineError::AccountingOverflow)?;
            debug!(
                id = %req.id, pass, %shortfall, %borrow_amount,
                "leverage convergence pass"
            );
        }

        Ok(LoopOutcome { quantity, cost })
    }
}

#[async_trait]
impl FlashBorrower for Engine {
    /// Single trusted re-entry point. Only the designated lender may
    /// call, and only with a loan reference this engine created; the
    /// request is consumed on first use so a replay fails.
    async fn on_flash_loan(
        &self,
        lender: Address,
        asset: Address,
        amount: U256,
        fee: U256,
        loan_ref: u64,
    ) -> VenueResult<()> {
        if lender != self.lender.lender_id() {
            return Err(anyhow::Error::new(EngineError::UntrustedLender(lender)));
        }
        let (_, req) = self
            .in_flight
            .remove(&loan_ref)
            .ok_or_else(|| anyhow::Error::new(EngineError::UnknownLoan(loan_ref)))?;
        if asset != req.meta.debt_asset() || amount != req.flash_amount {
            return Err(anyhow::Error::new(EngineError::UnknownLoan(loan_ref)));
        }

        let outcome = self
            .run_leverage_loop(&req, amount, fee)
            .await
            .map_err(anyhow::Error::new)?;
        self.outcomes.insert(loan_ref, outcome);
        Ok(())
    }
}
