//! Health factor, liquidation, and collateral adjustment.

use alloy::primitives::{Address, I256, U256};
use tracing::{error, info, instrument, warn};

use crate::error::EngineError;
use crate::events::{EngineEvent, HealthUpdated, PositionLiquidated};
use crate::position::{Position, PositionId};
use crate::wad;

use super::{Engine, LIQUIDATION_BONUS_BPS, SAFE_HEALTH_BUFFER_WAD};

impl Engine {
    /// WAD-scaled health factor for `id`. `U256::MAX` when debt-free;
    /// below `1e18` the position is eligible for liquidation.
    pub async fn health_factor(&self, id: PositionId) -> Result<U256, EngineError> {
        let position = self.ledger.get(id)?;
        self.health_for(&position, position.open_quantity, position.open_cost)
            .await
    }

    /// Liquidate an underwater position. The liquidator funds the debt
    /// repayment and receives the seized collateral including the 10%
    /// bonus (less the protocol's cut of the bonus); any residual goes
    /// back to the owner. Ledger clear and ownership burn happen as one
    /// unit with the settlement.
    #[instrument(skip(self), fields(%id, liquidator = %liquidator))]
    pub async fn liquidate(
        &self,
        liquidator: Address,
        id: PositionId,
    ) -> Result<PositionLiquidated, EngineError> {
        let lock = self.ledger.lock_for(id);
        let _guard = lock.lock().await;

        let position = self.ledger.get(id)?;
        let owner = self
            .ownership
            .owner_of(id.0)
            .await
            .map_err(EngineError::venue)?;

        let health = self
            .health_for(&position, position.open_quantity, position.open_cost)
            .await?;
        if !wad::is_underwater(health) {
            return Err(EngineError::PositionHealthy { health });
        }

        let supply_asset = position.meta.supply_asset();
        let debt_asset = position.meta.debt_asset();

        // Seized value: the repaid debt's oracle value plus the 10%
        // liquidation bonus, denominated in the supply asset.
        let repaid_value = self.price_value(debt_asset, position.open_cost).await?;
        let seized = wad::apply_basis_points_up(repaid_value, LIQUIDATION_BONUS_BPS)
            .ok_or(EngineError::AccountingOverflow)?;
        let bonus = seized - repaid_value;

        // Settlement: withdraw the whole notional first (nothing to
        // undo if it fails), then pull the repayment from the
        // liquidator and clear the debt. Each later failure restores
        // the earlier steps, so a failed liquidation leaves the
        // position and the liquidator's funds intact.
        let withdrawn = self
            .market
            .withdraw(supply_asset, position.open_quantity, self.account)
            .await
            .map_err(EngineError::venue)?;
        if let Err(e) = self
            .custody
            .transfer_in(debt_asset, liquidator, position.open_cost)
            .await
        {
            self.restore_failed_liquidation(&position, liquidator, withdrawn, U256::ZERO, U256::ZERO)
                .await;
            return Err(EngineError::venue(e));
        }
        let repaid = match self
            .market
            .repay(debt_asset, position.open_cost, self.account)
            .await
        {
            Ok(repaid) => repaid,
            Err(e) => {
                self.restore_failed_liquidation(
                    &position,
                    liquidator,
                    withdrawn,
                    position.open_cost,
                    U256::ZERO,
                )
                .await;
                return Err(EngineError::venue(e));
            }
        };

        // An underwater position may hold less than the seizable value.
        let seized_capped = if seized < withdrawn { seized } else { withdrawn };
        let fee_cut = wad::mul_div(
            bonus,
            U256::from(self.registry.protocol_fee_bps()),
            wad::BPS_DENOMINATOR,
        )
        .ok_or(EngineError::AccountingOverflow)?;
        let liquidator_payout = seized_capped.saturating_sub(fee_cut);

        if let Err(e) = self
            .custody
            .transfer_out(supply_asset, liquidator, liquidator_payout)
            .await
        {
            self.restore_failed_liquidation(&position, liquidator, withdrawn, position.open_cost, repaid)
                .await;
            return Err(EngineError::venue(e));
        }
        let residual = withdrawn - seized_capped;
        if !residual.is_zero() {
            if let Err(e) = self
                .custody
                .transfer_out(supply_asset, owner, residual)
                .await
            {
                // The liquidator's leg is already final; the residual
                // stays in the vault instead of unwinding a settled
                // repayment.
                error!(%id, owner = %owner, %residual, "failed to return liquidation residual: {e}");
            }
        }
        if !fee_cut.is_zero() {
            *self.accrued_fees.entry(supply_asset).or_default() += fee_cut;
        }

        // Atomic clear: all three ledger fields plus the ownership burn.
        self.ownership
            .burn(id.0)
            .await
            .map_err(EngineError::venue)?;
        self.ledger.delete(id)?;

        // Event fields follow the direction's accounting roles.
        let (debt_repaid, collateral_liquidated) = if position.meta.direction.is_long() {
            (position.open_cost, seized_capped)
        } else {
            (seized_capped, position.open_cost)
        };

        warn!(
            %id, owner = %owner,
            health = wad::wad_to_f64(health),
            %debt_repaid, %collateral_liquidated, %bonus,
            "position liquidated"
        );
        let record = PositionLiquidated {
            id,
            owner,
            liquidator,
            debt_repaid,
            collateral_liquidated,
            bonus,
        };
        self.events
            .record(EngineEvent::Liquidated(record.clone()));
        Ok(record)
    }

    /// Best-effort restoration after a liquidation failed part-way:
    /// reopen any repaid debt, return the liquidator's funds, and
    /// re-supply the withdrawn collateral.
    async fn restore_failed_liquidation(
        &self,
        position: &Position,
        liquidator: Address,
        withdrawn: U256,
        pulled: U256,
        repaid: U256,
    ) {
        let id = position.id;
        let supply_asset = position.meta.supply_asset();
        let debt_asset = position.meta.debt_asset();
        if !repaid.is_zero() {
            if let Err(e) = self.market.borrow(debt_asset, repaid, self.account).await {
                warn!(%id, "failed to reopen debt during liquidation rollback: {e}");
            }
        }
        if !pulled.is_zero() {
            if let Err(e) = self
                .custody
                .transfer_out(debt_asset, liquidator, pulled)
                .await
            {
                warn!(%id, "failed to refund liquidator during rollback: {e}");
            }
        }
        if !withdrawn.is_zero() {
            if let Err(e) = self
                .market
                .supply(supply_asset, withdrawn, self.account)
                .await
            {
                warn!(%id, "failed to re-supply during liquidation rollback: {e}");
            }
        }
    }

    /// Add trader equity. The amount is supplied to the market, so the
    /// notional and the stored equity rise together and adding can only
    /// improve health. Returns the recomputed health factor.
    #[instrument(skip(self), fields(%id, caller = %caller))]
    pub async fn add_collateral(
        &self,
        caller: Address,
        id: PositionId,
        amount: U256,
    ) -> Result<U256, EngineError> {
        if amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        let lock = self.ledger.lock_for(id);
        let _guard = lock.lock().await;

        let mut position = self.ledger.get(id)?;
        let owner = self.require_owner(&position, caller).await?;

        // Width checks before any external effect.
        let new_quantity = position
            .open_quantity
            .checked_add(amount)
            .ok_or(EngineError::AccountingOverflow)?;
        let new_collateral = position
            .collateral
            .checked_add(I256::from_raw(amount))
            .ok_or(EngineError::AccountingOverflow)?;
        crate::codec::encode_notional(new_quantity, position.open_cost)?;
        crate::codec::encode_balance(new_collateral, position.protocol_fees)?;

        let deposit_asset = position.meta.deposit_asset();
        self.custody
            .transfer_in(deposit_asset, caller, amount)
            .await
            .map_err(EngineError::venue)?;
        self.market
            .supply(deposit_asset, amount, self.account)
            .await
            .map_err(EngineError::venue)?;

        position.open_quantity = new_quantity;
        position.collateral = new_collateral;
        self.ledger.put(&position)?;

        let health = self
            .health_for(&position, position.open_quantity, position.open_cost)
            .await?;
        info!(%id, %amount, health = wad::wad_to_f64(health), "collateral added");
        self.events.record(EngineEvent::Health(HealthUpdated {
            id,
            owner,
            health_factor: health,
        }));
        Ok(health)
    }

    /// Remove trader equity. Rejected unless the stored equity covers
    /// `amount` and the post-removal health factor stays at or above
    /// the 1.05 safety buffer; a rejected removal changes nothing.
    /// Returns the recomputed health factor.
    #[instrument(skip(self), fields(%id, caller = %caller))]
    pub async fn remove_collateral(
        &self,
        caller: Address,
        id: PositionId,
        amount: U256,
    ) -> Result<U256, EngineError> {
        if amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        let lock = self.ledger.lock_for(id);
        let _guard = lock.lock().await;

        let mut position = self.ledger.get(id)?;
        let owner = self.require_owner(&position, caller).await?;

        if position.collateral < I256::from_raw(amount) {
            return Err(EngineError::InsufficientEquity {
                available: position.collateral,
                requested: amount,
            });
        }
        let new_quantity = position
            .open_quantity
            .checked_sub(amount)
            .ok_or(EngineError::InsufficientEquity {
                available: position.collateral,
                requested: amount,
            })?;

        // Tentative health with the reduced notional; reject below the
        // buffer with no state change.
        let health = self
            .health_for(&position, new_quantity, position.open_cost)
            .await?;
        if health < SAFE_HEALTH_BUFFER_WAD {
            return Err(EngineError::HealthBufferBreached { health });
        }

        let deposit_asset = position.meta.deposit_asset();
        self.market
            .withdraw(deposit_asset, amount, self.account)
            .await
            .map_err(EngineError::venue)?;
        self.custody
            .transfer_out(deposit_asset, owner, amount)
            .await
            .map_err(EngineError::venue)?;

        position.open_quantity = new_quantity;
        position.collateral -= I256::from_raw(amount);
        self.ledger.put(&position)?;

        info!(%id, %amount, health = wad::wad_to_f64(health), "collateral removed");
        self.events.record(EngineEvent::Health(HealthUpdated {
            id,
            owner,
            health_factor: health,
        }));
        Ok(health)
    }
}
