//! Position close: full unwind of debt and collateral.
//!
//! Close repays the whole open cost before anything is returned; a
//! position is never torn down with debt still outstanding. The unwind
//! is checkpointed: any failure part-way through settles the ledger
//! against what the market actually holds, so a failed close leaves
//! the position consistent and retryable.

use alloy::primitives::{Address, I256, U256};
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::events::{EngineEvent, PositionClosed};
use crate::position::{signed_equity, PositionId, VenueParams};
use crate::wad;

use super::Engine;

impl Engine {
    /// Close `id` as its owner: sell just enough collateral to repay
    /// the open cost, withdraw the remainder, hand every residual back
    /// to the owner, then clear the ledger entry and retire the
    /// ownership token as one unit.
    #[instrument(skip(self), fields(%id, caller = %caller))]
    pub async fn close_position(
        &self,
        caller: Address,
        id: PositionId,
    ) -> Result<PositionClosed, EngineError> {
        let lock = self.ledger.lock_for(id);
        let _guard = lock.lock().await;

        let mut position = self.ledger.get(id)?;
        let owner = self.require_owner(&position, caller).await?;

        let supply_asset = position.meta.supply_asset();
        let debt_asset = position.meta.debt_asset();
        let fee_tier = VenueParams::default().swap_fee_tier;
        let opening_equity = position.collateral;
        let cost = position.open_cost;

        let mut leftover_debt_asset = U256::ZERO;
        if !cost.is_zero() {
            // Withdraw only the repayment leg, with slippage headroom
            // on the input side; the remainder stays supplied until
            // the debt is settled.
            let needed_in = self.convert(debt_asset, supply_asset, cost).await?;
            let padded = wad::apply_basis_points_up(needed_in, self.registry.slippage_bps())
                .ok_or(EngineError::AccountingOverflow)?;
            let sold = if padded < position.open_quantity {
                padded
            } else {
                position.open_quantity
            };
            self.market
                .withdraw(supply_asset, sold, self.account)
                .await
                .map_err(EngineError::venue)?;

            let out = match self
                .swap
                .exact_in(supply_asset, debt_asset, sold, fee_tier)
                .await
            {
                Ok(out) => out,
                Err(e) => {
                    // Input not consumed: put it back so the ledger
                    // and the market keep agreeing.
                    self.resupply_after_failed_close(id, supply_asset, sold).await;
                    return Err(EngineError::venue(e));
                }
            };

            // Commit the deleverage before anything else can fail; the
            // ledger must match the market even when the close cannot
            // finish, so a retry never double-withdraws.
            let repay_target = if out < cost { out } else { cost };
            let repay_result = self
                .market
                .repay(debt_asset, repay_target, self.account)
                .await;
            position.open_quantity -= sold;
            if let Ok(repaid) = &repay_result {
                position.open_cost -= *repaid;
            }
            position.collateral = signed_equity(position.open_quantity, position.open_cost);
            self.ledger.put(&position)?;

            if let Err(e) = repay_result {
                return Err(EngineError::venue(e));
            }
            if out < cost {
                return Err(EngineError::SwapShortfall { out, min_out: cost });
            }
            leftover_debt_asset = out - cost;
        }

        // Residuals: the remaining supplied collateral plus swap
        // change, both to the owner. The returned figure is
        // deposit-asset denominated.
        let residual_supply = position.open_quantity;
        if !residual_supply.is_zero() {
            self.market
                .withdraw(supply_asset, residual_supply, self.account)
                .await
                .map_err(EngineError::venue)?;
            self.custody
                .transfer_out(supply_asset, owner, residual_supply)
                .await
                .map_err(EngineError::venue)?;
        }
        if !leftover_debt_asset.is_zero() {
            self.custody
                .transfer_out(debt_asset, owner, leftover_debt_asset)
                .await
                .map_err(EngineError::venue)?;
        }
        let returned_amount = residual_supply
            .checked_add(
                self.convert(debt_asset, supply_asset, leftover_debt_asset)
                    .await?,
            )
            .ok_or(EngineError::AccountingOverflow)?;

        let pnl = I256::from_raw(returned_amount)
            .checked_sub(opening_equity)
            .ok_or(EngineError::AccountingOverflow)?;

        // Atomic teardown: ownership burn plus full ledger clear.
        self.ownership
            .burn(id.0)
            .await
            .map_err(EngineError::venue)?;
        self.ledger.delete(id)?;

        info!(
            %id, owner = %owner, %returned_amount, %pnl,
            "position closed"
        );
        let record = PositionClosed {
            id,
            owner,
            returned_amount,
            pnl,
        };
        self.events.record(EngineEvent::Closed(record.clone()));
        Ok(record)
    }

    async fn resupply_after_failed_close(&self, id: PositionId, asset: Address, amount: U256) {
        if let Err(e) = self.market.supply(asset, amount, self.account).await {
            warn!(%id, %amount, "failed to re-supply after aborted close: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::*;
    use crate::position::Direction;
    use levengine_venue::Ownership;

    #[tokio::test]
    async fn test_close_unwinds_debt_and_returns_residual() {
        let h = harness(0);
        let id = h
            .engine
            .open_position(trader(), open_params(Direction::Long, WAD_U, 4))
            .await
            .unwrap();
        let weth_before = h.venue.bank.balance_of(trader(), weth());

        let record = h.engine.close_position(trader(), id).await.unwrap();

        // Debt fully repaid, nothing supplied, ledger and token gone.
        assert_eq!(
            h.venue.market.debt_of(engine_account(), usdc()),
            U256::ZERO
        );
        assert_eq!(
            h.venue.market.supplied_of(engine_account(), weth()),
            U256::ZERO
        );
        assert!(!h.engine.ledger().contains(id));
        assert!(h.venue.ownership.owner_of(id.0).await.is_err());

        // At par with no fees the trader gets the whole equity back:
        // sold = 3 * 1.01 headroom = 3.03, residual 0.97, change 0.03.
        assert_eq!(record.returned_amount, WAD_U);
        assert_eq!(record.pnl, alloy::primitives::I256::ZERO);
        assert_eq!(
            h.venue.bank.balance_of(trader(), weth()) - weth_before,
            WAD_U - U256::from(3u64) * WAD_U / U256::from(100u64)
        );
        assert_eq!(
            h.venue.bank.balance_of(trader(), usdc()),
            U256::from(1_000u64) * WAD_U + U256::from(3u64) * WAD_U / U256::from(100u64)
        );
    }

    #[tokio::test]
    async fn test_close_realizes_price_gain() {
        let h = harness(0);
        let id = h
            .engine
            .open_position(trader(), open_params(Direction::Long, WAD_U, 2))
            .await
            .unwrap();

        // Collateral appreciates 25%: 2 WETH now worth 2.5 USDC, debt 1.
        h.venue
            .oracle
            .set_price(weth(), alloy::primitives::I256::try_from(125_000_000i64).unwrap(), 8);
        h.venue
            .swap
            .set_pair(weth(), usdc(), WAD_U * U256::from(125u64) / U256::from(100u64));

        let record = h.engine.close_position(trader(), id).await.unwrap();
        assert!(record.pnl > alloy::primitives::I256::ZERO);
        assert!(record.returned_amount > WAD_U);
    }

    #[tokio::test]
    async fn test_close_owner_only() {
        let h = harness(0);
        let id = h
            .engine
            .open_position(trader(), open_params(Direction::Long, WAD_U, 2))
            .await
            .unwrap();
        let err = h
            .engine
            .close_position(addr(0x44), id)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotOwner { .. }));
        assert!(h.engine.ledger().contains(id));
    }

    #[tokio::test]
    async fn test_close_unknown_position() {
        let h = harness(0);
        let err = h
            .engine
            .close_position(trader(), crate::position::PositionId(99))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownPosition(_)));
    }

    #[tokio::test]
    async fn test_close_short_round_trip() {
        let h = harness(0);
        let id = h
            .engine
            .open_position(trader(), open_params(Direction::Short, WAD_U, 3))
            .await
            .unwrap();
        let record = h.engine.close_position(trader(), id).await.unwrap();

        // Flat market: the short returns its equity, zero pnl.
        assert_eq!(record.returned_amount, WAD_U);
        assert_eq!(record.pnl, alloy::primitives::I256::ZERO);
        assert_eq!(
            h.venue.market.debt_of(engine_account(), weth()),
            U256::ZERO
        );
    }

    #[tokio::test]
    async fn test_failed_close_keeps_ledger_and_market_consistent() {
        let h = harness(0);
        let id = h
            .engine
            .open_position(trader(), open_params(Direction::Long, WAD_U, 4))
            .await
            .unwrap();

        // Venue slips 5% below the oracle: the repayment swap cannot
        // cover the whole debt.
        h.venue
            .swap
            .set_pair(weth(), usdc(), WAD_U * U256::from(95u64) / U256::from(100u64));
        let err = h.engine.close_position(trader(), id).await.unwrap_err();
        assert!(matches!(err, EngineError::SwapShortfall { .. }));

        // The partial deleverage is committed: ledger and market agree
        // on both legs, and the equity invariant holds.
        let pos = h.engine.ledger().get(id).unwrap();
        assert_eq!(
            h.venue.market.supplied_of(engine_account(), weth()),
            pos.open_quantity
        );
        assert_eq!(
            h.venue.market.debt_of(engine_account(), usdc()),
            pos.open_cost
        );
        assert_eq!(
            pos.collateral,
            signed_equity(pos.open_quantity, pos.open_cost)
        );
        assert!(pos.open_cost < U256::from(3u64) * WAD_U);

        // With the venue back at par the retry completes cleanly.
        h.venue.swap.set_pair(weth(), usdc(), WAD_U);
        h.engine.close_position(trader(), id).await.unwrap();
        assert!(!h.engine.ledger().contains(id));
        assert_eq!(
            h.venue.market.debt_of(engine_account(), usdc()),
            U256::ZERO
        );
        assert_eq!(
            h.venue.market.supplied_of(engine_account(), weth()),
            U256::ZERO
        );
    }
}
