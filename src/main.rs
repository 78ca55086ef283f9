//! Leveraged position engine demo driver.
//!
//! Runs the engine against the in-memory simulated venue: opens a
//! leveraged long, adjusts its collateral, opens a short that a price
//! move pushes underwater, liquidates it, and closes the long out.
//! Configuration comes from a TOML registry file (`LEVENGINE_CONFIG`)
//! or built-in defaults.

use std::sync::Arc;

use alloy::primitives::{Address, I256, U256};
use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use levengine_core::{
    Adapters, Direction, Engine, EngineEvent, OpenParams, Registry, VenueParams,
};
use levengine_venue::SimVenue;

/// Environment variable names.
mod env {
    pub const CONFIG_PATH: &str = "LEVENGINE_CONFIG";
}

const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

fn addr(b: u8) -> Address {
    Address::with_last_byte(b)
}

fn wads(n: u64) -> U256 {
    U256::from(n) * WAD
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,levengine_core=debug")),
        )
        .init();

    info!("Starting leveraged position engine demo");

    let admin = addr(0xAD);
    let trader = addr(0x71);
    let liquidator = addr(0x55);
    let engine_account = addr(0xEE);
    let arb = addr(0x10);
    let usdc = addr(0x20);

    // Registry: TOML file if configured, otherwise defaults.
    let registry = match std::env::var(env::CONFIG_PATH) {
        Ok(path) => {
            info!(path, "loading registry from file");
            Arc::new(Registry::load_toml(path)?)
        }
        Err(_) => {
            let registry = Registry::new(admin);
            for token in [arb, usdc] {
                registry.set_market(admin, token, SimVenue::MARKET_ACCOUNT)?;
                registry.set_liquidation_threshold(admin, token, 8_000)?;
            }
            registry.set_protocol_fee_bps(admin, 10)?;
            Arc::new(registry)
        }
    };

    // Simulated venue: 0.09% flash fee, 0.3% swap fee, both assets
    // quoted at $1.00 on 8-decimal feeds.
    let venue = SimVenue::new(engine_account, 9, 30);
    venue.oracle.set_price(arb, I256::try_from(100_000_000i64)?, 8);
    venue.oracle.set_price(usdc, I256::try_from(100_000_000i64)?, 8);
    venue.swap.set_pair(arb, usdc, WAD);
    for token in [arb, usdc] {
        venue.fund_venue(token, wads(100_000_000));
    }
    venue.bank.mint(trader, arb, wads(10_000));
    venue.bank.mint(trader, usdc, wads(100_000));
    venue.bank.mint(liquidator, arb, wads(20_000));

    let engine = Engine::new(
        engine_account,
        registry,
        Adapters {
            custody: venue.custody.clone(),
            ownership: venue.ownership.clone(),
            market: venue.market.clone(),
            lender: venue.lender.clone(),
            swap: venue.swap.clone(),
            oracle: venue.oracle.clone(),
        },
    );

    // Open a 5x long: 1000 ARB deposit, 4000 USDC flash borrowed.
    let long = engine
        .open_position(
            trader,
            OpenParams {
                collateral_token: arb,
                borrow_token: usdc,
                collateral_amount: wads(1_000),
                leverage: 5,
                direction: Direction::Long,
                venue: VenueParams::default(),
            },
        )
        .await?;
    report_health(&engine, long).await?;

    // Top up, then take some equity back out.
    engine.add_collateral(trader, long, wads(500)).await?;
    engine.remove_collateral(trader, long, wads(250)).await?;
    report_health(&engine, long).await?;

    // A 10x short on the same pair: 1000 USDC equity against flashed
    // ARB, leaving a thin health margin.
    let short = engine
        .open_position(
            trader,
            OpenParams {
                collateral_token: arb,
                borrow_token: usdc,
                collateral_amount: wads(1_000),
                leverage: 10,
                direction: Direction::Short,
                venue: VenueParams::default(),
            },
        )
        .await?;
    report_health(&engine, short).await?;

    // ARB rips 15%; the short goes under and gets liquidated.
    venue
        .oracle
        .set_price(arb, I256::try_from(115_000_000i64)?, 8);
    report_health(&engine, short).await?;
    let record = engine.liquidate(liquidator, short).await?;
    info!(
        debt_repaid = %record.debt_repaid,
        collateral_liquidated = %record.collateral_liquidated,
        bonus = %record.bonus,
        "short liquidated"
    );

    // The long rode the move up; unwind it at the new price.
    venue
        .swap
        .set_pair(arb, usdc, WAD * U256::from(115u64) / U256::from(100u64));
    report_health(&engine, long).await?;
    let closed = engine.close_position(trader, long).await?;
    info!(returned = %closed.returned_amount, pnl = %closed.pnl, "long closed");

    for event in engine.events().drain() {
        match event {
            EngineEvent::Opened(e) => info!(?e, "event: opened"),
            EngineEvent::Closed(e) => info!(?e, "event: closed"),
            EngineEvent::Liquidated(e) => info!(?e, "event: liquidated"),
            EngineEvent::Health(e) => info!(?e, "event: health"),
        }
    }

    Ok(())
}

async fn report_health(engine: &Engine, id: levengine_core::PositionId) -> Result<()> {
    let hf = engine.health_factor(id).await?;
    if hf == U256::MAX {
        info!(%id, "health: debt-free");
    } else {
        info!(%id, health = levengine_core::wad::wad_to_f64(hf), "health");
    }
    Ok(())
}
