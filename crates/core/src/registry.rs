//! Process-wide engine configuration: market-per-asset mapping,
//! per-asset liquidation thresholds, protocol fee, and slippage
//! tolerance. Set once at startup from TOML, mutable afterwards only
//! through admin-gated setters; absent entries read as "unsupported".

use alloy::primitives::Address;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::EngineError;

/// Upper bound for liquidation thresholds: 95%.
pub const MAX_LIQUIDATION_THRESHOLD_BPS: u16 = 9_500;

/// Upper bound for the protocol fee: 1%.
pub const MAX_PROTOCOL_FEE_BPS: u16 = 100;

/// Raw TOML shape.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Admin capability holder (hex address).
    pub admin: String,
    /// Protocol fee in basis points, 0..=100.
    #[serde(default)]
    pub protocol_fee_bps: u16,
    /// Swap slippage tolerance in basis points.
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    /// Per-asset configuration.
    #[serde(default)]
    pub assets: Vec<AssetEntry>,
}

fn default_slippage_bps() -> u16 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetEntry {
    /// Token address (hex).
    pub token: String,
    /// Lending market handling this asset (hex), if borrowable.
    pub market: Option<String>,
    /// Liquidation threshold in basis points, (0, 9500].
    pub liquidation_threshold_bps: Option<u16>,
}

#[derive(Debug, Default)]
struct RegistryState {
    markets: HashMap<Address, Address>,
    thresholds: HashMap<Address, u16>,
    protocol_fee_bps: u16,
    slippage_bps: u16,
}

/// Admin-gated configuration registry shared by the orchestrator and
/// the health engine.
#[derive(Debug)]
pub struct Registry {
    admin: Address,
    state: RwLock<RegistryState>,
}

fn parse_address(s: &str) -> Result<Address, EngineError> {
    Address::from_str(s.trim())
        .map_err(|e| EngineError::InvalidConfig(format!("invalid address {s:?}: {e}")))
}

impl Registry {
    pub fn new(admin: Address) -> Self {
        Self {
            admin,
            state: RwLock::new(RegistryState {
                slippage_bps: default_slippage_bps(),
                ..RegistryState::default()
            }),
        }
    }

    /// Build and validate a registry from its TOML shape.
    pub fn from_config(config: &RegistryConfig) -> Result<Self, EngineError> {
        let admin = parse_address(&config.admin)?;
        let registry = Self::new(admin);
        registry.set_protocol_fee_bps(admin, config.protocol_fee_bps)?;
        registry.set_slippage_bps(admin, config.slippage_bps)?;

        for entry in &config.assets {
            let token = parse_address(&entry.token)?;
            if let Some(market) = &entry.market {
                registry.set_market(admin, token, parse_address(market)?)?;
            }
            if let Some(bps) = entry.liquidation_threshold_bps {
                registry.set_liquidation_threshold(admin, token, bps)?;
            }
        }

        info!(
            assets = config.assets.len(),
            protocol_fee_bps = config.protocol_fee_bps,
            "registry configured"
        );
        Ok(registry)
    }

    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::InvalidConfig(format!("read {}: {e}", path.as_ref().display()))
        })?;
        let config: RegistryConfig = toml::from_str(&text)
            .map_err(|e| EngineError::InvalidConfig(format!("parse config: {e}")))?;
        Self::from_config(&config)
    }

    pub fn admin(&self) -> Address {
        self.admin
    }

    fn require_admin(&self, caller: Address) -> Result<(), EngineError> {
        if caller != self.admin {
            return Err(EngineError::NotAdmin(caller));
        }
        Ok(())
    }

    // --- reads ---

    pub fn market(&self, asset: Address) -> Option<Address> {
        self.state.read().markets.get(&asset).copied()
    }

    pub fn liquidation_threshold_bps(&self, asset: Address) -> Option<u16> {
        self.state.read().thresholds.get(&asset).copied()
    }

    pub fn protocol_fee_bps(&self) -> u16 {
        self.state.read().protocol_fee_bps
    }

    pub fn slippage_bps(&self) -> u16 {
        self.state.read().slippage_bps
    }

    // --- admin-gated writes ---

    pub fn set_market(
        &self,
        caller: Address,
        asset: Address,
        market: Address,
    ) -> Result<(), EngineError> {
        self.require_admin(caller)?;
        self.state.write().markets.insert(asset, market);
        Ok(())
    }

    pub fn set_liquidation_threshold(
        &self,
        caller: Address,
        asset: Address,
        bps: u16,
    ) -> Result<(), EngineError> {
        self.require_admin(caller)?;
        if bps == 0 || bps > MAX_LIQUIDATION_THRESHOLD_BPS {
            return Err(EngineError::InvalidThreshold(bps));
        }
        self.state.write().thresholds.insert(asset, bps);
        Ok(())
    }

    pub fn set_protocol_fee_bps(&self, caller: Address, bps: u16) -> Result<(), EngineError> {
        self.require_admin(caller)?;
        if bps > MAX_PROTOCOL_FEE_BPS {
            return Err(EngineError::InvalidFee(bps));
        }
        self.state.write().protocol_fee_bps = bps;
        Ok(())
    }

    pub fn set_slippage_bps(&self, caller: Address, bps: u16) -> Result<(), EngineError> {
        self.require_admin(caller)?;
        self.state.write().slippage_bps = bps;
        Ok(())
    }
}
