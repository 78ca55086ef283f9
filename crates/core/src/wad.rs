//! Fixed-point U256 arithmetic for position accounting.
//!
//! All health and valuation math runs on 18-decimal WAD integers; f64
//! only ever appears in logs. Overflow surfaces as `None` from the
//! checked helpers and is mapped to `AccountingOverflow` by callers.

use alloy::primitives::U256;

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%).
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

/// Pre-computed powers of 10 for fast decimal conversion.
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Fast power of 10 lookup (up to 10^38).
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if exp < 39 {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

/// `value * numerator / denominator` with full-width overflow checking.
#[inline(always)]
pub fn mul_div(value: U256, numerator: U256, denominator: U256) -> Option<U256> {
    if denominator.is_zero() {
        return None;
    }
    value
        .checked_mul(numerator)
        .map(|product| product / denominator)
}

/// Apply basis points reduction: `value * (10000 - bps) / 10000`.
///
/// Example: apply_basis_points(1000, 100) = 990 (1% reduction)
#[inline(always)]
pub fn apply_basis_points(value: U256, basis_points: u16) -> Option<U256> {
    let factor = U256::from(10_000u16.saturating_sub(basis_points));
    mul_div(value, factor, BPS_DENOMINATOR)
}

/// Apply basis points increase: `value * (10000 + bps) / 10000`.
///
/// Example: apply_basis_points_up(1000, 1000) = 1100 (10% increase)
#[inline(always)]
pub fn apply_basis_points_up(value: U256, basis_points: u16) -> Option<U256> {
    let factor = U256::from(10_000u32 + basis_points as u32);
    mul_div(value, factor, BPS_DENOMINATOR)
}

/// Health factor in WAD: `collateral_value * 1e18 / debt_value`.
///
/// Returns `U256::MAX` when debt is zero: a debt-free position is
/// maximally healthy by definition.
#[inline(always)]
pub fn health_factor_wad(collateral_value: U256, debt_value: U256) -> Option<U256> {
    if debt_value.is_zero() {
        return Some(U256::MAX);
    }
    mul_div(collateral_value, WAD, debt_value)
}

/// Check if a WAD health factor marks the position liquidatable.
#[inline(always)]
pub fn is_underwater(hf_wad: U256) -> bool {
    hf_wad < WAD
}

/// Convert WAD to f64 for display and logging only.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        let limbs = wad.as_limbs();
        let high = limbs[1] as f64 * (u64::MAX as f64 + 1.0);
        let low = limbs[0] as f64;
        (high + low) / 1e18
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow10_lookup() {
        assert_eq!(pow10(0), U256::from(1u64));
        assert_eq!(pow10(8), U256::from(100_000_000u64));
        assert_eq!(pow10(18), WAD);
    }

    #[test]
    fn test_apply_basis_points() {
        let value = U256::from(1000u64);
        assert_eq!(apply_basis_points(value, 100), Some(U256::from(990u64)));
        assert_eq!(apply_basis_points(value, 0), Some(value));
        assert_eq!(
            apply_basis_points_up(value, 1000),
            Some(U256::from(1100u64))
        );
    }

    #[test]
    fn test_health_factor_wad() {
        // 1000 collateral vs 500 debt => HF 2.0
        let hf = health_factor_wad(U256::from(1000u64) * WAD, U256::from(500u64) * WAD);
        assert_eq!(hf, Some(U256::from(2u64) * WAD));

        // Debt-free => maximum
        assert_eq!(health_factor_wad(U256::ZERO, U256::ZERO), Some(U256::MAX));
    }

    #[test]
    fn test_is_underwater() {
        let hf_low = WAD * U256::from(9u64) / U256::from(10u64);
        assert!(is_underwater(hf_low));
        assert!(!is_underwater(WAD));
    }

    #[test]
    fn test_mul_div_overflow() {
        assert_eq!(mul_div(U256::MAX, U256::from(2u64), U256::from(1u64)), None);
        assert_eq!(mul_div(WAD, WAD, U256::ZERO), None);
    }

    #[test]
    fn test_wad_to_f64() {
        let wad = U256::from(1500u64) * WAD / U256::from(1000u64);
        assert!((wad_to_f64(wad) - 1.5).abs() < 1e-9);
    }
}
