//! Position accounting codec.
//!
//! The ledger stores each position as two packed 256-bit words: the
//! notional word (open quantity | open cost) and the balance word
//! (trader equity | accrued protocol fees). Every field is 128 bits
//! wide; values outside that width fail with `AccountingOverflow`
//! instead of truncating. Both the loop orchestrator and the health
//! engine read through this codec, so round-trips must be lossless.

use alloy::primitives::{I256, U256};

use crate::error::EngineError;

/// Low 128-bit mask.
const MASK_128: U256 = U256::from_limbs([u64::MAX, u64::MAX, 0, 0]);

#[inline]
fn fits_u128(value: U256) -> bool {
    value & MASK_128 == value
}

/// Pack `(open_quantity, open_cost)` into one word, quantity high.
pub fn encode_notional(quantity: U256, cost: U256) -> Result<U256, EngineError> {
    if !fits_u128(quantity) || !fits_u128(cost) {
        return Err(EngineError::AccountingOverflow);
    }
    Ok((quantity << 128) | cost)
}

/// Exact inverse of [`encode_notional`].
pub fn decode_notional(word: U256) -> (U256, U256) {
    (word >> 128, word & MASK_128)
}

/// Pack `(collateral, protocol_fees)` into one word, the signed
/// collateral field high as 128-bit two's complement.
pub fn encode_balance(collateral: I256, fees: U256) -> Result<U256, EngineError> {
    if !fits_u128(fees) {
        return Err(EngineError::AccountingOverflow);
    }
    let raw = collateral.into_raw();
    // The value fits i128 iff sign-extending its low half reproduces it.
    if sign_extend(raw & MASK_128) != raw {
        return Err(EngineError::AccountingOverflow);
    }
    Ok(((raw & MASK_128) << 128) | fees)
}

/// Exact inverse of [`encode_balance`].
pub fn decode_balance(word: U256) -> (I256, U256) {
    let fees = word & MASK_128;
    let collateral = I256::from_raw(sign_extend(word >> 128));
    (collateral, fees)
}

#[inline]
fn sign_extend(low: U256) -> U256 {
    if low.bit(127) {
        low | (MASK_128 << 128)
    } else {
        low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(v: u128) -> U256 {
        U256::from(v)
    }

    #[test]
    fn test_notional_round_trip() {
        let cases = [
            (u(0), u(0)),
            (u(1), u(u128::MAX)),
            (u(u128::MAX), u(0)),
            (u(u128::MAX), u(u128::MAX)),
            (u(123_456_789), u(987_654_321)),
        ];
        for (quantity, cost) in cases {
            let word = encode_notional(quantity, cost).unwrap();
            assert_eq!(decode_notional(word), (quantity, cost));
        }
    }

    #[test]
    fn test_notional_overflow() {
        let too_big = U256::from(1u64) << 128;
        assert!(matches!(
            encode_notional(too_big, u(0)),
            Err(EngineError::AccountingOverflow)
        ));
        assert!(matches!(
            encode_notional(u(0), too_big),
            Err(EngineError::AccountingOverflow)
        ));
    }

    #[test]
    fn test_balance_round_trip() {
        let cases = [
            (I256::ZERO, u(0)),
            (I256::try_from(42i64).unwrap(), u(7)),
            (I256::try_from(-42i64).unwrap(), u(u128::MAX)),
            (I256::try_from(i128::MAX).unwrap(), u(1)),
            (I256::try_from(i128::MIN).unwrap(), u(1)),
        ];
        for (collateral, fees) in cases {
            let word = encode_balance(collateral, fees).unwrap();
            assert_eq!(decode_balance(word), (collateral, fees));
        }
    }

    #[test]
    fn test_balance_overflow() {
        let over = I256::try_from(i128::MAX).unwrap() + I256::ONE;
        assert!(matches!(
            encode_balance(over, u(0)),
            Err(EngineError::AccountingOverflow)
        ));
        let under = I256::try_from(i128::MIN).unwrap() - I256::ONE;
        assert!(matches!(
            encode_balance(under, u(0)),
            Err(EngineError::AccountingOverflow)
        ));
        let fees_over = U256::from(1u64) << 128;
        assert!(matches!(
            encode_balance(I256::ZERO, fees_over),
            Err(EngineError::AccountingOverflow)
        ));
    }
}
