//! Fixed-point money helpers
//!
//! Amounts are `rust_decimal::Decimal`; nothing in the engine touches `f64`
//! money. Currency is a pass-through ISO 4217 code, only its minor-unit
//! precision matters here.

use rust_decimal::{Decimal, RoundingStrategy};

/// One decimal gigabyte, the billing unit of byte metrics
pub const BYTES_PER_GB: i64 = 1_000_000_000;

/// Number of decimal places in the currency's minor unit
pub fn currency_minor_units(currency: &str) -> u32 {
    match currency.to_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
        "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
        _ => 2,
    }
}

/// Round an amount to the currency's minor unit, half away from zero
pub fn round_to_minor_units(amount: Decimal, minor_units: u32) -> Decimal {
    amount.round_dp_with_strategy(minor_units, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert a raw byte count into decimal gigabytes
pub fn bytes_to_gb(bytes: i64) -> Decimal {
    Decimal::from(bytes) / Decimal::from(BYTES_PER_GB)
}
