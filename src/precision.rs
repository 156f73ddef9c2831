//! Precision & Tier Tables — per-symbol size/price decimals and tick sizes.
//! Mission: the one place that knows how many digits a symbol is allowed.

use std::collections::HashMap;

use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::GatewayError;
use crate::symbol::Symbol;

/// Non-integer prices may carry at most this many significant digits.
pub const MAX_SIGNIFICANT_DIGITS: u32 = 5;
/// Decimal-place ceiling for perpetual instruments.
pub const MAX_DECIMALS_PERP: u32 = 6;
/// Decimal-place ceiling for spot instruments.
pub const MAX_DECIMALS_SPOT: u32 = 8;

fn max_decimals(is_perp: bool) -> u32 {
    if is_perp {
        MAX_DECIMALS_PERP
    } else {
        MAX_DECIMALS_SPOT
    }
}

/// Per-symbol size/price precision.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct PrecisionSpec {
    pub sz_decimals: u32,
    pub px_decimals: u32,
    pub is_perp: bool,
}

impl PrecisionSpec {
    /// Minimum order size and size-tick, `10^(-szDecimals)`.
    pub fn size_tick(&self) -> Decimal {
        Decimal::new(1, self.sz_decimals)
    }

    pub fn min_order_size(&self) -> Decimal {
        self.size_tick()
    }

    /// Decimal-place ceiling for price formatting per R2:
    /// `MAX_DECIMALS(isPerp) - szDecimals`.
    pub fn px_decimals_for_formatting(&self) -> u32 {
        max_decimals(self.is_perp).saturating_sub(self.sz_decimals)
    }
}

/// Per-symbol size/price precision and tick-size lookup, primeable from
/// upstream `meta` and falling back to a documented built-in seed table
/// when a symbol is unlisted.
#[derive(Debug, Clone)]
pub struct PrecisionTable {
    specs: HashMap<String, PrecisionSpec>,
    ticks: HashMap<String, Decimal>,
    default_spec: PrecisionSpec,
    default_tick: Decimal,
}

impl Default for PrecisionTable {
    fn default() -> Self {
        Self::seed()
    }
}

impl PrecisionTable {
    /// A small built-in seed so the gateway is runnable standalone without
    /// live upstream meta.
    pub fn seed() -> Self {
        let mut specs = HashMap::new();
        let mut ticks = HashMap::new();

        let entries: &[(&str, u32, u32, &str)] = &[
            ("BTC", 5, 1, "1"),
            ("ETH", 4, 2, "0.1"),
            ("SOL", 2, 4, "0.01"),
            ("DOGE", 0, 6, "0.0001"),
        ];

        for (base, sz_decimals, px_decimals, tick) in entries {
            specs.insert(
                base.to_string(),
                PrecisionSpec {
                    sz_decimals: *sz_decimals,
                    px_decimals: *px_decimals,
                    is_perp: true,
                },
            );
            ticks.insert(base.to_string(), tick.parse().expect("valid seed tick"));
        }

        Self {
            specs,
            ticks,
            default_spec: PrecisionSpec {
                sz_decimals: 2,
                px_decimals: 4,
                is_perp: true,
            },
            default_tick: Decimal::new(1, 2), // 0.01
        }
    }

    /// Prime (or re-prime) the table from an upstream meta response: a list
    /// of `(base symbol, szDecimals)` pairs. `pxDecimals` is always derived
    /// per R2 (`pxDecimalsForFormatting`), applied uniformly rather than
    /// overridden per symbol.
    pub fn prime_from_meta(&mut self, entries: impl IntoIterator<Item = (String, u32)>) {
        for (base, sz_decimals) in entries {
            let is_perp = true;
            let px_decimals = max_decimals(is_perp).saturating_sub(sz_decimals);
            self.specs.insert(
                base,
                PrecisionSpec {
                    sz_decimals,
                    px_decimals,
                    is_perp,
                },
            );
        }
    }

    pub fn get_precision(&self, symbol: &Symbol) -> PrecisionSpec {
        self.specs
            .get(symbol.base())
            .copied()
            .unwrap_or(self.default_spec)
    }

    pub fn get_tick_size(&self, symbol: &Symbol) -> Decimal {
        self.ticks
            .get(symbol.base())
            .copied()
            .unwrap_or(self.default_tick)
    }
}

/// Round `price` to the nearest multiple of `tick`, rounding half away from
/// zero (the Order Pipeline's tick-size quantization, independent of the R1
/// significant-figure rule).
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick.is_zero() {
        return price;
    }
    let units = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    units * tick
}

/// Number of digits in the integer part of `abs(d)` (at least 1, even for
/// values below 1 — `0.0012` has one integer digit, `0`).
fn integer_digit_count(d: Decimal) -> u32 {
    let mantissa = d.mantissa().unsigned_abs();
    let scale = d.scale();
    let digits = if mantissa == 0 {
        1
    } else {
        mantissa.to_string().len() as u32
    };
    if scale == 0 {
        digits.max(1)
    } else if digits > scale {
        digits - scale
    } else {
        1
    }
}

/// Truncate (toward zero) a price so it satisfies both R1 (significant
/// digits, integers exempt) and R2 (decimal-place ceiling).
pub fn format_price(price: Decimal, spec: PrecisionSpec) -> String {
    let r2_cap = spec.px_decimals_for_formatting();
    let is_integer = price.fract().is_zero();

    let decimals = if is_integer {
        r2_cap
    } else {
        let int_digits = integer_digit_count(price);
        let sig_allowed = MAX_SIGNIFICANT_DIGITS.saturating_sub(int_digits);
        r2_cap.min(sig_allowed)
    };

    let truncated = price.round_dp_with_strategy(decimals, RoundingStrategy::ToZero);
    format!("{:.*}", decimals as usize, truncated)
}

/// Format a size, rounded to nearest, with exactly `szDecimals` digits (R3).
pub fn format_size(size: Decimal, sz_decimals: u32) -> String {
    let rounded = size.round_dp_with_strategy(sz_decimals, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.*}", sz_decimals as usize, rounded)
}

/// Validate that a caller-supplied price already satisfies R1 and R2
/// (used when a user types in an explicit price, rather than one the
/// gateway synthesizes and formats itself).
pub fn validate_price(price: Decimal, spec: PrecisionSpec) -> Result<(), GatewayError> {
    if price <= Decimal::ZERO {
        return Err(GatewayError::PrecisionError(
            "price must be positive".into(),
        ));
    }
    let r2_cap = spec.px_decimals_for_formatting();
    if price.scale() > r2_cap {
        // scale() over-counts trailing zeros, so only reject once we know
        // there are genuinely more fractional digits than allowed.
        let normalized = price.normalize();
        if normalized.scale() > r2_cap {
            return Err(GatewayError::PrecisionError(format!(
                "price has more than {r2_cap} decimal places"
            )));
        }
    }
    if !price.fract().is_zero() {
        let int_digits = integer_digit_count(price);
        let sig_digits = int_digits + price.normalize().scale().min(r2_cap);
        if sig_digits > MAX_SIGNIFICANT_DIGITS {
            return Err(GatewayError::PrecisionError(format!(
                "price has more than {MAX_SIGNIFICANT_DIGITS} significant digits"
            )));
        }
    }
    Ok(())
}

/// Validate that `size` is an exact multiple of the symbol's size tick (R3).
pub fn validate_size(size: Decimal, spec: PrecisionSpec) -> Result<(), GatewayError> {
    if size <= Decimal::ZERO {
        return Err(GatewayError::PrecisionError("size must be positive".into()));
    }
    let tick = spec.size_tick();
    let units = size / tick;
    if units.fract() != Decimal::ZERO {
        return Err(GatewayError::PrecisionError(format!(
            "size is not a multiple of {tick}"
        )));
    }
    Ok(())
}
