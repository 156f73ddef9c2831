//! Liquidation Math Engine — pure, deterministic, no I/O.
//!
//! Floating point is confined to this module;
//! everywhere else in the gateway money moves through `rust_decimal`.

use rust_decimal::prelude::ToPrimitive;

use crate::order::Side;
use crate::tiers::MaintenanceScheduleTier;

const MAX_ITERATIONS: u32 = 8;
const PROBE_CONVERGENCE_EPS: f64 = 1e-8;
const RATE_CONVERGENCE_EPS: f64 = 1e-9;
const DEDUCTION_CONVERGENCE_EPS: f64 = 1e-3;
const MIN_DENOMINATOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginMode {
    Cross,
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiquidationError {
    NonFinite,
    NonPositivePrice,
    NonPositiveSize,
    NonPositiveLeverage,
    InvalidMaintenanceFraction,
    DenominatorTooSmall,
    DidNotConverge(u32),
}

impl std::fmt::Display for LiquidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiquidationError::NonFinite => write!(f, "non-finite input"),
            LiquidationError::NonPositivePrice => write!(f, "price must be positive"),
            LiquidationError::NonPositiveSize => write!(f, "size must be positive"),
            LiquidationError::NonPositiveLeverage => write!(f, "leverage must be positive"),
            LiquidationError::InvalidMaintenanceFraction => {
                write!(f, "maintenance margin fraction must be in (0,1)")
            }
            LiquidationError::DenominatorTooSmall => {
                write!(f, "solver denominator too small to converge")
            }
            LiquidationError::DidNotConverge(n) => {
                write!(f, "solver did not converge within {n} iterations")
            }
        }
    }
}

impl std::error::Error for LiquidationError {}

/// Inputs to [`solve_liquidation_price`].
/// `position_size`/`account_value`/`isolated_margin` are backfilled from
/// each other when absent (see [`resolve_position_inputs`]).
#[derive(Debug, Clone)]
pub struct LiquidationInputs<'a> {
    pub entry_price: f64,
    pub leverage: f64,
    pub side: Side,
    pub margin_mode: MarginMode,
    pub position_size: Option<f64>,
    pub account_value: Option<f64>,
    pub isolated_margin: Option<f64>,
    pub schedule: &'a [MaintenanceScheduleTier],
    pub fallback_rate: f64,
}

fn check_finite(values: &[f64]) -> Result<(), LiquidationError> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(LiquidationError::NonFinite);
    }
    Ok(())
}

/// Tier selection for a given notional: the highest-`lower_bound` tier with
/// `lower_bound <= notional`, or the fallback `(rate, deduction=0)` pair when
/// no schedule is configured.
fn tier_at(schedule: &[MaintenanceScheduleTier], notional: f64, fallback_rate: f64) -> (f64, f64) {
    if schedule.is_empty() {
        return (fallback_rate, 0.0);
    }
    let mut best = &schedule[0];
    for tier in schedule {
        let lower_bound = tier.lower_bound.to_f64().unwrap_or(f64::MAX);
        if lower_bound <= notional {
            best = tier;
        } else {
            break;
        }
    }
    let rate = best.rate.to_f64().unwrap_or(fallback_rate);
    let deduction = best.deduction.to_f64().unwrap_or(0.0);
    (rate, deduction)
}

/// Derive `position_size` and the equity figure used by the solver when the
/// caller didn't supply a position size directly. For cross mode, the
/// leverage used to size the initial-margin
/// requirement is clipped to the tier-allowed max at entry notional, not the
/// user-requested leverage.
pub fn resolve_position_inputs(
    inputs: &LiquidationInputs,
) -> Result<(f64, f64), LiquidationError> {
    check_finite(&[inputs.entry_price, inputs.leverage])?;
    if inputs.entry_price <= 0.0 {
        return Err(LiquidationError::NonPositivePrice);
    }
    if inputs.leverage <= 0.0 {
        return Err(LiquidationError::NonPositiveLeverage);
    }

    let equity_provided = match inputs.margin_mode {
        MarginMode::Cross => inputs.account_value,
        MarginMode::Isolated => inputs.isolated_margin,
    }
    .unwrap_or(0.0);

    if let Some(position_size) = inputs.position_size {
        check_finite(&[position_size])?;
        if position_size == 0.0 {
            return Err(LiquidationError::NonPositiveSize);
        }
        return Ok((position_size, equity_provided));
    }

    let equity = equity_provided;
    if equity <= 0.0 {
        return Err(LiquidationError::NonPositiveSize);
    }

    let leverage = match inputs.margin_mode {
        MarginMode::Cross => {
            let notional_estimate = equity * inputs.leverage;
            let (_, tier_max_leverage) =
                clip_leverage_to_tier(inputs.schedule, notional_estimate, inputs.leverage);
            tier_max_leverage
        }
        MarginMode::Isolated => inputs.leverage,
    };

    let notional = equity * leverage;
    let position_size = if inputs.side.is_buy() {
        notional / inputs.entry_price
    } else {
        -notional / inputs.entry_price
    };

    let initial_margin_required = notional / leverage;
    let resolved_account_value = match inputs.margin_mode {
        MarginMode::Cross => equity_provided.max(initial_margin_required),
        MarginMode::Isolated => equity_provided,
    };

    Ok((position_size, resolved_account_value))
}

/// Clip a user-requested leverage down to the tier-allowed max at the given
/// notional, returning `(effective_notional, clipped_leverage)`.
fn clip_leverage_to_tier(
    schedule: &[MaintenanceScheduleTier],
    notional_estimate: f64,
    requested_leverage: f64,
) -> (f64, f64) {
    if schedule.is_empty() {
        return (notional_estimate, requested_leverage);
    }
    // Tier tables carry a maintenance rate, not max leverage directly, but
    // rate = 1/(2*maxLeverage), so maxLeverage = 1/(2*rate).
    let (rate, _) = tier_at(schedule, notional_estimate, 1.0 / (2.0 * requested_leverage));
    if rate <= 0.0 {
        return (notional_estimate, requested_leverage);
    }
    let tier_max_leverage = 1.0 / (2.0 * rate);
    (notional_estimate, requested_leverage.min(tier_max_leverage))
}

/// Fixed-point liquidation solver.
pub fn solve_liquidation_price(inputs: &LiquidationInputs) -> Result<f64, LiquidationError> {
    check_finite(&[inputs.entry_price, inputs.leverage])?;
    if inputs.entry_price <= 0.0 {
        return Err(LiquidationError::NonPositivePrice);
    }
    if inputs.leverage <= 0.0 {
        return Err(LiquidationError::NonPositiveLeverage);
    }
    if inputs.fallback_rate <= 0.0 || inputs.fallback_rate >= 1.0 {
        return Err(LiquidationError::InvalidMaintenanceFraction);
    }

    let (position_size, equity) = resolve_position_inputs(inputs)?;
    let abs_size = position_size.abs();
    if abs_size <= 0.0 {
        return Err(LiquidationError::NonPositiveSize);
    }

    let side_multiplier = inputs.side.multiplier() as f64;

    let mut probe = inputs.entry_price;
    let mut prev_rate = f64::NAN;
    let mut prev_deduction = f64::NAN;

    for _ in 0..MAX_ITERATIONS {
        check_finite(&[probe])?;
        let notional = abs_size * probe;
        let (rate, deduction) = tier_at(inputs.schedule, notional, inputs.fallback_rate);

        let denominator = abs_size * (1.0 - rate * side_multiplier);
        if denominator.abs() < MIN_DENOMINATOR {
            return Err(LiquidationError::DenominatorTooSmall);
        }

        let numerator = abs_size * inputs.entry_price - side_multiplier * (equity + deduction);
        let next_probe = numerator / denominator;
        check_finite(&[next_probe])?;

        if next_probe <= 0.0 {
            return Ok(next_probe);
        }

        let probe_delta = (next_probe - probe).abs();
        let rate_delta = (rate - prev_rate).abs();
        let deduction_delta = (deduction - prev_deduction).abs();

        let converged = probe_delta < PROBE_CONVERGENCE_EPS
            && rate_delta < RATE_CONVERGENCE_EPS
            && deduction_delta < DEDUCTION_CONVERGENCE_EPS;

        probe = next_probe;
        prev_rate = rate;
        prev_deduction = deduction;

        if converged {
            return Ok(probe);
        }
    }

    Err(LiquidationError::DidNotConverge(MAX_ITERATIONS))
}

/// Margin-ratio-banded risk classification for UI previews. Additive
/// only; does not change the solver's contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Healthy,
    Warning,
    Danger,
    Liquidation,
}

/// Classify the current margin ratio (equity / maintenance-margin-required)
/// into a coarse risk band for a preview UI. A ratio of `1.0` or below means
/// the position is at or past its liquidation threshold.
pub fn classify_risk_level(margin_ratio: f64) -> RiskLevel {
    if margin_ratio <= 1.0 {
        RiskLevel::Liquidation
    } else if margin_ratio <= 1.25 {
        RiskLevel::Danger
    } else if margin_ratio <= 2.0 {
        RiskLevel::Warning
    } else {
        RiskLevel::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiers::{build_maintenance_schedule, MarginTier};
    use rust_decimal_macros::dec;

    fn btc_testnet_schedule() -> Vec<MaintenanceScheduleTier> {
        build_maintenance_schedule(&[
            MarginTier { lower_bound: dec!(0), max_leverage: 40 },
            MarginTier { lower_bound: dec!(150000), max_leverage: 20 },
            MarginTier { lower_bound: dec!(1000000), max_leverage: 10 },
        ])
    }

    #[test]
    fn btc_long_isolated_10x_entry_100k_matches_seed_scenario() {
        let schedule = btc_testnet_schedule();
        let inputs = LiquidationInputs {
            entry_price: 100_000.0,
            leverage: 10.0,
            side: Side::Buy,
            margin_mode: MarginMode::Isolated,
            position_size: Some(1.0),
            account_value: None,
            isolated_margin: Some(10_000.0),
            schedule: &schedule,
            fallback_rate: 0.05,
        };
        let liq = solve_liquidation_price(&inputs).unwrap();
        assert!((liq - 91_139.24).abs() < 1.0, "liq={liq}");
    }

    #[test]
    fn higher_leverage_moves_liquidation_price_closer_to_entry() {
        // Same entry/position, thinner isolated margin (higher leverage) ->
        // liquidation sits closer to the entry price for a long.
        let schedule = btc_testnet_schedule();
        let liq_10x = solve_liquidation_price(&LiquidationInputs {
            entry_price: 100_000.0,
            leverage: 10.0,
            side: Side::Buy,
            margin_mode: MarginMode::Isolated,
            position_size: Some(1.0),
            account_value: None,
            isolated_margin: Some(10_000.0),
            schedule: &schedule,
            fallback_rate: 0.05,
        })
        .unwrap();
        let liq_40x = solve_liquidation_price(&LiquidationInputs {
            entry_price: 100_000.0,
            leverage: 40.0,
            side: Side::Buy,
            margin_mode: MarginMode::Isolated,
            position_size: Some(1.0),
            account_value: None,
            isolated_margin: Some(2_500.0),
            schedule: &schedule,
            fallback_rate: 0.05,
        })
        .unwrap();
        assert!(liq_40x > liq_10x);
        assert!((liq_40x - 98_734.18).abs() < 1.0, "liq={liq_40x}");
    }

    #[test]
    fn rejects_non_positive_entry_price() {
        let schedule = btc_testnet_schedule();
        let inputs = LiquidationInputs {
            entry_price: 0.0,
            leverage: 10.0,
            side: Side::Buy,
            margin_mode: MarginMode::Isolated,
            position_size: Some(1.0),
            account_value: None,
            isolated_margin: Some(1000.0),
            schedule: &schedule,
            fallback_rate: 0.05,
        };
        assert!(matches!(
            solve_liquidation_price(&inputs),
            Err(LiquidationError::NonPositivePrice)
        ));
    }

    #[test]
    fn rejects_non_finite_leverage() {
        let schedule = btc_testnet_schedule();
        let inputs = LiquidationInputs {
            entry_price: 100.0,
            leverage: f64::NAN,
            side: Side::Buy,
            margin_mode: MarginMode::Isolated,
            position_size: Some(1.0),
            account_value: None,
            isolated_margin: Some(10.0),
            schedule: &schedule,
            fallback_rate: 0.05,
        };
        assert!(solve_liquidation_price(&inputs).is_err());
    }

    #[test]
    fn short_position_liquidates_above_entry() {
        let schedule = btc_testnet_schedule();
        let inputs = LiquidationInputs {
            entry_price: 100_000.0,
            leverage: 10.0,
            side: Side::Sell,
            margin_mode: MarginMode::Isolated,
            position_size: Some(-1.0),
            account_value: None,
            isolated_margin: Some(10_000.0),
            schedule: &schedule,
            fallback_rate: 0.05,
        };
        let liq = solve_liquidation_price(&inputs).unwrap();
        assert!(liq > 100_000.0);
    }

    #[test]
    fn classify_risk_level_bands() {
        assert_eq!(classify_risk_level(0.9), RiskLevel::Liquidation);
        assert_eq!(classify_risk_level(1.1), RiskLevel::Danger);
        assert_eq!(classify_risk_level(1.8), RiskLevel::Warning);
        assert_eq!(classify_risk_level(3.0), RiskLevel::Healthy);
    }
}
