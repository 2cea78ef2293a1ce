//! Values positions and cash in a single reference currency.

use crate::core::error::{RebalanceError, Result};
use crate::core::rates::RateTable;
use crate::core::snapshot::{PortfolioSnapshot, Position};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

/// Market value of one position converted into `reference`.
pub fn value(position: &Position, reference: &str, rates: &RateTable) -> Result<Decimal> {
    rates.convert(position.market_value(), &position.currency, reference)
}

/// Sum of every position and every cash pool, converted into `reference`.
pub fn total_value(snapshot: &PortfolioSnapshot, reference: &str, rates: &RateTable) -> Result<Decimal> {
    let mut total = Decimal::ZERO;
    for position in snapshot.positions() {
        total += value(position, reference, rates)?;
    }
    for (currency, amount) in snapshot.cash() {
        total += rates.convert(*amount, currency, reference)?;
    }
    debug!("Total portfolio value: {total} {reference}");
    Ok(total)
}

/// Percentage of `total_value` each held symbol represents. Symbols absent
/// from the snapshot are absent from the map and read as 0%.
pub fn current_allocation_pct(
    snapshot: &PortfolioSnapshot,
    reference: &str,
    rates: &RateTable,
    total_value: Decimal,
) -> Result<BTreeMap<String, Decimal>> {
    let mut allocation = BTreeMap::new();
    for position in snapshot.positions() {
        let pct = if total_value > Decimal::ZERO {
            value(position, reference, rates)? / total_value * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        *allocation.entry(position.symbol.clone()).or_default() += pct;
    }
    Ok(allocation)
}

/// Fallback reference currency: the currency of the largest cash pool, ties
/// broken by the lexically smallest code. Without cash, the lexically
/// smallest position currency is used.
pub fn reference_currency(snapshot: &PortfolioSnapshot) -> Result<String> {
    let mut best: Option<(&String, Decimal)> = None;
    for (currency, amount) in snapshot.cash() {
        match best {
            Some((_, best_amount)) if *amount <= best_amount => {}
            _ => best = Some((currency, *amount)),
        }
    }
    if let Some((currency, _)) = best {
        return Ok(currency.clone());
    }
    snapshot
        .positions()
        .iter()
        .map(|p| &p.currency)
        .min()
        .cloned()
        .ok_or(RebalanceError::NoReferenceCurrency)
}
