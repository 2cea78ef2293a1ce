//! Plans the single currency exchange of a run.

use crate::core::error::Result;
use crate::core::rates::RateTable;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// One exchange of `source_amount` of `source_currency` into
/// `destination_amount` of `destination_currency` at `rate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionPlan {
    pub source_currency: String,
    pub source_amount: Decimal,
    pub destination_currency: String,
    pub destination_amount: Decimal,
    pub rate: Decimal,
}

/// Per-currency shortfalls (requested spend above cash) and surpluses (cash
/// left after spend), each in its own currency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CashGaps {
    pub shortfalls: BTreeMap<String, Decimal>,
    pub surpluses: BTreeMap<String, Decimal>,
}

impl CashGaps {
    /// Classifies every currency of `cash` and `requested`: a currency whose
    /// requested spend exceeds its cash is short by the difference; any other
    /// currency has a surplus of cash minus what was actually spent.
    pub fn from_spend(
        cash: &BTreeMap<String, Decimal>,
        requested: &BTreeMap<String, Decimal>,
        spent: &BTreeMap<String, Decimal>,
    ) -> Self {
        let mut gaps = CashGaps::default();
        for currency in cash.keys().chain(requested.keys()) {
            let available = cash.get(currency).copied().unwrap_or_default();
            let wanted = requested.get(currency).copied().unwrap_or_default();
            if wanted > available {
                gaps.shortfalls.insert(currency.clone(), wanted - available);
            } else {
                let left = available - spent.get(currency).copied().unwrap_or_default();
                if left > Decimal::ZERO {
                    gaps.surpluses.insert(currency.clone(), left);
                }
            }
        }
        gaps
    }
}

/// Chooses at most one conversion: the largest shortfall is the destination
/// and the largest surplus the source, both compared in `reference`, ties
/// going to the lexically smallest currency. The converted amount is the
/// smaller of the shortfall and the surplus expressed in the destination
/// currency.
pub fn plan(gaps: &CashGaps, rates: &RateTable, reference: &str) -> Result<Option<ConversionPlan>> {
    let Some((destination, shortfall)) = largest(&gaps.shortfalls, rates, reference)? else {
        return Ok(None);
    };
    let Some((source, surplus)) = largest(&gaps.surpluses, rates, reference)? else {
        debug!("{destination} is short {shortfall} but no currency has a surplus");
        return Ok(None);
    };

    let rate = rates.rate(&source, &destination)?;
    let surplus_in_destination = surplus * rate;
    let (source_amount, destination_amount) = if surplus_in_destination <= shortfall {
        (surplus, surplus_in_destination)
    } else {
        ((shortfall / rate).min(surplus), shortfall)
    };

    debug!(
        "Converting {source_amount} {source} to {destination_amount} {destination} at {rate}"
    );
    Ok(Some(ConversionPlan {
        source_currency: source,
        source_amount,
        destination_currency: destination,
        destination_amount,
        rate,
    }))
}

fn largest(
    amounts: &BTreeMap<String, Decimal>,
    rates: &RateTable,
    reference: &str,
) -> Result<Option<(String, Decimal)>> {
    let mut best: Option<(&String, Decimal, Decimal)> = None;
    for (currency, amount) in amounts {
        if *amount <= Decimal::ZERO {
            continue;
        }
        let comparable = rates.convert(*amount, currency, reference)?;
        match best {
            Some((_, _, top)) if comparable <= top => {}
            _ => best = Some((currency, *amount, comparable)),
        }
    }
    Ok(best.map(|(currency, amount, _)| (currency.clone(), amount)))
}
