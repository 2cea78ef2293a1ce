//! Closed-form exchange rate table consulted by the valuation and conversion
//! steps. Rates are resolved once, before a run; lookups never block.

use crate::core::error::{RebalanceError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Price of one unit of `from` expressed in `to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub from: String,
    pub to: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateTable {
    rates: BTreeMap<(String, String), Decimal>,
}

impl RateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a direct rate. Self-referential and non-positive rates are
    /// ignored; a later rate for the same pair replaces the earlier one.
    pub fn insert(&mut self, rate: ExchangeRate) {
        if rate.from == rate.to {
            return;
        }
        if rate.rate <= Decimal::ZERO {
            warn!(
                "Ignoring non-positive exchange rate {} for {}/{}",
                rate.rate, rate.from, rate.to
            );
            return;
        }
        self.rates.insert((rate.from, rate.to), rate.rate);
    }

    /// Rate converting `from` into `to`: identity for equal currencies, the
    /// direct rate when known, otherwise the inverse of the opposite pair.
    /// No triangulation through a third currency is attempted.
    pub fn rate(&self, from: &str, to: &str) -> Result<Decimal> {
        if from == to {
            return Ok(Decimal::ONE);
        }
        if let Some(rate) = self.rates.get(&(from.to_string(), to.to_string())) {
            return Ok(*rate);
        }
        if let Some(rate) = self.rates.get(&(to.to_string(), from.to_string())) {
            return Ok(Decimal::ONE / *rate);
        }
        Err(RebalanceError::MissingRate {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    pub fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal> {
        Ok(amount * self.rate(from, to)?)
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

impl FromIterator<ExchangeRate> for RateTable {
    fn from_iter<I: IntoIterator<Item = ExchangeRate>>(iter: I) -> Self {
        let mut table = RateTable::new();
        for rate in iter {
            table.insert(rate);
        }
        table
    }
}
