//! Immutable portfolio view a rebalance run operates on.

use crate::core::error::{RebalanceError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Mapping from symbol to target percentage of total portfolio value.
pub type TargetAllocation = BTreeMap<String, Decimal>;

/// Current holding of one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: u64,
    pub price: Decimal,
    pub currency: String,
}

impl Position {
    /// Market value in the position's own currency.
    pub fn market_value(&self) -> Decimal {
        Decimal::from(self.quantity) * self.price
    }
}

/// Uninvested money held in one currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashBalance {
    pub currency: String,
    pub amount: Decimal,
}

/// Positions and cash pools of a portfolio, validated and merged.
///
/// Positions keep the order they were supplied in; a symbol supplied twice
/// is merged into its first occurrence. Cash balances are summed per
/// currency.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSnapshot {
    positions: Vec<Position>,
    cash: BTreeMap<String, Decimal>,
}

impl PortfolioSnapshot {
    pub fn new(positions: Vec<Position>, cash: Vec<CashBalance>) -> Result<Self> {
        let mut merged: Vec<Position> = Vec::with_capacity(positions.len());
        for position in positions {
            if position.price <= Decimal::ZERO {
                return Err(RebalanceError::InvalidPrice {
                    symbol: position.symbol,
                    price: position.price,
                });
            }
            match merged.iter_mut().find(|p| p.symbol == position.symbol) {
                Some(existing) => existing.quantity += position.quantity,
                None => merged.push(position),
            }
        }

        let mut pools: BTreeMap<String, Decimal> = BTreeMap::new();
        for balance in cash {
            if balance.amount.is_sign_negative() && !balance.amount.is_zero() {
                return Err(RebalanceError::NegativeCash {
                    currency: balance.currency,
                    amount: balance.amount,
                });
            }
            *pools.entry(balance.currency).or_default() += balance.amount;
        }

        Ok(Self {
            positions: merged,
            cash: pools,
        })
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    /// Cash per currency, already summed.
    pub fn cash(&self) -> &BTreeMap<String, Decimal> {
        &self.cash
    }

    /// Every currency that prices a position or holds cash.
    pub fn currencies(&self) -> BTreeSet<String> {
        self.positions
            .iter()
            .map(|p| p.currency.clone())
            .chain(self.cash.keys().cloned())
            .collect()
    }
}
