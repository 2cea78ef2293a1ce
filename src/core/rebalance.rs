//! End-to-end rebalance run: valuation, first-pass allocation, the optional
//! conversion with its refit, and the resulting allocation report.

use crate::core::conversion::{self, CashGaps, ConversionPlan};
use crate::core::error::Result;
use crate::core::rates::RateTable;
use crate::core::snapshot::{PortfolioSnapshot, TargetAllocation};
use crate::core::solver::{self, AssetPlan, PurchaseDecision};
use crate::core::valuation;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Per-asset line of the allocation report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationReportRow {
    pub symbol: String,
    pub price: Decimal,
    pub currency: String,
    pub quantity_to_buy: u64,
    pub cost: Decimal,
    pub old_allocation_pct: Decimal,
    pub new_allocation_pct: Decimal,
    pub target_pct: Decimal,
}

impl AllocationReportRow {
    pub fn discrepancy(&self) -> Decimal {
        (self.new_allocation_pct - self.target_pct).abs()
    }
}

/// Everything a run decides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebalanceOutcome {
    pub reference_currency: String,
    pub total_value: Decimal,
    pub rows: Vec<AllocationReportRow>,
    pub largest_discrepancy: Decimal,
    pub conversion: Option<ConversionPlan>,
    /// Cash left per currency after purchases and conversion. Lists every
    /// currency of the snapshot, zero balances included.
    pub remaining_cash: BTreeMap<String, Decimal>,
}

impl RebalanceOutcome {
    pub fn purchases(&self) -> Vec<PurchaseDecision> {
        self.rows
            .iter()
            .map(|row| PurchaseDecision {
                symbol: row.symbol.clone(),
                quantity_to_buy: row.quantity_to_buy,
                cost: row.cost,
                currency: row.currency.clone(),
            })
            .collect()
    }
}

/// Computes the purchases moving `snapshot` toward `targets`.
///
/// `reference` overrides the reference currency; when `None` the currency
/// of the largest cash pool is used. The run is pure: the same inputs give
/// the same outcome.
pub fn rebalance(
    snapshot: &PortfolioSnapshot,
    targets: &TargetAllocation,
    rates: &RateTable,
    reference: Option<&str>,
) -> Result<RebalanceOutcome> {
    let reference = match reference {
        Some(currency) => currency.to_string(),
        None => valuation::reference_currency(snapshot)?,
    };
    let total_value = valuation::total_value(snapshot, &reference, rates)?;
    let old_allocation = valuation::current_allocation_pct(snapshot, &reference, rates, total_value)?;

    let mut assets = solver::plan_assets(snapshot, targets, &reference, rates, total_value)?;
    let requested: BTreeMap<String, Decimal> = snapshot
        .currencies()
        .into_iter()
        .map(|c| {
            let wanted = solver::desired_spend(&assets, &c);
            (c, wanted)
        })
        .collect();

    let mut cash = snapshot.cash().clone();
    let mut spent = solver::fit(&mut assets, &cash);

    let gaps = CashGaps::from_spend(&cash, &requested, &spent);
    let conversion = conversion::plan(&gaps, rates, &reference)?;
    if let Some(plan) = &conversion {
        *cash.entry(plan.source_currency.clone()).or_default() -= plan.source_amount;
        *cash.entry(plan.destination_currency.clone()).or_default() += plan.destination_amount;
        let destination = &plan.destination_currency;
        let refit = solver::fit_currency(&mut assets, destination, cash[destination]);
        spent.insert(destination.clone(), refit);
        info!(
            "Planned conversion of {} {} to {} {}",
            plan.source_amount, plan.source_currency, plan.destination_amount, destination
        );
    }

    let remaining_cash: BTreeMap<String, Decimal> = snapshot
        .currencies()
        .into_iter()
        .map(|c| {
            let left = cash.get(&c).copied().unwrap_or_default()
                - spent.get(&c).copied().unwrap_or_default();
            (c, left)
        })
        .collect();

    let rows = report_rows(&assets, &old_allocation, &remaining_cash, &reference, rates)?;
    let largest_discrepancy = rows
        .iter()
        .map(AllocationReportRow::discrepancy)
        .max()
        .unwrap_or_default();
    debug!("Largest discrepancy: {largest_discrepancy}%");

    Ok(RebalanceOutcome {
        reference_currency: reference,
        total_value,
        rows,
        largest_discrepancy,
        conversion,
        remaining_cash,
    })
}

fn report_rows(
    assets: &[AssetPlan],
    old_allocation: &BTreeMap<String, Decimal>,
    remaining_cash: &BTreeMap<String, Decimal>,
    reference: &str,
    rates: &RateTable,
) -> Result<Vec<AllocationReportRow>> {
    let mut new_values = Vec::with_capacity(assets.len());
    let mut new_total = Decimal::ZERO;
    for asset in assets {
        let units = Decimal::from(asset.held) + Decimal::from(asset.quantity_to_buy);
        let value = rates.convert(units * asset.price, &asset.currency, reference)?;
        new_total += value;
        new_values.push(value);
    }
    for (currency, amount) in remaining_cash {
        new_total += rates.convert(*amount, currency, reference)?;
    }

    Ok(assets
        .iter()
        .zip(new_values)
        .map(|(asset, value)| AllocationReportRow {
            symbol: asset.symbol.clone(),
            price: asset.price,
            currency: asset.currency.clone(),
            quantity_to_buy: asset.quantity_to_buy,
            cost: asset.cost(),
            old_allocation_pct: old_allocation.get(&asset.symbol).copied().unwrap_or_default(),
            new_allocation_pct: if new_total > Decimal::ZERO {
                value / new_total * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            },
            target_pct: asset.target_pct,
        })
        .collect())
}
