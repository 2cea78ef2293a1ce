//! Integer purchase allocation.
//!
//! A single greedy water-filling pass: every asset first asks for the whole
//! number of shares that closes its value gap, then each currency whose cash
//! cannot pay for those requests is fitted by funding assets in priority
//! order (largest value gap first, symbol as tie-break). The first asset the
//! pool cannot fully pay for is cut down to what remains, and the fit stops
//! there.

use crate::core::error::{RebalanceError, Result};
use crate::core::rates::RateTable;
use crate::core::snapshot::{PortfolioSnapshot, TargetAllocation};
use crate::core::valuation;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Solver state for one asset. Values named `*_value` and `gap` are in the
/// reference currency; `price` is in the asset's own currency.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetPlan {
    pub symbol: String,
    pub price: Decimal,
    pub currency: String,
    pub held: u64,
    pub target_pct: Decimal,
    pub current_value: Decimal,
    pub target_value: Decimal,
    pub gap: Decimal,
    /// Whole shares that would close the gap, ignoring cash limits.
    pub desired: u64,
    /// Shares actually allocated after fitting to available cash.
    pub quantity_to_buy: u64,
}

impl AssetPlan {
    pub fn cost(&self) -> Decimal {
        Decimal::from(self.quantity_to_buy) * self.price
    }

    pub fn desired_cost(&self) -> Decimal {
        Decimal::from(self.desired) * self.price
    }
}

/// A purchase the caller should place, priced in the asset's currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurchaseDecision {
    pub symbol: String,
    pub quantity_to_buy: u64,
    pub cost: Decimal,
    pub currency: String,
}

impl From<&AssetPlan> for PurchaseDecision {
    fn from(plan: &AssetPlan) -> Self {
        PurchaseDecision {
            symbol: plan.symbol.clone(),
            quantity_to_buy: plan.quantity_to_buy,
            cost: plan.cost(),
            currency: plan.currency.clone(),
        }
    }
}

/// Funding priority: furthest below target first, then symbol order.
pub fn priority(a: &AssetPlan, b: &AssetPlan) -> Ordering {
    b.gap.cmp(&a.gap).then_with(|| a.symbol.cmp(&b.symbol))
}

/// Computes target values, value gaps and the first-pass desired quantity
/// for every position in the snapshot. Held symbols without a target are
/// planned with a 0% target.
pub fn plan_assets(
    snapshot: &PortfolioSnapshot,
    targets: &TargetAllocation,
    reference: &str,
    rates: &RateTable,
    total_value: Decimal,
) -> Result<Vec<AssetPlan>> {
    if let Some(symbol) = targets.keys().find(|s| snapshot.position(s).is_none()) {
        return Err(RebalanceError::UnpricedTarget {
            symbol: symbol.clone(),
        });
    }

    let mut plans = Vec::with_capacity(snapshot.positions().len());
    for position in snapshot.positions() {
        let target_pct = match targets.get(&position.symbol) {
            Some(pct) => *pct,
            None => {
                debug!("{} has no target allocation, using 0%", position.symbol);
                Decimal::ZERO
            }
        };
        let current_value = valuation::value(position, reference, rates)?;
        let target_value = target_pct / Decimal::ONE_HUNDRED * total_value;
        let gap = target_value - current_value;

        let desired = if gap > Decimal::ZERO {
            let gap_local = rates.convert(gap, reference, &position.currency)?;
            whole_units(gap_local, position.price)
        } else {
            0
        };
        debug!(
            symbol = %position.symbol,
            %target_value,
            %gap,
            desired,
            "Planned first pass"
        );

        plans.push(AssetPlan {
            symbol: position.symbol.clone(),
            price: position.price,
            currency: position.currency.clone(),
            held: position.quantity,
            target_pct,
            current_value,
            target_value,
            gap,
            desired,
            quantity_to_buy: desired,
        });
    }
    Ok(plans)
}

/// Largest whole number of units of `price` that `amount` pays for.
fn whole_units(amount: Decimal, price: Decimal) -> u64 {
    if amount <= Decimal::ZERO {
        return 0;
    }
    let mut units = (amount / price).floor().to_u64().unwrap_or(u64::MAX);
    // Division rounds at the last digit; never let that buy one share too many.
    if units > 0 && Decimal::from(units) * price > amount {
        units -= 1;
    }
    units
}

/// Spend the first-pass requests would need in `currency`.
pub fn desired_spend(assets: &[AssetPlan], currency: &str) -> Decimal {
    assets
        .iter()
        .filter(|a| a.currency == currency)
        .map(AssetPlan::desired_cost)
        .sum()
}

/// Spend currently allocated in `currency`.
pub fn spend(assets: &[AssetPlan], currency: &str) -> Decimal {
    assets
        .iter()
        .filter(|a| a.currency == currency)
        .map(AssetPlan::cost)
        .sum()
}

/// Fits the purchases priced in `currency` to `cash` and returns the amount
/// spent. Requests are granted in full when affordable; otherwise assets
/// are funded fully in [`priority`] order until one cannot be. That asset
/// takes as many shares as the remaining cash buys and every asset after it
/// takes none.
pub fn fit_currency(assets: &mut [AssetPlan], currency: &str, cash: Decimal) -> Decimal {
    let mut order: Vec<usize> = assets
        .iter()
        .enumerate()
        .filter(|(_, a)| a.currency == currency)
        .map(|(i, _)| i)
        .collect();

    let requested = desired_spend(assets, currency);
    if requested <= cash {
        for &i in &order {
            assets[i].quantity_to_buy = assets[i].desired;
        }
        return requested;
    }

    debug!("{currency}: requests of {requested} exceed cash of {cash}, fitting");
    order.sort_by(|&a, &b| priority(&assets[a], &assets[b]));
    let mut remaining = cash;
    let mut exhausted = false;
    for &i in &order {
        let asset = &mut assets[i];
        if exhausted {
            asset.quantity_to_buy = 0;
            continue;
        }
        if asset.desired_cost() <= remaining {
            asset.quantity_to_buy = asset.desired;
        } else {
            // First asset cash cannot cover; everything after it gets nothing.
            asset.quantity_to_buy = whole_units(remaining, asset.price);
            exhausted = true;
        }
        remaining -= asset.cost();
    }
    cash - remaining
}

/// Runs [`fit_currency`] for every currency that prices an asset or holds
/// cash. Returns the spend per currency.
pub fn fit(assets: &mut [AssetPlan], cash: &BTreeMap<String, Decimal>) -> BTreeMap<String, Decimal> {
    let currencies: BTreeSet<String> = assets
        .iter()
        .map(|a| a.currency.clone())
        .chain(cash.keys().cloned())
        .collect();

    currencies
        .into_iter()
        .map(|currency| {
            let available = cash.get(&currency).copied().unwrap_or_default();
            let spent = fit_currency(assets, &currency, available);
            (currency, spent)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::snapshot::{CashBalance, Position};
    use rust_decimal_macros::dec;

    fn position(symbol: &str, quantity: u64, price: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity,
            price,
            currency: "USD".to_string(),
        }
    }

    fn usd(amount: Decimal) -> Vec<CashBalance> {
        vec![CashBalance {
            currency: "USD".to_string(),
            amount,
        }]
    }

    fn targets(entries: &[(&str, Decimal)]) -> TargetAllocation {
        entries
            .iter()
            .map(|(s, p)| (s.to_string(), *p))
            .collect()
    }

    fn solve(snapshot: &PortfolioSnapshot, targets: &TargetAllocation) -> Vec<AssetPlan> {
        let rates = RateTable::new();
        let total = valuation::total_value(snapshot, "USD", &rates).unwrap();
        let mut plans = plan_assets(snapshot, targets, "USD", &rates, total).unwrap();
        fit(&mut plans, snapshot.cash());
        plans
    }

    fn bought(plans: &[AssetPlan], symbol: &str) -> u64 {
        plans
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.quantity_to_buy)
            .unwrap()
    }

    #[test]
    fn test_even_split_fully_funded() {
        let snapshot = PortfolioSnapshot::new(
            vec![position("A", 0, dec!(10)), position("B", 0, dec!(10))],
            usd(dec!(1000)),
        )
        .unwrap();
        let plans = solve(&snapshot, &targets(&[("A", dec!(50)), ("B", dec!(50))]));

        assert_eq!(bought(&plans, "A"), 50);
        assert_eq!(bought(&plans, "B"), 50);
        assert_eq!(spend(&plans, "USD"), dec!(1000));
    }

    #[test]
    fn test_short_cash_funds_in_symbol_order_on_equal_gaps() {
        // C is worth 400 and has no target, so A and B each want 500.
        let snapshot = PortfolioSnapshot::new(
            vec![
                position("B", 0, dec!(10)),
                position("A", 0, dec!(10)),
                position("C", 40, dec!(10)),
            ],
            usd(dec!(600)),
        )
        .unwrap();
        let plans = solve(&snapshot, &targets(&[("A", dec!(50)), ("B", dec!(50))]));

        assert_eq!(bought(&plans, "A"), 50);
        assert_eq!(bought(&plans, "B"), 10);
        assert_eq!(bought(&plans, "C"), 0);
        assert_eq!(spend(&plans, "USD"), dec!(600));
    }

    #[test]
    fn test_largest_gap_is_funded_first() {
        // total 800: A wants 240 (24 shares), B wants 400 (40 shares); only 300 cash
        let snapshot = PortfolioSnapshot::new(
            vec![
                position("A", 0, dec!(10)),
                position("B", 0, dec!(10)),
                position("C", 50, dec!(10)),
            ],
            usd(dec!(300)),
        )
        .unwrap();
        let plans = solve(&snapshot, &targets(&[("A", dec!(30)), ("B", dec!(50))]));
        assert_eq!(bought(&plans, "B"), 30);
        assert_eq!(bought(&plans, "A"), 0);
        assert_eq!(spend(&plans, "USD"), dec!(300));
        assert_eq!(desired_spend(&plans, "USD"), dec!(640));
    }

    #[test]
    fn test_fit_stops_after_first_reduced_asset() {
        let snapshot = PortfolioSnapshot::new(
            vec![
                position("BIG", 0, dec!(300)),
                position("SMALL", 0, dec!(7)),
                position("HELD", 10, dec!(100)),
            ],
            usd(dec!(500)),
        )
        .unwrap();
        // total 1500: BIG wants 750 (2 shares, 600), SMALL wants 150 (21 shares, 147)
        let mut plans = solve(&snapshot, &targets(&[("BIG", dec!(50)), ("SMALL", dec!(10))]));
        assert_eq!(bought(&plans, "BIG"), 1);
        assert_eq!(bought(&plans, "SMALL"), 0);
        assert_eq!(bought(&plans, "HELD"), 0);
        assert_eq!(spend(&plans, "USD"), dec!(300));

        // Refitting with the same cash is stable.
        fit_currency(&mut plans, "USD", dec!(500));
        assert_eq!(bought(&plans, "BIG"), 1);
        assert_eq!(bought(&plans, "SMALL"), 0);

        // Once BIG is fully affordable, SMALL is cut down to the remainder.
        fit_currency(&mut plans, "USD", dec!(650));
        assert_eq!(bought(&plans, "BIG"), 2);
        assert_eq!(bought(&plans, "SMALL"), 7);
    }

    #[test]
    fn test_over_allocated_asset_buys_nothing() {
        let snapshot = PortfolioSnapshot::new(
            vec![position("A", 90, dec!(10)), position("B", 0, dec!(10))],
            usd(dec!(100)),
        )
        .unwrap();
        let plans = solve(&snapshot, &targets(&[("A", dec!(50)), ("B", dec!(50))]));
        assert!(plans.iter().find(|p| p.symbol == "A").unwrap().gap < Decimal::ZERO);
        assert_eq!(bought(&plans, "A"), 0);
        assert_eq!(bought(&plans, "B"), 10);
    }

    #[test]
    fn test_holding_without_target_uses_zero_target() {
        let snapshot = PortfolioSnapshot::new(
            vec![position("OLD", 5, dec!(20)), position("NEW", 0, dec!(10))],
            usd(dec!(100)),
        )
        .unwrap();
        let plans = solve(&snapshot, &targets(&[("NEW", dec!(100))]));
        let old = plans.iter().find(|p| p.symbol == "OLD").unwrap();
        assert_eq!(old.target_pct, Decimal::ZERO);
        assert_eq!(old.quantity_to_buy, 0);
        assert_eq!(bought(&plans, "NEW"), 10);
    }

    #[test]
    fn test_target_without_price_is_an_error() {
        let snapshot = PortfolioSnapshot::new(vec![position("A", 0, dec!(10))], usd(dec!(100))).unwrap();
        let err = plan_assets(
            &snapshot,
            &targets(&[("A", dec!(50)), ("GHOST", dec!(50))]),
            "USD",
            &RateTable::new(),
            dec!(100),
        )
        .unwrap_err();
        assert_eq!(
            err,
            RebalanceError::UnpricedTarget {
                symbol: "GHOST".to_string()
            }
        );
    }

    #[test]
    fn test_whole_units_never_overspends() {
        assert_eq!(whole_units(dec!(100), dec!(10)), 10);
        assert_eq!(whole_units(dec!(99.99), dec!(10)), 9);
        assert_eq!(whole_units(dec!(1), dec!(3)), 0);
        assert_eq!(whole_units(dec!(-5), dec!(3)), 0);
    }

    #[test]
    fn test_priority_orders_by_gap_then_symbol() {
        let snapshot = PortfolioSnapshot::new(
            vec![
                position("C", 0, dec!(10)),
                position("B", 0, dec!(10)),
                position("A", 5, dec!(10)),
            ],
            usd(dec!(100)),
        )
        .unwrap();
        let mut plans = solve(&snapshot, &targets(&[("A", dec!(40)), ("B", dec!(30)), ("C", dec!(30))]));
        plans.sort_by(priority);
        let order: Vec<_> = plans.iter().map(|p| p.symbol.as_str()).collect();
        // gaps: A 10, B 45, C 45
        assert_eq!(order, vec!["B", "C", "A"]);
    }
}
