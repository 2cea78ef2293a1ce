//! The `rebalance` command: gathers positions, cash, targets, quotes and
//! rates, runs the solver and prints the purchase report.

use super::ui;
use crate::core::config::{AppConfig, TargetSpec};
use crate::core::currency::CurrencyRateProvider;
use crate::core::positions::{self, Holding};
use crate::core::price::{PriceProvider, PriceResult};
use crate::core::rates::{ExchangeRate, RateTable};
use crate::core::rebalance::{self, RebalanceOutcome};
use crate::core::snapshot::{PortfolioSnapshot, Position, TargetAllocation};
use crate::core::targets::{self, Metadata, TargetGroup};
use anyhow::Result;
use comfy_table::Cell;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use tracing::{debug, info, warn};

/// Everything the solver and the report need, resolved up front.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub snapshot: PortfolioSnapshot,
    pub targets: TargetAllocation,
    /// Hierarchical targets in the order they were applied; empty for flat
    /// targets.
    pub groups: Vec<TargetGroup>,
    pub metadata: Metadata,
    pub rates: RateTable,
    pub reference: Option<String>,
}

pub async fn run(
    config: &AppConfig,
    price_provider: &(dyn PriceProvider + Send + Sync),
    rate_provider: &(dyn CurrencyRateProvider + Send + Sync),
) -> Result<()> {
    let holdings = positions::read_positions(&config.positions_path()?)?;
    let prepared = prepare(config, holdings, price_provider, rate_provider).await?;
    let outcome = rebalance::rebalance(
        &prepared.snapshot,
        &prepared.targets,
        &prepared.rates,
        prepared.reference.as_deref(),
    )?;
    info!(
        "Rebalanced {} assets; largest discrepancy {:.2}%",
        outcome.rows.len(),
        outcome.largest_discrepancy
    );
    print!("{}", render_report(&prepared, &outcome)?);
    Ok(())
}

pub async fn prepare(
    config: &AppConfig,
    holdings: Vec<Holding>,
    price_provider: &(dyn PriceProvider + Send + Sync),
    rate_provider: &(dyn CurrencyRateProvider + Send + Sync),
) -> Result<PreparedRun> {
    let metadata: Metadata = holdings
        .iter()
        .map(|h| (h.symbol.clone(), h.metadata.clone()))
        .collect();

    let (targets, groups) = match config.target_spec()? {
        TargetSpec::Flat(flat) => (flat, Vec::new()),
        TargetSpec::Hierarchical(groups) => {
            let resolved = targets::resolve(groups, &metadata)?;
            (resolved.flat, resolved.groups)
        }
    };

    let held: BTreeSet<&str> = holdings.iter().map(|h| h.symbol.as_str()).collect();
    let symbols: BTreeSet<&str> = held
        .iter()
        .copied()
        .chain(targets.keys().map(String::as_str))
        .collect();
    let mut quotes = fetch_prices(&symbols, price_provider).await;

    let mut positions = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let quote = match quotes.remove(*symbol) {
            Some(Ok(quote)) => quote,
            Some(Err(e)) if held.contains(symbol) => {
                return Err(e.context(format!("Failed to price holding {symbol}")));
            }
            Some(Err(e)) => {
                warn!("No price for target {}: {:#}", symbol, e);
                continue;
            }
            None => continue,
        };
        let quantity = holdings
            .iter()
            .find(|h| h.symbol == *symbol)
            .map_or(0, |h| h.quantity);
        positions.push(Position {
            symbol: symbol.to_string(),
            quantity,
            price: quote.price,
            currency: quote.currency,
        });
    }

    let snapshot = PortfolioSnapshot::new(positions, config.cash_balances()?)?;
    let reference = config.currency.as_ref().map(|c| c.trim().to_uppercase());
    let mut currencies = snapshot.currencies();
    currencies.extend(reference.clone());
    let rates = fetch_rates(&currencies, rate_provider).await;
    debug!("Resolved {} exchange rates", rates.len());

    Ok(PreparedRun {
        snapshot,
        targets,
        groups,
        metadata,
        rates,
        reference,
    })
}

async fn fetch_prices(
    symbols: &BTreeSet<&str>,
    provider: &(dyn PriceProvider + Send + Sync),
) -> BTreeMap<String, Result<PriceResult>> {
    let pb = ui::new_progress_bar(symbols.len() as u64, true);
    pb.set_message("Fetching prices...");

    let futures = symbols.iter().map(|symbol| {
        let pb = pb.clone();
        async move {
            let res = provider.fetch_price(symbol).await;
            pb.inc(1);
            (symbol.to_string(), res)
        }
    });
    let results = join_all(futures).await.into_iter().collect();
    pb.finish_and_clear();
    results
}

/// Fetches one rate per unordered pair of `currencies`. Failed pairs are
/// left out; the solver reports them only if it needs them.
async fn fetch_rates(
    currencies: &BTreeSet<String>,
    provider: &(dyn CurrencyRateProvider + Send + Sync),
) -> RateTable {
    let pairs: Vec<(&String, &String)> = currencies
        .iter()
        .enumerate()
        .flat_map(|(i, from)| currencies.iter().skip(i + 1).map(move |to| (from, to)))
        .collect();
    if pairs.is_empty() {
        return RateTable::new();
    }

    let pb = ui::new_progress_bar(pairs.len() as u64, true);
    pb.set_message("Fetching exchange rates...");
    let futures = pairs.into_iter().map(|(from, to)| {
        let pb = pb.clone();
        async move {
            let res = provider.get_rate(from, to).await;
            pb.inc(1);
            (from, to, res)
        }
    });
    let results = join_all(futures).await;
    pb.finish_and_clear();

    let mut rates = RateTable::new();
    for (from, to, res) in results {
        match res {
            Ok(rate) => rates.insert(ExchangeRate {
                from: from.clone(),
                to: to.clone(),
                rate,
            }),
            Err(e) => warn!("Failed to fetch rate {}/{}: {:#}", from, to, e),
        }
    }
    rates
}

/// Renders the category tables, the per-ticker table, the discrepancy, the
/// conversion and the remaining cash.
pub fn render_report(prepared: &PreparedRun, outcome: &RebalanceOutcome) -> Result<String> {
    let mut out = String::new();
    let reference = &outcome.reference_currency;

    for group in &prepared.groups {
        writeln!(
            out,
            "\n{}  Constraint: {:?}\n",
            ui::style_text(&group.name, ui::StyleType::Title),
            group.constraint
        )?;
        writeln!(out, "{}", category_table(group, prepared, outcome)?)?;
    }

    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Ticker"),
        ui::header_cell("Ask"),
        ui::header_cell("Quantity to buy"),
        ui::header_cell("Amount"),
        ui::header_cell("Currency"),
        ui::header_cell("Old allocation"),
        ui::header_cell("New allocation"),
        ui::header_cell("Target allocation"),
    ]);
    for row in &outcome.rows {
        table.add_row(vec![
            Cell::new(&row.symbol),
            ui::amount_cell(row.price),
            ui::quantity_cell(row.quantity_to_buy),
            ui::amount_cell(row.cost),
            Cell::new(&row.currency),
            ui::percentage_cell(row.old_allocation_pct),
            ui::percentage_cell(row.new_allocation_pct),
            ui::target_cell(row.target_pct),
        ]);
    }
    writeln!(out, "\n{table}\n")?;

    writeln!(
        out,
        "Largest discrepancy between the new and the target asset allocation is {:.2} %.",
        outcome.largest_discrepancy
    )?;

    if let Some(plan) = &outcome.conversion {
        writeln!(
            out,
            "\nBefore making the above purchases, the following currency conversion is required:"
        )?;
        writeln!(
            out,
            "    {:.2} {} to {:.2} {} at a rate of {:.4}.",
            plan.source_amount,
            plan.source_currency,
            plan.destination_amount,
            plan.destination_currency,
            plan.rate
        )?;
    }

    writeln!(out, "\n{}", ui::style_text("Remaining cash:", ui::StyleType::TotalLabel))?;
    if outcome.remaining_cash.is_empty() {
        writeln!(out, "    {}", ui::style_text("none", ui::StyleType::Subtle))?;
    }
    for (currency, amount) in &outcome.remaining_cash {
        writeln!(out, "    {:.2} {}.", amount, currency)?;
    }
    writeln!(
        out,
        "\n{} {}",
        ui::style_text(&format!("Portfolio value ({reference}):"), ui::StyleType::TotalLabel),
        ui::style_text(&format!("{:.2}", outcome.total_value), ui::StyleType::TotalValue)
    )?;
    Ok(out)
}

/// Summary of one hierarchical target: per category, the amount bought (in
/// the reference currency) and the old, new and target shares of the
/// target's scope.
fn category_table(
    group: &TargetGroup,
    prepared: &PreparedRun,
    outcome: &RebalanceOutcome,
) -> Result<comfy_table::Table> {
    let scope = targets::symbols_in_scope(group, &prepared.metadata);
    let rows: Vec<_> = outcome
        .rows
        .iter()
        .filter(|row| scope.contains(&row.symbol))
        .collect();
    let scope_old: Decimal = rows.iter().map(|r| r.old_allocation_pct).sum();
    let scope_new: Decimal = rows.iter().map(|r| r.new_allocation_pct).sum();
    let relative = |part: Decimal, whole: Decimal| {
        if whole > Decimal::ZERO {
            part / whole * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        }
    };

    let mut table = ui::new_styled_table();
    table.set_header(vec![
        ui::header_cell("Category"),
        ui::header_cell("Amount"),
        ui::header_cell("Currency"),
        ui::header_cell("Old allocation"),
        ui::header_cell("New allocation"),
        ui::header_cell("Target allocation"),
    ]);

    let column = group.column();
    for (category, target_pct) in &group.allocations {
        let mut amount = Decimal::ZERO;
        let mut old = Decimal::ZERO;
        let mut new = Decimal::ZERO;
        for row in rows.iter().filter(|row| {
            prepared
                .metadata
                .get(&row.symbol)
                .and_then(|m| m.get(column))
                == Some(category)
        }) {
            amount += prepared
                .rates
                .convert(row.cost, &row.currency, &outcome.reference_currency)?;
            old += row.old_allocation_pct;
            new += row.new_allocation_pct;
        }
        table.add_row(vec![
            Cell::new(category),
            ui::amount_cell(amount),
            Cell::new(&outcome.reference_currency),
            ui::percentage_cell(relative(old, scope_old)),
            ui::percentage_cell(relative(new, scope_new)),
            ui::target_cell(*target_pct),
        ]);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockPriceProvider;

    #[async_trait]
    impl PriceProvider for MockPriceProvider {
        async fn fetch_price(&self, symbol: &str) -> Result<PriceResult> {
            let (price, currency) = match symbol {
                "VTI" => (dec!(100), "USD"),
                "XUU" => (dec!(50), "CAD"),
                "XIC" => (dec!(25), "CAD"),
                "ZAG" => (dec!(10), "CAD"),
                _ => return Err(anyhow!("Unknown symbol: {symbol}")),
            };
            Ok(PriceResult {
                price,
                currency: currency.to_string(),
                short_name: None,
            })
        }
    }

    #[derive(Default)]
    struct MockRateProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CurrencyRateProvider for MockRateProvider {
        async fn get_rate(&self, from: &str, to: &str) -> Result<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match (from, to) {
                ("CAD", "USD") => Ok(dec!(0.8)),
                _ => Err(anyhow!("No rate for {from}/{to}")),
            }
        }
    }

    fn holding(symbol: &str, quantity: u64, class: &str, region: &str) -> Holding {
        Holding {
            symbol: symbol.to_string(),
            quantity,
            metadata: BTreeMap::from([
                ("Class".to_string(), class.to_string()),
                ("Region".to_string(), region.to_string()),
            ]),
        }
    }

    fn holdings() -> Vec<Holding> {
        vec![
            holding("VTI", 10, "Equity", "US"),
            holding("XIC", 40, "Equity", "Canada"),
            holding("ZAG", 100, "Bonds", "Canada"),
        ]
    }

    fn config(yaml: &str) -> AppConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_prepare_flat_targets_with_unheld_symbol() {
        let config = config(
            "cash_amounts: [1000]\ncash_currency: [USD]\ntargets: {VTI: 50, XUU: 30, XIC: 20}\n",
        );
        let rates = MockRateProvider::default();
        let prepared = prepare(&config, holdings(), &MockPriceProvider, &rates)
            .await
            .unwrap();

        let xuu = prepared.snapshot.position("XUU").unwrap();
        assert_eq!(xuu.quantity, 0);
        assert_eq!(xuu.currency, "CAD");
        assert_eq!(prepared.snapshot.positions().len(), 4);
        assert!(prepared.groups.is_empty());
        assert_eq!(rates.calls.load(Ordering::SeqCst), 1);
        assert_eq!(prepared.rates.rate("USD", "CAD").unwrap(), dec!(1.25));
    }

    #[tokio::test]
    async fn test_unpriced_target_is_reported_by_solver() {
        let config = config("cash_amounts: [100]\ncash_currency: [CAD]\ntargets: {GHOST: 100}\n");
        let prepared = prepare(&config, holdings(), &MockPriceProvider, &MockRateProvider::default())
            .await
            .unwrap();
        assert!(prepared.snapshot.position("GHOST").is_none());

        let err = rebalance::rebalance(
            &prepared.snapshot,
            &prepared.targets,
            &prepared.rates,
            prepared.reference.as_deref(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::core::RebalanceError::UnpricedTarget { symbol } if symbol == "GHOST"
        ));
    }

    #[tokio::test]
    async fn test_unpriced_holding_fails() {
        let config = config("targets: {VTI: 100}\n");
        let mut holdings = holdings();
        holdings.push(holding("BOGUS", 1, "Equity", "US"));
        let err = prepare(&config, holdings, &MockPriceProvider, &MockRateProvider::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("BOGUS"));
    }

    #[tokio::test]
    async fn test_report_with_hierarchical_targets() {
        let config = config(
            r#"
cash_amounts: [1000, 500]
cash_currency: [USD, CAD]
currency: USD
target_asset_alloc:
  Classes:
    Constraint: [Class]
    Equity: 80
    Bonds: 20
  Regions:
    Constraint: [Equity, Region]
    US: 50
    Canada: 50
"#,
        );
        let prepared = prepare(&config, holdings(), &MockPriceProvider, &MockRateProvider::default())
            .await
            .unwrap();
        assert_eq!(prepared.targets["VTI"], dec!(40));
        assert_eq!(prepared.targets["ZAG"], dec!(20));
        assert_eq!(prepared.groups[0].name, "Classes");

        let outcome = rebalance::rebalance(
            &prepared.snapshot,
            &prepared.targets,
            &prepared.rates,
            prepared.reference.as_deref(),
        )
        .unwrap();
        let report = console::strip_ansi_codes(&render_report(&prepared, &outcome).unwrap()).to_string();

        assert!(report.contains("Classes"));
        assert!(report.contains("Regions"));
        assert!(report.contains("Ticker"));
        assert!(report.contains("Largest discrepancy between the new and the target asset allocation is"));
        assert!(report.contains("Remaining cash:"));
        for currency in outcome.remaining_cash.keys() {
            assert!(report.contains(&format!(" {currency}.")));
        }
    }

    #[test]
    fn test_conversion_sentence() {
        let prepared = PreparedRun {
            snapshot: PortfolioSnapshot::new(vec![], vec![]).unwrap(),
            targets: TargetAllocation::new(),
            groups: Vec::new(),
            metadata: Metadata::new(),
            rates: RateTable::new(),
            reference: None,
        };
        let outcome = RebalanceOutcome {
            reference_currency: "USD".to_string(),
            total_value: dec!(2000),
            rows: Vec::new(),
            largest_discrepancy: dec!(0),
            conversion: Some(crate::core::conversion::ConversionPlan {
                source_currency: "USD".to_string(),
                source_amount: dec!(735.294117),
                destination_currency: "CAD".to_string(),
                destination_amount: dec!(1000),
                rate: dec!(1.36),
            }),
            remaining_cash: BTreeMap::from([
                ("CAD".to_string(), dec!(0)),
                ("USD".to_string(), dec!(1264.705883)),
            ]),
        };

        let report = console::strip_ansi_codes(&render_report(&prepared, &outcome).unwrap()).to_string();
        assert!(report.contains(
            "Before making the above purchases, the following currency conversion is required:\n    735.29 USD to 1000.00 CAD at a rate of 1.3600."
        ));
        assert!(report.contains("    0.00 CAD."));
        assert!(report.contains("    1264.71 USD."));
    }
}
