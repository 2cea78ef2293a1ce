//! Reads holdings from a brokerage positions export.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// One symbol's total quantity and the other columns of its first row.
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub symbol: String,
    pub quantity: u64,
    pub metadata: BTreeMap<String, String>,
}

pub fn read_positions(path: &Path) -> Result<Vec<Holding>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open positions file: {}", path.display()))?;
    parse_positions(file).with_context(|| format!("Failed to read positions from {}", path.display()))
}

/// Parses a CSV export with at least `Symbol` and `Quantity` columns.
///
/// Reading stops at the first row without a symbol, since exports put
/// disclaimers below the holdings. Money-market sweep rows (`SPAXX**`) are
/// skipped.
pub fn parse_positions<R: Read>(input: R) -> Result<Vec<Holding>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();
    if headers.iter().all(String::is_empty) {
        bail!("No headers found");
    }
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow!("Missing required column: {name}"))
    };
    let symbol_idx = column("Symbol")?;
    let quantity_idx = column("Quantity")?;

    let mut holdings: Vec<Holding> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed CSV row {}", line + 2))?;
        let symbol = record.get(symbol_idx).unwrap_or_default().trim();
        if symbol.is_empty() {
            break;
        }
        if symbol.ends_with("**") {
            debug!("Skipping money-market row {symbol}");
            continue;
        }

        let quantity = parse_quantity(record.get(quantity_idx).unwrap_or_default())
            .with_context(|| format!("Invalid quantity for {symbol}"))?;

        if let Some(existing) = holdings.iter_mut().find(|h| h.symbol == symbol) {
            existing.quantity += quantity;
            continue;
        }

        let metadata = headers
            .iter()
            .enumerate()
            .filter(|(i, h)| *i != symbol_idx && *i != quantity_idx && !h.is_empty())
            .map(|(i, h)| (h.clone(), record.get(i).unwrap_or_default().to_string()))
            .collect();
        holdings.push(Holding {
            symbol: symbol.to_string(),
            quantity,
            metadata,
        });
    }

    if holdings.is_empty() {
        bail!("No tickers found");
    }
    debug!("Read {} holdings", holdings.len());
    Ok(holdings)
}

fn parse_quantity(raw: &str) -> Result<u64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        bail!("Quantity is missing");
    }
    if let Ok(quantity) = cleaned.parse::<u64>() {
        return Ok(quantity);
    }
    // Exports often print whole share counts as "10.000".
    let whole = match cleaned.split_once('.') {
        Some((whole, fraction)) if !fraction.is_empty() && fraction.bytes().all(|b| b == b'0') => {
            whole.parse::<u64>().ok()
        }
        _ => None,
    };
    whole.ok_or_else(|| {
        anyhow!("Invalid Quantity value: {raw:?}; quantities must be whole, non-negative numbers")
    })
}
