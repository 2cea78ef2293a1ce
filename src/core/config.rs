use crate::core::snapshot::{CashBalance, TargetAllocation};
use crate::core::targets::{self, TargetGroup};
use anyhow::{Context, Result, bail, ensure};
use directories::ProjectDirs;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::fs;
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct YahooProviderConfig {
    pub base_url: String,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_retries() -> usize {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for YahooProviderConfig {
    fn default() -> Self {
        YahooProviderConfig {
            base_url: "https://query1.finance.yahoo.com".to_string(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub yahoo: YahooProviderConfig,
}

/// A price entered by hand, used instead of a fetched quote.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QuoteOverride {
    pub price: Decimal,
    pub currency: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RateOverride {
    pub from: String,
    pub to: String,
    pub rate: Decimal,
}

/// Where the target percentages come from.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetSpec {
    Flat(TargetAllocation),
    Hierarchical(Vec<TargetGroup>),
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(alias = "csv_path", alias = "positions_path")]
    pub positions_csv: Option<String>,
    #[serde(alias = "chash_amounts")]
    pub cash_amounts: Option<Vec<Decimal>>,
    pub cash_currency: Option<Vec<String>>,
    /// Reference currency; defaults to the currency of the largest cash
    /// balance.
    pub currency: Option<String>,
    pub targets: Option<TargetAllocation>,
    pub target_asset_alloc: Option<serde_yaml::Mapping>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub quotes: BTreeMap<String, QuoteOverride>,
    #[serde(default)]
    pub rates: Vec<RateOverride>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "rebal").context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cash_balances()?;
        self.target_spec()?;
        for (symbol, quote) in &self.quotes {
            ensure!(
                quote.price > Decimal::ZERO,
                "Quote override for {symbol} must have a positive price"
            );
        }
        Ok(())
    }

    /// Positions export path; relative paths resolve against the directory
    /// holding the config file.
    pub fn positions_path(&self) -> Result<PathBuf> {
        let Some(raw) = self.positions_csv.as_deref().filter(|p| !p.trim().is_empty()) else {
            bail!("Config must define a CSV path under one of: positions_csv, csv_path, positions_path");
        };
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            return Ok(path);
        }
        Ok(match &self.base_dir {
            Some(dir) => dir.join(path),
            None => path,
        })
    }

    pub fn cash_balances(&self) -> Result<Vec<CashBalance>> {
        let (amounts, currencies) = match (&self.cash_amounts, &self.cash_currency) {
            (None, None) => return Ok(Vec::new()),
            (Some(amounts), Some(currencies)) => (amounts, currencies),
            _ => bail!("Both cash_amounts (or chash_amounts) and cash_currency must be provided"),
        };
        ensure!(
            amounts.len() == currencies.len(),
            "cash_amounts has {} entries but cash_currency has {}",
            amounts.len(),
            currencies.len()
        );
        Ok(amounts
            .iter()
            .zip(currencies)
            .map(|(amount, currency)| CashBalance {
                currency: currency.trim().to_uppercase(),
                amount: *amount,
            })
            .collect())
    }

    pub fn target_spec(&self) -> Result<TargetSpec> {
        match (&self.targets, &self.target_asset_alloc) {
            (Some(flat), None) => {
                if let Some((symbol, pct)) = flat.iter().find(|(_, pct)| **pct < Decimal::ZERO) {
                    bail!("Target for {symbol} is negative: {pct}");
                }
                Ok(TargetSpec::Flat(flat.clone()))
            }
            (None, Some(raw)) => Ok(TargetSpec::Hierarchical(targets::parse_groups(raw)?)),
            (Some(_), Some(_)) => bail!("Config must define only one of targets, target_asset_alloc"),
            (None, None) => bail!("Config must define targets or target_asset_alloc"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> AppConfig {
        serde_yaml::from_str(yaml).expect("Failed to deserialize")
    }

    #[test]
    fn test_config_deserialization() {
        let config = parse(
            r#"
positions_csv: positions.csv
cash_amounts: [1500.50, 200]
cash_currency: [usd, CAD]
currency: USD
targets:
  VTI: 60
  XIC: 40
quotes:
  XIC:
    price: 35.10
    currency: CAD
rates:
  - from: USD
    to: CAD
    rate: 1.36
"#,
        );

        assert_eq!(config.currency.as_deref(), Some("USD"));
        assert_eq!(
            config.cash_balances().unwrap(),
            vec![
                CashBalance {
                    currency: "USD".to_string(),
                    amount: dec!(1500.50)
                },
                CashBalance {
                    currency: "CAD".to_string(),
                    amount: dec!(200)
                },
            ]
        );
        let TargetSpec::Flat(targets) = config.target_spec().unwrap() else {
            panic!("Expected flat targets");
        };
        assert_eq!(targets["VTI"], dec!(60));
        assert_eq!(config.quotes["XIC"].price, dec!(35.10));
        assert_eq!(config.rates[0].rate, dec!(1.36));
        assert_eq!(config.providers, ProvidersConfig::default());
        assert_eq!(config.providers.yahoo.retries, 2);
    }

    #[test]
    fn test_aliases() {
        let config = parse(
            r#"
csv_path: export.csv
chash_amounts: [10]
cash_currency: [EUR]
targets: {A: 100}
providers:
  yahoo:
    base_url: "http://example.com/yahoo"
"#,
        );
        assert_eq!(config.positions_path().unwrap(), PathBuf::from("export.csv"));
        assert_eq!(config.cash_balances().unwrap()[0].amount, dec!(10));
        assert_eq!(config.providers.yahoo.base_url, "http://example.com/yahoo");
        assert_eq!(config.providers.yahoo.retry_delay_ms, 500);
    }

    #[test]
    fn test_cash_lists_must_pair_up() {
        let one_sided = parse("cash_amounts: [10]\ntargets: {A: 100}\n");
        assert!(one_sided.cash_balances().is_err());

        let uneven = parse("cash_amounts: [10, 20]\ncash_currency: [USD]\ntargets: {A: 100}\n");
        assert!(uneven.cash_balances().is_err());

        let none = parse("targets: {A: 100}\n");
        assert!(none.cash_balances().unwrap().is_empty());
    }

    #[test]
    fn test_exactly_one_target_kind() {
        assert!(parse("positions_csv: p.csv\n").target_spec().is_err());

        let both = parse(
            "targets: {A: 100}\ntarget_asset_alloc:\n  Classes:\n    Constraint: [Class]\n    Equity: 100\n",
        );
        assert!(both.target_spec().is_err());

        let negative = parse("targets: {A: -5}\n");
        assert!(negative.target_spec().is_err());

        let nested = parse("target_asset_alloc:\n  Classes:\n    Constraint: [Class]\n    Equity: 100\n");
        assert!(matches!(
            nested.target_spec().unwrap(),
            TargetSpec::Hierarchical(groups) if groups.len() == 1
        ));
    }

    #[test]
    fn test_load_from_path_resolves_relative_csv() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");
        let mut file = fs::File::create(&config_path).unwrap();
        writeln!(file, "positions_csv: exports/positions.csv\ntargets: {{VTI: 100}}").unwrap();

        let config = AppConfig::load_from_path(&config_path).unwrap();
        assert_eq!(
            config.positions_path().unwrap(),
            dir.path().join("exports/positions.csv")
        );
    }

    #[test]
    fn test_load_from_path_reports_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(&config_path, "positions_csv: p.csv\n").unwrap();

        let err = AppConfig::load_from_path(&config_path).unwrap_err();
        assert!(err.to_string().starts_with("Invalid config file"));
        assert!(AppConfig::load_from_path(dir.path().join("missing.yaml")).is_err());
    }
}
