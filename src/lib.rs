pub mod cli;
pub mod core;
pub mod providers;

use crate::core::config::AppConfig;
use anyhow::Result;
use providers::{OverridePriceProvider, OverrideRateProvider, YahooCurrencyProvider, YahooFinanceProvider};
use tracing::{debug, info};

pub enum AppCommand {
    Rebalance,
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("rebal starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let yahoo = &config.providers.yahoo;
    let price_provider =
        OverridePriceProvider::new(YahooFinanceProvider::new(yahoo)?, config.quotes.clone());
    let rate_provider = OverrideRateProvider::new(YahooCurrencyProvider::new(yahoo)?, &config.rates);

    match command {
        AppCommand::Rebalance => cli::rebalance::run(&config, &price_provider, &rate_provider).await,
    }
}
