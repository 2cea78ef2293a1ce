use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::config::YahooProviderConfig;
use crate::core::currency::CurrencyRateProvider;
use crate::core::price::{PriceProvider, PriceResult};
use crate::providers::util::with_retry;

#[derive(Deserialize, Debug)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    result: Option<Vec<ChartItem>>,
}

#[derive(Deserialize, Debug)]
struct ChartItem {
    meta: ChartMeta,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    regular_market_price: Option<Decimal>,
    currency: Option<String>,
    short_name: Option<String>,
}

/// Shared HTTP client for the chart endpoint, used for both quotes and FX
/// pairs.
#[derive(Clone)]
struct ChartClient {
    client: reqwest::Client,
    base_url: String,
    retries: usize,
    retry_delay_ms: u64,
}

impl ChartClient {
    fn new(config: &YahooProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rebal/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ChartClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retries: config.retries,
            retry_delay_ms: config.retry_delay_ms,
        })
    }

    async fn meta(&self, symbol: &str) -> Result<ChartMeta> {
        let url = format!("{}/v8/finance/chart/{}?interval=1d&range=1d", self.base_url, symbol);
        debug!("Requesting chart data from {}", url);

        let client = &self.client;
        let url = url.as_str();
        let text = with_retry(
            move || async move {
                client
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await
            },
            self.retries,
            self.retry_delay_ms,
        )
        .await
        .map_err(|e| anyhow!("Request error: {} for symbol: {}", e, symbol))?;

        let data: ChartResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse JSON response for {}: {}", symbol, e))?;
        data.chart
            .result
            .and_then(|items| items.into_iter().next())
            .map(|item| item.meta)
            .ok_or_else(|| anyhow!("No price data found for symbol: {}", symbol))
    }
}

pub struct YahooFinanceProvider {
    client: ChartClient,
}

impl YahooFinanceProvider {
    pub fn new(config: &YahooProviderConfig) -> Result<Self> {
        Ok(YahooFinanceProvider {
            client: ChartClient::new(config)?,
        })
    }
}

#[async_trait]
impl PriceProvider for YahooFinanceProvider {
    #[instrument(name = "YahooPriceFetch", skip(self), fields(symbol = %symbol))]
    async fn fetch_price(&self, symbol: &str) -> Result<PriceResult> {
        let meta = self.client.meta(symbol).await?;
        let price = meta
            .regular_market_price
            .ok_or_else(|| anyhow!("No market price in response for symbol: {}", symbol))?;
        let currency = meta
            .currency
            .ok_or_else(|| anyhow!("No currency in response for symbol: {}", symbol))?;

        Ok(PriceResult::normalized(price, &currency, meta.short_name))
    }
}

pub struct YahooCurrencyProvider {
    client: ChartClient,
}

impl YahooCurrencyProvider {
    pub fn new(config: &YahooProviderConfig) -> Result<Self> {
        Ok(YahooCurrencyProvider {
            client: ChartClient::new(config)?,
        })
    }
}

#[async_trait]
impl CurrencyRateProvider for YahooCurrencyProvider {
    #[instrument(name = "YahooRateFetch", skip(self))]
    async fn get_rate(&self, from: &str, to: &str) -> Result<Decimal> {
        let symbol = format!("{from}{to}=X");
        self.client
            .meta(&symbol)
            .await?
            .regular_market_price
            .filter(|rate| *rate > Decimal::ZERO)
            .ok_or_else(|| anyhow!("No rate data found for currency pair: {}", symbol))
    }
}
