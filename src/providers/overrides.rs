//! Quotes and rates entered by hand in the config file, consulted before
//! the wrapped provider.

use crate::core::config::{QuoteOverride, RateOverride};
use crate::core::currency::CurrencyRateProvider;
use crate::core::price::{PriceProvider, PriceResult};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

pub struct OverridePriceProvider<T: PriceProvider> {
    inner: T,
    quotes: BTreeMap<String, QuoteOverride>,
}

impl<T: PriceProvider> OverridePriceProvider<T> {
    pub fn new(inner: T, quotes: BTreeMap<String, QuoteOverride>) -> Self {
        Self { inner, quotes }
    }
}

#[async_trait]
impl<T: PriceProvider> PriceProvider for OverridePriceProvider<T> {
    async fn fetch_price(&self, symbol: &str) -> Result<PriceResult> {
        if let Some(quote) = self.quotes.get(symbol) {
            debug!("Using manual quote for {}", symbol);
            return Ok(PriceResult::normalized(quote.price, &quote.currency, None));
        }
        self.inner.fetch_price(symbol).await
    }
}

pub struct OverrideRateProvider<T: CurrencyRateProvider> {
    inner: T,
    rates: BTreeMap<(String, String), Decimal>,
}

impl<T: CurrencyRateProvider> OverrideRateProvider<T> {
    pub fn new(inner: T, rates: &[RateOverride]) -> Self {
        let rates = rates
            .iter()
            .filter(|r| r.rate > Decimal::ZERO)
            .map(|r| ((r.from.to_uppercase(), r.to.to_uppercase()), r.rate))
            .collect();
        Self { inner, rates }
    }

    fn manual(&self, from: &str, to: &str) -> Option<Decimal> {
        if let Some(rate) = self.rates.get(&(from.to_string(), to.to_string())) {
            return Some(*rate);
        }
        self.rates
            .get(&(to.to_string(), from.to_string()))
            .map(|rate| Decimal::ONE / *rate)
    }
}

#[async_trait]
impl<T: CurrencyRateProvider> CurrencyRateProvider for OverrideRateProvider<T> {
    async fn get_rate(&self, from: &str, to: &str) -> Result<Decimal> {
        if let Some(rate) = self.manual(from, to) {
            debug!("Using manual rate {}/{}: {}", from, to, rate);
            return Ok(rate);
        }
        self.inner.get_rate(from, to).await
    }
}
