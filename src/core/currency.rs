//! Currency conversion abstractions

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[async_trait]
pub trait CurrencyRateProvider: Send + Sync {
    /// Units of `to` bought by one unit of `from`.
    async fn get_rate(&self, from: &str, to: &str) -> Result<Decimal>;
}
