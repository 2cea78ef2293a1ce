//! Pricing abstractions

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest quote for one symbol, in the currency it trades in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceResult {
    pub price: Decimal,
    pub currency: String,
    pub short_name: Option<String>,
}

#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn fetch_price(&self, symbol: &str) -> Result<PriceResult>;
}

/// Major currency code and factor for quotes given in a minor unit, such as
/// London listings priced in pence.
fn minor_unit(currency: &str) -> Option<(&'static str, Decimal)> {
    match currency {
        "GBp" | "GBX" => Some(("GBP", Decimal::new(1, 2))),
        "ZAc" | "ZAC" => Some(("ZAR", Decimal::new(1, 2))),
        "ILA" => Some(("ILS", Decimal::new(1, 2))),
        _ => None,
    }
}

impl PriceResult {
    /// Builds a quote with the price expressed in the major unit of an
    /// upper-case currency code.
    pub fn normalized(price: Decimal, currency: &str, short_name: Option<String>) -> Self {
        let currency = currency.trim();
        match minor_unit(currency) {
            Some((major, factor)) => PriceResult {
                price: price * factor,
                currency: major.to_string(),
                short_name,
            },
            None => PriceResult {
                price,
                currency: currency.to_uppercase(),
                short_name,
            },
        }
    }
}
