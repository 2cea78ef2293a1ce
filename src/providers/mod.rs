pub mod overrides;
pub mod util;
pub mod yahoo_finance;

pub use overrides::{OverridePriceProvider, OverrideRateProvider};
pub use yahoo_finance::{YahooCurrencyProvider, YahooFinanceProvider};
