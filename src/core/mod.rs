//! Allocation core and the abstractions it is fed through

pub mod config;
pub mod conversion;
pub mod currency;
pub mod error;
pub mod log;
pub mod positions;
pub mod price;
pub mod rates;
pub mod rebalance;
pub mod snapshot;
pub mod solver;
pub mod targets;
pub mod valuation;

// Re-export main types for cleaner imports
pub use currency::CurrencyRateProvider;
pub use error::{RebalanceError, TargetError};
pub use price::{PriceProvider, PriceResult};
pub use rates::{ExchangeRate, RateTable};
pub use rebalance::{RebalanceOutcome, rebalance};
pub use snapshot::{CashBalance, PortfolioSnapshot, Position, TargetAllocation};
