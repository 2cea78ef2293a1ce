//! Error types raised by the allocation core.

use rust_decimal::Decimal;

/// Fatal errors of a rebalance run. A run either fully computes its
/// decisions or returns one of these, never a partial result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RebalanceError {
    #[error("invalid price {price} for {symbol}: prices must be positive")]
    InvalidPrice { symbol: String, price: Decimal },

    #[error("no exchange rate available between {from} and {to}")]
    MissingRate { from: String, to: String },

    #[error("cash balance in {currency} is negative: {amount}")]
    NegativeCash { currency: String, amount: Decimal },

    #[error("target allocation names {symbol} but no price is known for it")]
    UnpricedTarget { symbol: String },

    #[error("portfolio holds neither cash nor positions; no reference currency")]
    NoReferenceCurrency,
}

/// Errors raised while resolving hierarchical targets to per-symbol
/// percentages.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TargetError {
    #[error("target_asset_alloc must be a non-empty mapping")]
    Empty,

    #[error("target '{0}' must have a non-empty 'Constraint' list")]
    MissingConstraint(String),

    #[error("target '{0}' has no allocation entries")]
    NoAllocations(String),

    #[error("target '{name}': allocations sum to {sum}, not 100")]
    BadSum { name: String, sum: Decimal },

    #[error("target '{name}': path {path:?} does not lead to a subdividable node")]
    UnknownPath { name: String, path: Vec<String> },

    #[error("target '{name}': node at {path:?} is already subdivided")]
    AlreadySubdivided { name: String, path: Vec<String> },

    #[error("target '{name}': allocation key '{key}' has no matching tickers in column '{column}'")]
    UnknownCategory {
        name: String,
        key: String,
        column: String,
    },

    #[error("target '{name}': tickers with {column}='{value}' exist but have no allocation entry")]
    UncoveredCategory {
        name: String,
        column: String,
        value: String,
    },

    #[error("target '{name}': invalid entry '{key}': {reason}")]
    InvalidEntry {
        name: String,
        key: String,
        reason: String,
    },

    #[error("resolved allocations sum to {0}%, expected 100%")]
    BadTotal(Decimal),
}

pub type Result<T> = std::result::Result<T, RebalanceError>;
