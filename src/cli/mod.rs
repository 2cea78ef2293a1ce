pub mod rebalance;
pub mod setup;
pub mod ui;
