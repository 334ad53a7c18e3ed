//! Persistable state of one symbol engine.
//!
//! The snapshot carries the authoritative order set rather than the book
//! structure; restore rebuilds price levels and FIFO queues from order
//! timestamps, the same path used when a live book desyncs.

use crate::funding::FundingRate;
use crate::liquidation::InsuranceFund;
use crate::order::Order;
use crate::position::Position;
use crate::types::{Symbol, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot is for {found}, expected {expected}")]
    SymbolMismatch { expected: Symbol, found: Symbol },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSnapshot {
    pub symbol: Symbol,
    pub taken_at: Timestamp,
    /// Orders resting on the book.
    pub resting_orders: Vec<Order>,
    /// Stop orders parked for their trigger.
    pub stop_orders: Vec<Order>,
    pub trade_sequence: u64,
    pub order_sequence: u64,
    /// Every position row, zeroed history rows included.
    pub positions: Vec<Position>,
    pub insurance: InsuranceFund,
    pub funding_history: Vec<FundingRate>,
    pub funding_settled_at: Option<Timestamp>,
}

impl SymbolSnapshot {
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(raw)?)
    }
}
