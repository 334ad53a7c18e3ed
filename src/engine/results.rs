// 9.0.1: typed results and errors for exchange operations.

use crate::adl::AdlAssignment;
use crate::book::BookError;
use crate::config::ContractError;
use crate::ledger::LedgerError;
use crate::liquidation::LiquidationRecord;
use crate::position::PositionError;
use crate::price::PriceError;
use crate::risk::RiskViolation;
use crate::types::Symbol;
use rust_decimal::Decimal;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("symbol {0} not listed")]
    UnknownSymbol(Symbol),

    #[error("order {0:?} not found on {1}")]
    OrderNotFound(crate::types::OrderId, Symbol),

    #[error("{0:?} order requires a price")]
    MissingPrice(crate::order::OrderType),

    #[error("admission rejected: {0}")]
    Risk(#[from] RiskViolation),

    #[error("contract violation: {0}")]
    Contract(#[from] ContractError),

    #[error("ledger rejected: {0}")]
    Ledger(#[from] LedgerError),

    #[error("price unavailable: {0}")]
    Price(#[from] PriceError),

    #[error("book violation: {0}")]
    Book(#[from] BookError),

    #[error("position error: {0}")]
    Position(#[from] PositionError),
}

/// One liquidation cycle over a symbol.
#[derive(Debug, Clone, Default)]
pub struct LiquidationReport {
    /// Open positions examined in the risk sweep.
    pub scanned: usize,
    /// Positions newly flagged and enqueued this cycle.
    pub enqueued: usize,
    pub liquidated: Vec<LiquidationRecord>,
    /// Forced reductions executed to absorb uncovered shortfalls.
    pub deleveraged: Vec<AdlAssignment>,
}

/// One funding cycle over all symbols.
#[derive(Debug, Clone, Default)]
pub struct FundingReport {
    pub settled: Vec<FundingSymbolReport>,
    /// Symbols skipped this tick, with the reason. They retry next tick.
    pub skipped: Vec<(Symbol, PriceError)>,
}

#[derive(Debug, Clone)]
pub struct FundingSymbolReport {
    pub symbol: Symbol,
    pub rate: Decimal,
    pub positions_settled: usize,
}
