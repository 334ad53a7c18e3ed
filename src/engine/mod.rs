// 9.0: the exchange engine. coordinates admission, matching, position
// settlement, liquidation cycles and funding cycles over the per-symbol
// engines. deterministic within a symbol, parallel across symbols.

mod core;
mod funding;
mod liquidations;
mod orders;
mod results;

pub use self::core::Exchange;
pub use orders::OrderRequest;
pub use results::{EngineError, FundingReport, FundingSymbolReport, LiquidationReport};
