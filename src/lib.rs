// exchange-core: matching and leveraged-position engine for a perpetuals
// exchange. price-time-priority CLOB feeding a margin, liquidation, ADL
// and funding pipeline. deterministic within a symbol, parallel across
// symbols, no external I/O from the core itself.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: Symbol, Side, Price, Quote, Leverage
//   2.x  book.rs: price levels, FIFO queues, the resting order set
//   2.1x matching.rs: the matching loop, TIF handling, stop triggers
//   3.x  position.rs: position rows, netting, close/reduce
//   3.5  margin.rs: IM/MM math, margin ratio
//   4.x  risk.rs: admission gate and continuous risk sweep
//   5.x  liquidation.rs: queue, state machine, insurance fund
//   6.x  adl.rs: ranked forced deleveraging
//   7.x  funding.rs: rate math, settlement watermark
//   8.x  events.rs: event payloads and the fan-out bus
//   9.x  engine/: the exchange: order pipeline, cycles, queries
//   10.x config.rs: contract params per symbol
//   11.x ledger.rs / price.rs: balance and price-feed seams
//   12.x snapshot.rs: persistable per-symbol state

// matching core
pub mod book;
pub mod matching;
pub mod order;
pub mod types;

// position and risk pipeline
pub mod adl;
pub mod funding;
pub mod liquidation;
pub mod margin;
pub mod position;
pub mod risk;

// orchestration and seams
pub mod config;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod price;
pub mod snapshot;

// re exports for convenience
pub use adl::*;
pub use book::*;
pub use config::*;
pub use engine::*;
pub use events::*;
pub use funding::*;
pub use ledger::*;
pub use liquidation::*;
pub use margin::*;
pub use matching::*;
pub use order::*;
pub use position::*;
pub use price::*;
pub use risk::*;
pub use snapshot::*;
pub use types::*;
