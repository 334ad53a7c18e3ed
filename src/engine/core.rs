// 9.1: the exchange. owns one SymbolEngine per listed contract, each
// behind its own mutex, so matching within a symbol is serialized while
// symbols proceed fully in parallel. the registry is built once at
// construction and never resized, which keeps symbol lookup lock-free.

use super::results::EngineError;
use crate::book::BookSnapshot;
use crate::config::{ExchangeConfig, SymbolConfig};
use crate::events::{Event, EventBus, EventPayload};
use crate::funding::{FundingRate, FundingTracker};
use crate::ledger::BalanceLedger;
use crate::liquidation::{InsuranceFund, LiquidationEngine};
use crate::matching::MatchingEngine;
use crate::position::{Position, PositionManager};
use crate::price::PriceFeed;
use crate::risk::RiskEngine;
use crate::snapshot::SymbolSnapshot;
use crate::types::{Quote, Side, Symbol, Timestamp, UserId};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything one symbol needs, owned together so a single lock guards it.
#[derive(Debug)]
pub(super) struct SymbolEngine {
    pub(super) config: SymbolConfig,
    pub(super) matching: MatchingEngine,
    pub(super) positions: PositionManager,
    pub(super) risk: RiskEngine,
    pub(super) liquidation: LiquidationEngine,
    pub(super) funding: FundingTracker,
    /// Per-order leverage and margin, kept until the order leaves the book.
    pub(super) order_meta: HashMap<crate::types::OrderId, super::orders::OrderMeta>,
    pub(super) next_order_id: u64,
}

impl SymbolEngine {
    fn new(config: SymbolConfig) -> Self {
        let symbol = config.symbol.clone();
        Self {
            matching: MatchingEngine::new(symbol.clone()),
            positions: PositionManager::new(symbol.clone(), config.margin.clone()),
            risk: RiskEngine::new(symbol.clone(), config.risk.clone(), config.margin.clone()),
            liquidation: LiquidationEngine::new(
                symbol.clone(),
                config.liquidation.clone(),
                InsuranceFund::new(symbol.clone(), config.initial_insurance),
            ),
            funding: FundingTracker::new(symbol, config.funding.clone()),
            order_meta: HashMap::new(),
            next_order_id: 1,
            config,
        }
    }
}

pub struct Exchange {
    symbols: HashMap<Symbol, Mutex<SymbolEngine>>,
    pub(super) ledger: Arc<dyn BalanceLedger>,
    pub(super) prices: Arc<dyn PriceFeed>,
    pub(super) events: Mutex<EventBus>,
}

impl Exchange {
    pub fn new(
        config: ExchangeConfig,
        ledger: Arc<dyn BalanceLedger>,
        prices: Arc<dyn PriceFeed>,
    ) -> Self {
        let symbols = config
            .symbols
            .into_iter()
            .map(|sc| (sc.symbol.clone(), Mutex::new(SymbolEngine::new(sc))))
            .collect();

        Self {
            symbols,
            ledger,
            prices,
            events: Mutex::new(EventBus::new()),
        }
    }

    pub(super) fn symbol_engine(
        &self,
        symbol: &Symbol,
    ) -> Result<&Mutex<SymbolEngine>, EngineError> {
        self.symbols
            .get(symbol)
            .ok_or_else(|| EngineError::UnknownSymbol(symbol.clone()))
    }

    pub(super) fn listed_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.keys()
    }

    pub(super) fn publish(&self, timestamp: Timestamp, payload: EventPayload) {
        self.events.lock().publish(timestamp, payload);
    }

    /// Attach a consumer to the event stream.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.events.lock().subscribe()
    }

    pub fn order_book_snapshot(
        &self,
        symbol: &Symbol,
        depth: usize,
    ) -> Result<BookSnapshot, EngineError> {
        let engine = self.symbol_engine(symbol)?.lock();
        Ok(engine.matching.book().snapshot(depth))
    }

    pub fn position(
        &self,
        user_id: UserId,
        symbol: &Symbol,
        side: Side,
    ) -> Result<Option<Position>, EngineError> {
        let engine = self.symbol_engine(symbol)?.lock();
        Ok(engine.positions.find(user_id, side).cloned())
    }

    pub fn funding_rate(&self, symbol: &Symbol) -> Result<Option<FundingRate>, EngineError> {
        let engine = self.symbol_engine(symbol)?.lock();
        Ok(engine.funding.current_rate().cloned())
    }

    pub fn insurance_fund(&self, symbol: &Symbol) -> Result<InsuranceFund, EngineError> {
        let engine = self.symbol_engine(symbol)?.lock();
        Ok(engine.liquidation.fund().clone())
    }

    /// Top up a symbol's insurance fund.
    pub fn inject_insurance(&self, symbol: &Symbol, amount: Quote) -> Result<(), EngineError> {
        let mut engine = self.symbol_engine(symbol)?.lock();
        engine.liquidation.fund_mut().inject(amount);
        Ok(())
    }

    /// Capture one symbol's persistable state.
    pub fn snapshot_symbol(
        &self,
        symbol: &Symbol,
        now: Timestamp,
    ) -> Result<SymbolSnapshot, EngineError> {
        let engine = self.symbol_engine(symbol)?.lock();
        Ok(SymbolSnapshot {
            symbol: symbol.clone(),
            taken_at: now,
            resting_orders: engine.matching.book().orders().cloned().collect(),
            stop_orders: engine.matching.stop_orders().cloned().collect(),
            trade_sequence: engine.matching.trade_sequence(),
            order_sequence: engine.next_order_id,
            positions: engine.positions.all_positions().cloned().collect(),
            insurance: engine.liquidation.fund().clone(),
            funding_history: engine.funding.history().to_vec(),
            funding_settled_at: engine.funding.last_settled(),
        })
    }

    /// Replace one symbol's state with a snapshot. The book is rebuilt from
    /// the order set; risk-engine rate windows and the liquidation queue are
    /// ephemeral and start empty, the next cycle re-derives them.
    pub fn restore_symbol(&self, snapshot: SymbolSnapshot) -> Result<(), EngineError> {
        let mut engine = self.symbol_engine(&snapshot.symbol)?.lock();
        let config = engine.config.clone();

        engine.order_meta = snapshot
            .resting_orders
            .iter()
            .chain(snapshot.stop_orders.iter())
            .map(|o| {
                (
                    o.id,
                    super::orders::OrderMeta {
                        leverage: o.leverage,
                        margin_per_unit: o.margin.value() / o.quantity,
                    },
                )
            })
            .collect();
        engine.matching = MatchingEngine::restore(
            snapshot.symbol.clone(),
            snapshot.resting_orders,
            snapshot.stop_orders,
            snapshot.trade_sequence,
        );
        engine.positions = PositionManager::restore(
            snapshot.symbol.clone(),
            config.margin.clone(),
            snapshot.positions,
        );
        engine.liquidation = LiquidationEngine::new(
            snapshot.symbol.clone(),
            config.liquidation.clone(),
            snapshot.insurance,
        );
        engine.funding = FundingTracker::restore(
            snapshot.symbol,
            config.funding.clone(),
            snapshot.funding_history,
            snapshot.funding_settled_at,
        );
        engine.next_order_id = snapshot.order_sequence;
        Ok(())
    }
}
