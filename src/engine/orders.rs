// 9.2: the order pipeline. admission -> margin freeze -> match -> settle.
//
// margin is frozen before the order may touch the book, so once matching
// has produced trades the frozen-side ledger moves cannot legitimately
// fail. the whole pipeline runs under the symbol lock, which is what makes
// fill + position update + margin transfer atomic: a rejection at any
// admission step leaves zero state behind.

use super::core::{Exchange, SymbolEngine};
use super::results::EngineError;
use crate::events::{EventPayload, OrderEvent};
use crate::margin::{initial_margin, notional_value};
use crate::matching::MatchResult;
use crate::order::{Order, OrderStatus, OrderType, TimeInForce};
use crate::types::{Leverage, OrderId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;

/// Leverage and per-unit margin of a live order, needed to settle maker
/// fills after the order itself has left the book.
#[derive(Debug, Clone, Copy)]
pub(super) struct OrderMeta {
    pub leverage: Leverage,
    pub margin_per_unit: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub user_id: UserId,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub trigger_price: Option<Price>,
    pub quantity: Decimal,
    pub leverage: Leverage,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn limit(
        user_id: UserId,
        side: Side,
        quantity: Decimal,
        price: Price,
        leverage: Leverage,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            user_id,
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            trigger_price: None,
            quantity,
            leverage,
            time_in_force,
        }
    }

    pub fn market(user_id: UserId, side: Side, quantity: Decimal, leverage: Leverage) -> Self {
        Self {
            user_id,
            side,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            quantity,
            leverage,
            time_in_force: TimeInForce::IOC,
        }
    }

    pub fn stop(
        user_id: UserId,
        side: Side,
        quantity: Decimal,
        trigger_price: Price,
        leverage: Leverage,
    ) -> Self {
        Self {
            user_id,
            side,
            order_type: OrderType::Stop,
            price: None,
            trigger_price: Some(trigger_price),
            quantity,
            leverage,
            time_in_force: TimeInForce::IOC,
        }
    }
}

impl Exchange {
    pub fn submit_order(
        &self,
        symbol: &Symbol,
        request: OrderRequest,
        now: Timestamp,
    ) -> Result<MatchResult, EngineError> {
        let mut engine = self.symbol_engine(symbol)?.lock();
        let engine = &mut *engine;

        engine.config.validate_quantity(request.quantity)?;
        let mark = self.prices.mark_price(symbol)?;
        let price = request.price.map(|p| engine.config.align_price(p));

        let current_quantity = engine
            .positions
            .find(request.user_id, request.side)
            .filter(|p| p.is_open())
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        engine.risk.admit(
            request.user_id,
            request.quantity,
            request.leverage,
            price,
            mark,
            current_quantity,
            now,
        )?;

        // margin is sized from the limit price when there is one, the mark
        // otherwise, and frozen before matching may begin
        let margin = initial_margin(
            notional_value(request.quantity, price.unwrap_or(mark)),
            request.leverage,
        );
        self.ledger
            .freeze(request.user_id, &engine.config.currency, margin)?;

        let order_id = OrderId(engine.next_order_id);
        engine.next_order_id += 1;
        let order = match request.order_type {
            OrderType::Limit => {
                let Some(price) = price else {
                    self.unwind_freeze(engine, request.user_id, margin);
                    return Err(EngineError::MissingPrice(request.order_type));
                };
                Order::new_limit(
                    order_id,
                    request.user_id,
                    symbol.clone(),
                    request.side,
                    request.quantity,
                    price,
                    request.leverage,
                    margin,
                    request.time_in_force,
                    now,
                )
            }
            OrderType::Market => Order::new_market(
                order_id,
                request.user_id,
                symbol.clone(),
                request.side,
                request.quantity,
                request.leverage,
                margin,
                now,
            ),
            OrderType::Stop => {
                let Some(trigger) = request.trigger_price else {
                    self.unwind_freeze(engine, request.user_id, margin);
                    return Err(EngineError::MissingPrice(request.order_type));
                };
                Order::new_stop(
                    order_id,
                    request.user_id,
                    symbol.clone(),
                    request.side,
                    request.quantity,
                    trigger,
                    request.leverage,
                    margin,
                    now,
                )
            }
        };

        engine.order_meta.insert(
            order_id,
            OrderMeta {
                leverage: request.leverage,
                margin_per_unit: margin.value() / request.quantity,
            },
        );
        self.publish(
            now,
            EventPayload::OrderCreated(OrderEvent {
                order_id,
                user_id: request.user_id,
                symbol: symbol.clone(),
                side: request.side,
                status: order.status,
                filled_quantity: Decimal::ZERO,
                remaining_quantity: request.quantity,
            }),
        );

        if order.order_type == OrderType::Stop {
            let remaining = order.remaining();
            engine.matching.park_stop(order);
            return Ok(MatchResult {
                order_id,
                trades: Vec::new(),
                remaining_quantity: remaining,
                status: OrderStatus::PendingTrigger,
                resting: false,
            });
        }

        self.execute(engine, order, now)
    }

    /// Run one admitted order through matching and settlement. Margin for
    /// the full quantity is already frozen and meta recorded.
    fn execute(
        &self,
        engine: &mut SymbolEngine,
        order: Order,
        now: Timestamp,
    ) -> Result<MatchResult, EngineError> {
        let user_id = order.user_id;
        let side = order.side;
        let order_id = order.id;
        let symbol = order.symbol.clone();
        let currency = engine.config.currency.clone();
        let meta = engine.order_meta[&order_id];
        let remaining_before = order.remaining();

        let result = match engine.matching.process_order(order, now) {
            Ok(result) => result,
            Err(err) => {
                // structural failure inside matching; margin goes back and
                // the book gets rebuilt from the order set
                self.unwind_freeze(
                    engine,
                    user_id,
                    Quote::new(meta.margin_per_unit * remaining_before),
                );
                engine.order_meta.remove(&order_id);
                tracing::error!(order = order_id.0, error = %err, "matching failed, rebuilding book");
                engine.matching.book_mut().rebuild();
                return Err(err.into());
            }
        };

        for trade in &result.trades {
            // maker first so their row exists before events go out
            if let Some(maker_meta) = engine.order_meta.get(&trade.maker_order_id).copied() {
                self.settle_fill(
                    engine,
                    trade.maker_user_id,
                    trade.maker_side,
                    trade.quantity,
                    trade.price,
                    maker_meta,
                    &currency,
                    now,
                );
            } else {
                tracing::error!(
                    order = trade.maker_order_id.0,
                    "maker metadata missing at settlement"
                );
            }
            self.settle_fill(
                engine,
                trade.taker_user_id,
                trade.taker_side(),
                trade.quantity,
                trade.price,
                meta,
                &currency,
                now,
            );

            let maker_remaining = engine
                .matching
                .book()
                .get(trade.maker_order_id)
                .map(|o| o.remaining())
                .unwrap_or(Decimal::ZERO);
            if maker_remaining.is_zero() {
                engine.order_meta.remove(&trade.maker_order_id);
            }

            self.publish(now, EventPayload::TradeExecuted(trade.clone()));
            self.publish(
                now,
                EventPayload::OrderUpdated(OrderEvent {
                    order_id: trade.maker_order_id,
                    user_id: trade.maker_user_id,
                    symbol: symbol.clone(),
                    side: trade.maker_side,
                    status: if maker_remaining.is_zero() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    },
                    filled_quantity: trade.quantity,
                    remaining_quantity: maker_remaining,
                }),
            );
        }

        // whatever does not rest releases its margin and leaves a terminal
        // order event behind: IOC/market remainder or FOK rejection
        if !result.resting && result.remaining_quantity > Decimal::ZERO {
            self.unwind_freeze(
                engine,
                user_id,
                Quote::new(meta.margin_per_unit * result.remaining_quantity),
            );
            self.publish(
                now,
                EventPayload::OrderCanceled(OrderEvent {
                    order_id,
                    user_id,
                    symbol: symbol.clone(),
                    side,
                    status: result.status,
                    filled_quantity: result.filled_quantity(),
                    remaining_quantity: result.remaining_quantity,
                }),
            );
        }
        if !result.resting {
            engine.order_meta.remove(&order_id);
        }

        if !result.trades.is_empty() {
            self.publish(
                now,
                EventPayload::OrderUpdated(OrderEvent {
                    order_id,
                    user_id,
                    symbol: symbol.clone(),
                    side,
                    status: result.status,
                    filled_quantity: result.filled_quantity(),
                    remaining_quantity: result.remaining_quantity,
                }),
            );
        }

        if !engine.matching.book().verify_totals() {
            tracing::error!(symbol = %symbol, "level totals desynced, rebuilding book");
            engine.matching.book_mut().rebuild();
        }

        Ok(result)
    }

    // one user's side of one trade: consume the frozen margin backing the
    // filled quantity, apply the fill to their positions, give back
    // whatever the position did not absorb.
    #[allow(clippy::too_many_arguments)]
    fn settle_fill(
        &self,
        engine: &mut SymbolEngine,
        user_id: UserId,
        side: Side,
        quantity: Decimal,
        price: Price,
        meta: OrderMeta,
        currency: &str,
        now: Timestamp,
    ) {
        let portion = Quote::new(meta.margin_per_unit * quantity);
        if let Err(err) = self.ledger.debit_frozen(user_id, currency, portion) {
            tracing::error!(user = user_id.0, error = %err, "frozen margin missing at fill");
        }

        match engine
            .positions
            .apply_fill(user_id, side, quantity, price, meta.leverage, portion, now)
        {
            Ok(outcome) => {
                // netting consumed less than was frozen for this fill
                let surplus = portion.sub(outcome.margin_consumed);
                if surplus.value() > Decimal::ZERO {
                    self.ledger.credit(user_id, currency, surplus);
                }
                if let Some(closed) = outcome.reduced {
                    self.ledger.credit(user_id, currency, closed.margin_released);
                    self.settle_pnl(user_id, currency, closed.realized_pnl);
                }
            }
            Err(err) => {
                tracing::error!(user = user_id.0, error = %err, "position update failed at fill");
                self.ledger.credit(user_id, currency, portion);
            }
        }
    }

    pub(super) fn settle_pnl(&self, user_id: UserId, currency: &str, pnl: Quote) {
        if pnl.value() > Decimal::ZERO {
            self.ledger.credit(user_id, currency, pnl);
        } else if pnl.value() < Decimal::ZERO {
            self.ledger.debit(user_id, currency, pnl.abs());
        }
    }

    fn unwind_freeze(&self, engine: &mut SymbolEngine, user_id: UserId, amount: Quote) {
        if let Err(err) = self
            .ledger
            .unfreeze(user_id, &engine.config.currency, amount)
        {
            tracing::error!(user = user_id.0, error = %err, "margin unfreeze failed");
        }
    }

    /// Cancel a resting or parked order. Already-matched orders make this
    /// a no-op returning false; a partial fill cancels only the remainder.
    pub fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: OrderId,
        now: Timestamp,
    ) -> Result<bool, EngineError> {
        let mut engine = self.symbol_engine(symbol)?.lock();
        let engine = &mut *engine;

        let Some(order) = engine.matching.cancel(order_id) else {
            return Ok(false);
        };

        if let Some(meta) = engine.order_meta.remove(&order_id) {
            self.unwind_freeze(
                engine,
                order.user_id,
                Quote::new(meta.margin_per_unit * order.remaining()),
            );
        }

        self.publish(
            now,
            EventPayload::OrderCanceled(OrderEvent {
                order_id,
                user_id: order.user_id,
                symbol: symbol.clone(),
                side: order.side,
                status: OrderStatus::Canceled,
                filled_quantity: order.filled_quantity,
                remaining_quantity: order.remaining(),
            }),
        );
        Ok(true)
    }

    /// React to a fresh mark price: release triggered stop orders into the
    /// book and revalue every open position. Returns the match results of
    /// the released stops in trigger order.
    pub fn on_price_tick(
        &self,
        symbol: &Symbol,
        now: Timestamp,
    ) -> Result<Vec<MatchResult>, EngineError> {
        let mark = self.prices.mark_price(symbol)?;
        let mut engine = self.symbol_engine(symbol)?.lock();
        let engine = &mut *engine;

        let released = engine.matching.on_price_update(mark);
        let mut results = Vec::with_capacity(released.len());
        for order in released {
            let order_id = order.id;
            match self.execute(engine, order, now) {
                Ok(result) => results.push(result),
                Err(err) => {
                    // execute has already unwound the failing order's
                    // margin; the rest of the released set still runs
                    tracing::error!(order = order_id.0, error = %err, "released stop failed");
                }
            }
        }

        engine.positions.revalue_all(mark);
        Ok(results)
    }
}
