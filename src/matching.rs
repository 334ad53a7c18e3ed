// 2.1: matching engine. walks the opposite side of the book from the best
// price while a cross exists, consuming each level FIFO. every trade prints
// at the maker's resting price. one engine instance per symbol, driven by a
// single logical owner, which is what makes price-time ordering deterministic.

use crate::book::{BookError, OrderBook};
use crate::order::{Order, OrderStatus, OrderType, TimeInForce};
use crate::types::{OrderId, Price, Side, Symbol, Timestamp, TradeId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An execution between a resting maker and an incoming taker.
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub symbol: Symbol,
    pub maker_order_id: OrderId,
    pub taker_order_id: OrderId,
    pub maker_user_id: UserId,
    pub taker_user_id: UserId,
    /// Maker's resting side; the taker took the opposite.
    pub maker_side: Side,
    /// Always the maker's resting price (price improvement for the taker).
    pub price: Price,
    pub quantity: Decimal,
    pub timestamp: Timestamp,
}

impl Trade {
    pub fn taker_side(&self) -> Side {
        self.maker_side.opposite()
    }
}

/// Outcome of processing one incoming order.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub order_id: OrderId,
    pub trades: Vec<Trade>,
    pub remaining_quantity: Decimal,
    pub status: OrderStatus,
    /// Whether the remainder now rests on the book.
    pub resting: bool,
}

impl MatchResult {
    pub fn filled_quantity(&self) -> Decimal {
        self.trades.iter().map(|t| t.quantity).sum()
    }

    pub fn average_price(&self) -> Option<Price> {
        let filled = self.filled_quantity();
        if filled.is_zero() {
            return None;
        }
        let cost: Decimal = self
            .trades
            .iter()
            .map(|t| t.quantity * t.price.value())
            .sum();
        Price::new(cost / filled)
    }
}

#[derive(Debug)]
pub struct MatchingEngine {
    pub symbol: Symbol,
    book: OrderBook,
    /// Stop orders parked until their trigger price is crossed.
    stop_orders: HashMap<OrderId, Order>,
    next_trade_id: u64,
}

impl MatchingEngine {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            book: OrderBook::new(symbol.clone()),
            symbol,
            stop_orders: HashMap::new(),
            next_trade_id: 1,
        }
    }

    /// Rebuild an engine from persisted orders. Resting orders go through
    /// the book's rebuild path so price-time order is restored from their
    /// timestamps; the trade sequence continues where it left off.
    pub fn restore(
        symbol: Symbol,
        mut resting: Vec<Order>,
        stops: Vec<Order>,
        trade_sequence: u64,
    ) -> Self {
        resting.sort_by_key(|o| (o.created_at, o.id));
        let mut book = OrderBook::new(symbol.clone());
        for order in resting {
            if let Err(err) = book.insert(order) {
                tracing::error!(error = %err, "dropping unrestorable order");
            }
        }
        Self {
            book,
            symbol,
            stop_orders: stops.into_iter().map(|o| (o.id, o)).collect(),
            next_trade_id: trade_sequence,
        }
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn stop_orders(&self) -> impl Iterator<Item = &Order> {
        self.stop_orders.values()
    }

    pub fn trade_sequence(&self) -> u64 {
        self.next_trade_id
    }

    pub fn book_mut(&mut self) -> &mut OrderBook {
        &mut self.book
    }

    fn next_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.next_trade_id);
        self.next_trade_id += 1;
        id
    }

    /// Does `taker` cross a maker resting at `maker_price`?
    /// Market orders treat their price as unbounded.
    fn crosses(taker: &Order, maker_price: Price) -> bool {
        match taker.price {
            None => true,
            Some(limit) => match taker.side {
                Side::Buy => limit.value() >= maker_price.value(),
                Side::Sell => limit.value() <= maker_price.value(),
            },
        }
    }

    /// Park a stop order until `on_price_update` releases it.
    pub fn park_stop(&mut self, order: Order) {
        debug_assert_eq!(order.order_type, OrderType::Stop);
        self.stop_orders.insert(order.id, order);
    }

    /// Release stop orders whose trigger the given price crosses.
    /// Buy stops trigger at or above, sell stops at or below.
    /// Returned orders are ready to run through `process_order` as markets.
    pub fn on_price_update(&mut self, price: Price) -> Vec<Order> {
        let triggered: Vec<OrderId> = self
            .stop_orders
            .values()
            .filter(|o| {
                let trigger = o.trigger_price.expect("stop order always has a trigger");
                match o.side {
                    Side::Buy => price.value() >= trigger.value(),
                    Side::Sell => price.value() <= trigger.value(),
                }
            })
            .map(|o| o.id)
            .collect();

        let mut released = Vec::with_capacity(triggered.len());
        for id in triggered {
            if let Some(mut order) = self.stop_orders.remove(&id) {
                order.order_type = OrderType::Market;
                order.status = OrderStatus::New;
                released.push(order);
            }
        }
        released
    }

    /// Match an incoming order against the book per its time-in-force.
    pub fn process_order(
        &mut self,
        mut order: Order,
        timestamp: Timestamp,
    ) -> Result<MatchResult, BookError> {
        let order_id = order.id;

        // FOK is checked before any mutation: either the whole quantity is
        // reachable or nothing happens at all.
        if order.time_in_force == TimeInForce::FOK {
            let available = self
                .book
                .crossing_quantity(order.side.opposite(), order.price);
            if available < order.remaining() {
                return Ok(MatchResult {
                    order_id,
                    trades: Vec::new(),
                    remaining_quantity: order.remaining(),
                    status: OrderStatus::Rejected,
                    resting: false,
                });
            }
        }

        let mut trades = Vec::new();
        let maker_side = order.side.opposite();

        while !order.is_filled() {
            let Some(maker) = self.book.front_at_best(maker_side) else {
                break;
            };
            let maker_price = maker.price.expect("resting order always has a price");
            if !Self::crosses(&order, maker_price) {
                break;
            }

            let maker_id = maker.id;
            let maker_user = maker.user_id;
            let fill_quantity = order.remaining().min(maker.remaining());

            // taker fill, maker fill and trade creation are one atomic step
            order.fill(fill_quantity, timestamp);
            self.book.fill_resting(maker_id, fill_quantity, timestamp)?;

            trades.push(Trade {
                id: self.next_trade_id(),
                symbol: self.symbol.clone(),
                maker_order_id: maker_id,
                taker_order_id: order_id,
                maker_user_id: maker_user,
                taker_user_id: order.user_id,
                maker_side,
                price: maker_price,
                quantity: fill_quantity,
                timestamp,
            });
        }

        let remaining = order.remaining();
        let filled_any = !trades.is_empty();

        let (status, resting) = if remaining.is_zero() {
            (OrderStatus::Filled, false)
        } else {
            match (order.order_type, order.time_in_force) {
                // market remainder never rests
                (OrderType::Market, _) => (
                    if filled_any {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Rejected
                    },
                    false,
                ),
                (_, TimeInForce::GTC) => {
                    order.status = if filled_any {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::New
                    };
                    let status = order.status;
                    self.book.insert(order)?;
                    (status, true)
                }
                (_, TimeInForce::IOC) => (
                    if filled_any {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Canceled
                    },
                    false,
                ),
                // FOK passed the pre-check, so it cannot get here partially
                (_, TimeInForce::FOK) => (OrderStatus::Filled, false),
            }
        };

        Ok(MatchResult {
            order_id,
            trades,
            remaining_quantity: remaining,
            status,
            resting,
        })
    }

    /// Cancel a resting or parked order. Returns the order with its
    /// unmatched remainder, or None if it already left the book; canceling
    /// a fully matched order is a no-op, not an error.
    pub fn cancel(&mut self, order_id: OrderId) -> Option<Order> {
        if let Some(order) = self.stop_orders.remove(&order_id) {
            return Some(order);
        }
        self.book.remove(order_id).ok()
    }

    pub fn has_stop(&self, order_id: OrderId) -> bool {
        self.stop_orders.contains_key(&order_id)
    }
}
