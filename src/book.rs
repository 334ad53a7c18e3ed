// 2.0: central limit order book. one balanced tree of price levels per side
// (bids walked descending, asks ascending) plus a flat id → order map so
// cancel/reduce never walk the tree. every level keeps a FIFO queue of order
// ids and a running total_quantity that must equal the sum of its orders'
// remaining quantities after every mutation.

use crate::order::Order;
use crate::types::{OrderId, Price, Side, Symbol, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BookError {
    #[error("order {0:?} already in book")]
    DuplicateOrder(OrderId),

    #[error("order {0:?} not found in book")]
    OrderNotFound(OrderId),

    #[error("order {order_id:?}: cannot reduce by {requested}, only {remaining} remaining")]
    InsufficientQuantity {
        order_id: OrderId,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("order {0:?} has no limit price, cannot rest")]
    PriceRequired(OrderId),
}

/// A single price level: FIFO queue of resting orders plus the cached total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Price,
    pub queue: VecDeque<OrderId>,
    pub total_quantity: Decimal,
}

impl PriceLevel {
    fn new(price: Price) -> Self {
        Self {
            price,
            queue: VecDeque::new(),
            total_quantity: Decimal::ZERO,
        }
    }

    pub fn order_count(&self) -> usize {
        self.queue.len()
    }
}

/// One (price, total, count) row of a depth snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelView {
    pub price: Price,
    pub total_quantity: Decimal,
    pub order_count: usize,
}

/// Depth snapshot of both sides, best prices first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: Symbol,
    pub bids: Vec<LevelView>,
    pub asks: Vec<LevelView>,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: Symbol,
    bids: BTreeMap<Price, PriceLevel>,
    asks: BTreeMap<Price, PriceLevel>,
    orders: HashMap<OrderId, Order>,
}

impl OrderBook {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            orders: HashMap::new(),
        }
    }

    fn levels(&self, side: Side) -> &BTreeMap<Price, PriceLevel> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn levels_mut(&mut self, side: Side) -> &mut BTreeMap<Price, PriceLevel> {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    /// Best bid = highest buy price, best ask = lowest sell price.
    pub fn best_price(&self, side: Side) -> Option<Price> {
        match side {
            Side::Buy => self.bids.keys().next_back().copied(),
            Side::Sell => self.asks.keys().next().copied(),
        }
    }

    /// Next level price after `price` in matching order for `side`
    /// (strictly lower for bids, strictly higher for asks).
    pub fn next_price(&self, side: Side, price: Price) -> Option<Price> {
        match side {
            Side::Buy => self.bids.range(..price).next_back().map(|(p, _)| *p),
            Side::Sell => self
                .asks
                .range((
                    std::ops::Bound::Excluded(price),
                    std::ops::Bound::Unbounded,
                ))
                .next()
                .map(|(p, _)| *p),
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.best_price(Side::Buy)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.best_price(Side::Sell)
    }

    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                Price::new((bid.value() + ask.value()) / Decimal::TWO)
            }
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.value() - bid.value()),
            _ => None,
        }
    }

    /// Rest a limit order on its side of the book.
    pub fn insert(&mut self, order: Order) -> Result<(), BookError> {
        if self.orders.contains_key(&order.id) {
            return Err(BookError::DuplicateOrder(order.id));
        }
        let price = order.price.ok_or(BookError::PriceRequired(order.id))?;
        let side = order.side;
        let remaining = order.remaining();
        let id = order.id;

        self.orders.insert(id, order);
        let level = self
            .levels_mut(side)
            .entry(price)
            .or_insert_with(|| PriceLevel::new(price));
        level.queue.push_back(id);
        level.total_quantity += remaining;
        Ok(())
    }

    /// Remove an order entirely, pruning its level if it empties.
    pub fn remove(&mut self, order_id: OrderId) -> Result<Order, BookError> {
        let order = self
            .orders
            .remove(&order_id)
            .ok_or(BookError::OrderNotFound(order_id))?;
        let price = order.price.expect("resting order always has a price");
        let remaining = order.remaining();
        let side = order.side;

        let levels = self.levels_mut(side);
        if let Some(level) = levels.get_mut(&price) {
            level.queue.retain(|id| *id != order_id);
            level.total_quantity -= remaining;
            if level.queue.is_empty() {
                levels.remove(&price);
            }
        }
        Ok(order)
    }

    /// Shrink an order's open quantity (partial cancel / amend down).
    /// Removes the order if nothing remains.
    pub fn reduce(&mut self, order_id: OrderId, amount: Decimal) -> Result<(), BookError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(BookError::OrderNotFound(order_id))?;
        let remaining = order.remaining();
        if amount > remaining {
            return Err(BookError::InsufficientQuantity {
                order_id,
                requested: amount,
                remaining,
            });
        }
        order.quantity -= amount;
        let price = order.price.expect("resting order always has a price");
        let side = order.side;
        let now_remaining = order.remaining();

        if let Some(level) = self.levels_mut(side).get_mut(&price) {
            level.total_quantity -= amount;
        }
        if now_remaining.is_zero() {
            self.remove(order_id)?;
        }
        Ok(())
    }

    /// Apply a fill to a resting order, keeping the level total in sync.
    /// Returns the order (removed from the book) once fully filled.
    pub fn fill_resting(
        &mut self,
        order_id: OrderId,
        amount: Decimal,
        timestamp: Timestamp,
    ) -> Result<Option<Order>, BookError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(BookError::OrderNotFound(order_id))?;
        let remaining = order.remaining();
        if amount > remaining {
            return Err(BookError::InsufficientQuantity {
                order_id,
                requested: amount,
                remaining,
            });
        }
        order.fill(amount, timestamp);
        let done = order.is_filled();
        let price = order.price.expect("resting order always has a price");
        let side = order.side;

        if let Some(level) = self.levels_mut(side).get_mut(&price) {
            level.total_quantity -= amount;
        }
        if done {
            return Ok(Some(self.remove(order_id)?));
        }
        Ok(None)
    }

    /// Earliest order at the best level of `side` (the next maker).
    pub fn front_at_best(&self, side: Side) -> Option<&Order> {
        let price = self.best_price(side)?;
        let level = self.levels(side).get(&price)?;
        let id = level.queue.front()?;
        self.orders.get(id)
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.orders.contains_key(&order_id)
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Total quantity on `side` crossing `limit` (unbounded for None).
    /// Used for the fill-or-kill pre-check.
    pub fn crossing_quantity(&self, side: Side, limit: Option<Price>) -> Decimal {
        let mut total = Decimal::ZERO;
        match side {
            Side::Sell => {
                // liquidity a buy taker can hit
                for (price, level) in self.asks.iter() {
                    if let Some(limit) = limit {
                        if price.value() > limit.value() {
                            break;
                        }
                    }
                    total += level.total_quantity;
                }
            }
            Side::Buy => {
                for (price, level) in self.bids.iter().rev() {
                    if let Some(limit) = limit {
                        if price.value() < limit.value() {
                            break;
                        }
                    }
                    total += level.total_quantity;
                }
            }
        }
        total
    }

    /// Up to `depth` levels per side, best first.
    pub fn snapshot(&self, depth: usize) -> BookSnapshot {
        let view = |level: &PriceLevel| LevelView {
            price: level.price,
            total_quantity: level.total_quantity,
            order_count: level.order_count(),
        };
        BookSnapshot {
            symbol: self.symbol.clone(),
            bids: self.bids.values().rev().take(depth).map(view).collect(),
            asks: self.asks.values().take(depth).map(view).collect(),
        }
    }

    /// All resting orders, the authoritative set for rebuilds and snapshots.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    /// Check every level total against the live orders underneath it.
    pub fn verify_totals(&self) -> bool {
        for levels in [&self.bids, &self.asks] {
            for level in levels.values() {
                let sum: Decimal = level
                    .queue
                    .iter()
                    .filter_map(|id| self.orders.get(id))
                    .map(|o| o.remaining())
                    .sum();
                if sum != level.total_quantity || level.queue.is_empty() {
                    return false;
                }
            }
        }
        true
    }

    /// Reconstruct both level trees from the order map. Last resort after a
    /// detected desync; FIFO order within a level follows submission time.
    pub fn rebuild(&mut self) {
        tracing::error!(symbol = %self.symbol, "rebuilding book levels from order set");
        self.bids.clear();
        self.asks.clear();

        let mut sorted: Vec<(OrderId, Price, Side, Decimal, Timestamp)> = self
            .orders
            .values()
            .map(|o| {
                (
                    o.id,
                    o.price.expect("resting order always has a price"),
                    o.side,
                    o.remaining(),
                    o.created_at,
                )
            })
            .collect();
        sorted.sort_by_key(|(id, _, _, _, ts)| (*ts, *id));

        for (id, price, side, remaining, _) in sorted {
            let level = self
                .levels_mut(side)
                .entry(price)
                .or_insert_with(|| PriceLevel::new(price));
            level.queue.push_back(id);
            level.total_quantity += remaining;
        }
    }
}
