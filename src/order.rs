//! Order record and lifecycle types.
//!
//! An order carries its own margin allocation and leverage so that fills can
//! move collateral into the resulting position without a second lookup.

use crate::types::{Leverage, OrderId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order time in force options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled. Unmatched remainder rests on the book.
    GTC,
    /// Immediate or cancel. Fill what is possible, discard the rest.
    IOC,
    /// Fill or kill. Fill entirely or reject with zero side effects.
    FOK,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::GTC
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Limit order with a resting price.
    Limit,
    /// Market order. Executes at best available prices, never rests.
    Market,
    /// Stop order. Parks in the trigger book until the mark price crosses
    /// the trigger, then executes as a market order.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    /// Stop order waiting for its trigger price.
    PendingTrigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price. None for market orders.
    pub price: Option<Price>,
    /// Trigger price for stop orders.
    pub trigger_price: Option<Price>,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub leverage: Leverage,
    /// Margin frozen for this order at admission.
    pub margin: Quote,
    pub time_in_force: TimeInForce,
    pub status: OrderStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Order {
    pub fn new_limit(
        id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        price: Price,
        leverage: Leverage,
        margin: Quote,
        time_in_force: TimeInForce,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            symbol,
            side,
            order_type: OrderType::Limit,
            price: Some(price),
            trigger_price: None,
            quantity,
            filled_quantity: Decimal::ZERO,
            leverage,
            margin,
            time_in_force,
            status: OrderStatus::New,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn new_market(
        id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        leverage: Leverage,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            symbol,
            side,
            order_type: OrderType::Market,
            price: None,
            trigger_price: None,
            quantity,
            filled_quantity: Decimal::ZERO,
            leverage,
            margin,
            time_in_force: TimeInForce::IOC,
            status: OrderStatus::New,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn new_stop(
        id: OrderId,
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        quantity: Decimal,
        trigger_price: Price,
        leverage: Leverage,
        margin: Quote,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            symbol,
            side,
            order_type: OrderType::Stop,
            price: None,
            trigger_price: Some(trigger_price),
            quantity,
            filled_quantity: Decimal::ZERO,
            leverage,
            margin,
            time_in_force: TimeInForce::IOC,
            status: OrderStatus::PendingTrigger,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    pub fn is_filled(&self) -> bool {
        self.filled_quantity == self.quantity
    }

    /// Record a fill against this order. Invariant: 0 <= filled <= quantity.
    pub fn fill(&mut self, amount: Decimal, timestamp: Timestamp) {
        debug_assert!(amount <= self.remaining(), "cannot fill more than remaining");
        self.filled_quantity += amount;
        self.updated_at = timestamp;
        self.status = if self.is_filled() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Margin backing the still-unfilled portion.
    pub fn remaining_margin(&self) -> Quote {
        if self.quantity.is_zero() {
            return Quote::zero();
        }
        self.margin.mul(self.remaining() / self.quantity)
    }
}
