// 8.0: every externally-visible state change produces an event. transport
// and notification layers consume these off the bus; the core only ever
// publishes. a bus with no subscribers drops events silently, publishing
// never blocks the matching path.

use crate::funding::FundingRate;
use crate::matching::Trade;
use crate::types::{OrderId, PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use crate::order::OrderStatus;
use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    OrderCreated(OrderEvent),
    OrderUpdated(OrderEvent),
    OrderCanceled(OrderEvent),
    TradeExecuted(Trade),
    PositionLiquidated(LiquidationEvent),
    PositionAdl(AdlEvent),
    FundingUpdated(FundingEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub remaining_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub mark_price: Price,
    pub fee: Quote,
    pub shortfall: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdlEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub deleveraged_quantity: Decimal,
    pub price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEvent {
    pub rate: FundingRate,
    pub positions_settled: usize,
}

/// Publish-only fan-out channel. Subscribers that fall away (dropped
/// receiver) are pruned on the next publish.
#[derive(Debug)]
pub struct EventBus {
    subscribers: Vec<Sender<Event>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            next_id: 1,
        }
    }

    pub fn subscribe(&mut self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, timestamp: Timestamp, payload: EventPayload) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let event = Event {
            id,
            timestamp,
            payload,
        };
        self.subscribers.retain(|tx| {
            !matches!(
                tx.try_send(event.clone()),
                Err(TrySendError::Disconnected(_))
            )
        });
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order_event() -> EventPayload {
        EventPayload::OrderCreated(OrderEvent {
            order_id: OrderId(1),
            user_id: UserId(1),
            symbol: Symbol::new("BTC-PERP"),
            side: Side::Buy,
            status: OrderStatus::New,
            filled_quantity: dec!(0),
            remaining_quantity: dec!(1),
        })
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let mut bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();

        bus.publish(Timestamp::from_millis(0), order_event());

        assert!(matches!(
            rx1.try_recv().unwrap().payload,
            EventPayload::OrderCreated(_)
        ));
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn event_ids_are_monotonic() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();

        bus.publish(Timestamp::from_millis(0), order_event());
        bus.publish(Timestamp::from_millis(1), order_event());

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn dropped_subscriber_pruned() {
        let mut bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.publish(Timestamp::from_millis(0), order_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let mut bus = EventBus::new();
        let id = bus.publish(Timestamp::from_millis(0), order_event());
        assert_eq!(id, EventId(1));
    }
}
