//! Liquidation queue, state machine and insurance fund.
//!
//! A position flagged by the risk sweep moves through
//! `Normal -> AtRisk -> Queued -> Liquidating -> Closed`. The queue is
//! per-side and priority ordered so the riskiest positions close first.
//! Fees and shortfalls settle against the insurance fund; whatever the
//! fund cannot cover is handed to the ADL engine, the fund balance never
//! goes negative.

use crate::position::Position;
use crate::types::{PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationParams {
    /// Fee charged on the closed notional (0.005 = 0.5%).
    pub fee_rate: Decimal,
    /// Per-position processing lock lifetime in milliseconds. An expired
    /// lock means the previous worker died and the entry may be retried.
    pub lock_ttl_ms: i64,
    /// Cap on positions drained from the queue in one cycle.
    pub max_per_cycle: usize,
}

impl Default for LiquidationParams {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.005),
            lock_ttl_ms: 30_000,
            max_per_cycle: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationState {
    Normal,
    AtRisk,
    Queued,
    Liquidating,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationQueueEntry {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub side: Side,
    pub priority: Decimal,
    pub enqueued_at: Timestamp,
}

impl PartialEq for LiquidationQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.position_id == other.position_id && self.priority == other.priority
    }
}

impl Eq for LiquidationQueueEntry {}

impl PartialOrd for LiquidationQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LiquidationQueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap on priority, earliest enqueue breaks ties
        self.priority
            .cmp(&other.priority)
            .then(other.enqueued_at.0.cmp(&self.enqueued_at.0))
            .then(other.position_id.0.cmp(&self.position_id.0))
    }
}

// (1/marginRatio) * leverage * log10(size); riskiest first. ratios at or
// below zero mean equity is already gone, those jump the whole queue.
pub fn liquidation_priority(margin_ratio: Decimal, leverage: Decimal, size: Decimal) -> Decimal {
    if margin_ratio <= Decimal::ZERO {
        return Decimal::MAX;
    }
    // sub-unit sizes would go negative under log10, floor the factor
    let size_factor = size.log10().max(dec!(0.001));
    (Decimal::ONE / margin_ratio) * leverage * size_factor
}

/// Fee on a forced close: quantity * mark * feeRate.
pub fn liquidation_fee(quantity: Decimal, mark: Price, params: &LiquidationParams) -> Quote {
    Quote::new(quantity * mark.value() * params.fee_rate)
}

/// Bad debt left after a forced close: negative equity, floored at zero.
pub fn liquidation_shortfall(margin: Quote, close_pnl: Quote) -> Quote {
    let equity = margin.value() + close_pnl.value();
    if equity < Decimal::ZERO {
        Quote::new(-equity)
    } else {
        Quote::zero()
    }
}

/// Per-symbol backstop for liquidation shortfalls. Balance never goes
/// negative; what it cannot cover escalates to ADL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceFund {
    pub symbol: Symbol,
    pub balance: Quote,
    pub total_injections: Quote,
    pub total_payouts: Quote,
}

impl InsuranceFund {
    pub fn new(symbol: Symbol, initial_balance: Quote) -> Self {
        Self {
            symbol,
            balance: initial_balance,
            total_injections: initial_balance,
            total_payouts: Quote::zero(),
        }
    }

    pub fn inject(&mut self, amount: Quote) {
        self.balance = self.balance.add(amount);
        self.total_injections = self.total_injections.add(amount);
    }

    pub fn can_cover(&self, amount: Quote) -> bool {
        self.balance.value() >= amount.value()
    }

    /// Draw up to `amount`. Returns what was actually covered.
    pub fn cover(&mut self, amount: Quote) -> Quote {
        let covered = amount.min(self.balance);
        self.balance = self.balance.sub(covered);
        self.total_payouts = self.total_payouts.add(covered);
        covered
    }
}

/// One settled forced close.
#[derive(Debug, Clone)]
pub struct LiquidationRecord {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub side: Side,
    pub quantity: Decimal,
    pub mark_price: Price,
    pub fee: Quote,
    pub shortfall: Quote,
    pub covered_by_fund: Quote,
    /// Uncovered remainder handed to the ADL engine.
    pub escalated: Quote,
}

/// Per-symbol queue and state tracker.
#[derive(Debug)]
pub struct LiquidationEngine {
    symbol: Symbol,
    params: LiquidationParams,
    fund: InsuranceFund,
    states: HashMap<PositionId, LiquidationState>,
    buy_queue: BinaryHeap<LiquidationQueueEntry>,
    sell_queue: BinaryHeap<LiquidationQueueEntry>,
    /// position -> lock acquisition time; stale locks are re-acquirable.
    locks: HashMap<PositionId, Timestamp>,
}

impl LiquidationEngine {
    pub fn new(symbol: Symbol, params: LiquidationParams, fund: InsuranceFund) -> Self {
        Self {
            symbol,
            params,
            fund,
            states: HashMap::new(),
            buy_queue: BinaryHeap::new(),
            sell_queue: BinaryHeap::new(),
            locks: HashMap::new(),
        }
    }

    pub fn params(&self) -> &LiquidationParams {
        &self.params
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn fund(&self) -> &InsuranceFund {
        &self.fund
    }

    pub fn fund_mut(&mut self) -> &mut InsuranceFund {
        &mut self.fund
    }

    pub fn state(&self, id: PositionId) -> LiquidationState {
        self.states
            .get(&id)
            .copied()
            .unwrap_or(LiquidationState::Normal)
    }

    pub fn mark_at_risk(&mut self, id: PositionId) {
        if self.state(id) == LiquidationState::Normal {
            self.states.insert(id, LiquidationState::AtRisk);
        }
    }

    /// A closed row reopened with fresh quantity starts a new lifecycle.
    pub fn reset_closed(&mut self, id: PositionId) {
        if self.state(id) == LiquidationState::Closed {
            self.states.insert(id, LiquidationState::Normal);
        }
    }

    pub fn mark_normal(&mut self, id: PositionId) {
        // only an un-queued flag can be walked back; once queued the entry
        // is re-checked against a fresh mark at processing time instead
        if self.state(id) == LiquidationState::AtRisk {
            self.states.insert(id, LiquidationState::Normal);
        }
    }

    // 5.1: AtRisk -> Queued. dedupe is by state, an already queued or
    // processing position is never enqueued twice.
    pub fn enqueue(&mut self, position: &Position, margin_ratio: Decimal, now: Timestamp) -> bool {
        match self.state(position.id) {
            LiquidationState::Normal | LiquidationState::AtRisk => {}
            _ => return false,
        }

        let priority = liquidation_priority(
            margin_ratio,
            position.leverage.value(),
            position.quantity,
        );
        let entry = LiquidationQueueEntry {
            position_id: position.id,
            user_id: position.user_id,
            side: position.side,
            priority,
            enqueued_at: now,
        };

        self.states.insert(position.id, LiquidationState::Queued);
        match position.side {
            Side::Buy => self.buy_queue.push(entry),
            Side::Sell => self.sell_queue.push(entry),
        }
        true
    }

    fn try_lock(&mut self, id: PositionId, now: Timestamp) -> bool {
        if let Some(acquired_at) = self.locks.get(&id) {
            if acquired_at.elapsed_ms(&now) < self.params.lock_ttl_ms {
                return false;
            }
        }
        self.locks.insert(id, now);
        true
    }

    fn release_lock(&mut self, id: PositionId) {
        self.locks.remove(&id);
    }

    // 5.2: Queued -> Liquidating. pops the highest-priority entry on either
    // side whose lock is free. entries under a held, unexpired lock belong
    // to another worker and are stepped over, so one busy position never
    // stalls the rest of the drain.
    pub fn next(&mut self, now: Timestamp) -> Option<LiquidationQueueEntry> {
        let mut locked = Vec::new();
        let picked = loop {
            let pick_buy = match (self.buy_queue.peek(), self.sell_queue.peek()) {
                (None, None) => break None,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(b), Some(s)) => b.priority >= s.priority,
            };
            let Some(entry) = (if pick_buy {
                self.buy_queue.pop()
            } else {
                self.sell_queue.pop()
            }) else {
                break None;
            };

            // stale entries (already closed or walked back) are dropped
            if self.state(entry.position_id) != LiquidationState::Queued {
                continue;
            }
            if !self.try_lock(entry.position_id, now) {
                locked.push(entry);
                continue;
            }

            self.states
                .insert(entry.position_id, LiquidationState::Liquidating);
            break Some(entry);
        };

        // stepped-over entries go back for a later cycle
        for entry in locked {
            match entry.side {
                Side::Buy => self.buy_queue.push(entry),
                Side::Sell => self.sell_queue.push(entry),
            }
        }
        picked
    }

    // 5.3: Liquidating -> Closed. the position has been force-closed by the
    // caller; here the fee and shortfall settle against the fund.
    pub fn settle(
        &mut self,
        entry: &LiquidationQueueEntry,
        quantity: Decimal,
        mark: Price,
        margin: Quote,
        close_pnl: Quote,
    ) -> LiquidationRecord {
        let fee = liquidation_fee(quantity, mark, &self.params);
        let shortfall = liquidation_shortfall(margin, close_pnl);
        let covered = self.fund.cover(shortfall);
        let escalated = shortfall.sub(covered);

        self.states
            .insert(entry.position_id, LiquidationState::Closed);
        self.release_lock(entry.position_id);

        LiquidationRecord {
            position_id: entry.position_id,
            user_id: entry.user_id,
            side: entry.side,
            quantity,
            mark_price: mark,
            fee,
            shortfall,
            covered_by_fund: covered,
            escalated,
        }
    }

    /// Worker died mid-processing: put the entry back. Its lock is left in
    /// place, so the retry waits out the TTL.
    pub fn requeue_stalled(&mut self, entry: LiquidationQueueEntry) {
        if self.state(entry.position_id) != LiquidationState::Liquidating {
            return;
        }
        self.states
            .insert(entry.position_id, LiquidationState::Queued);
        match entry.side {
            Side::Buy => self.buy_queue.push(entry),
            Side::Sell => self.sell_queue.push(entry),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.buy_queue.len() + self.sell_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::margin::MarginParams;
    use crate::position::PositionManager;
    use crate::types::Leverage;

    fn open(mgr: &mut PositionManager, user: u64, side: Side, qty: Decimal) -> PositionId {
        mgr.apply_fill(
            UserId(user),
            side,
            qty,
            Price::new_unchecked(dec!(50000)),
            Leverage::new(dec!(10)).unwrap(),
            Quote::new(qty * dec!(5000)),
            Timestamp::from_millis(0),
        )
        .unwrap()
        .opened
        .unwrap()
    }

    fn engine() -> LiquidationEngine {
        LiquidationEngine::new(
            Symbol::new("BTC-PERP"),
            LiquidationParams::default(),
            InsuranceFund::new(Symbol::new("BTC-PERP"), Quote::new(dec!(100_000))),
        )
    }

    #[test]
    fn priority_orders_riskiest_first() {
        // lower margin ratio and higher leverage both raise priority
        let risky = liquidation_priority(dec!(0.5), dec!(20), dec!(10));
        let safer = liquidation_priority(dec!(0.9), dec!(5), dec!(10));
        assert!(risky > safer);

        // negative equity jumps everything
        assert_eq!(liquidation_priority(dec!(-0.1), dec!(5), dec!(10)), Decimal::MAX);
    }

    #[test]
    fn queue_pops_by_priority_across_sides() {
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let a = open(&mut mgr, 1, Side::Buy, dec!(10));
        let b = open(&mut mgr, 2, Side::Sell, dec!(10));
        let mut eng = engine();

        let now = Timestamp::from_millis(0);
        assert!(eng.enqueue(mgr.get(a).unwrap(), dec!(0.9), now));
        assert!(eng.enqueue(mgr.get(b).unwrap(), dec!(0.3), now));

        // the sell at ratio 0.3 outranks the buy at 0.9
        let first = eng.next(now).unwrap();
        assert_eq!(first.position_id, b);
        let second = eng.next(now).unwrap();
        assert_eq!(second.position_id, a);
        assert!(eng.next(now).is_none());
    }

    #[test]
    fn duplicate_enqueue_rejected() {
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let id = open(&mut mgr, 1, Side::Buy, dec!(1));
        let mut eng = engine();

        let now = Timestamp::from_millis(0);
        assert!(eng.enqueue(mgr.get(id).unwrap(), dec!(0.5), now));
        assert!(!eng.enqueue(mgr.get(id).unwrap(), dec!(0.5), now));
        assert_eq!(eng.queued_len(), 1);
    }

    #[test]
    fn state_machine_walks_to_closed() {
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let id = open(&mut mgr, 1, Side::Buy, dec!(1));
        let mut eng = engine();
        let now = Timestamp::from_millis(0);

        assert_eq!(eng.state(id), LiquidationState::Normal);
        eng.mark_at_risk(id);
        assert_eq!(eng.state(id), LiquidationState::AtRisk);
        eng.enqueue(mgr.get(id).unwrap(), dec!(0.5), now);
        assert_eq!(eng.state(id), LiquidationState::Queued);

        let entry = eng.next(now).unwrap();
        assert_eq!(eng.state(id), LiquidationState::Liquidating);

        let record = eng.settle(
            &entry,
            dec!(1),
            Price::new_unchecked(dec!(45000)),
            Quote::new(dec!(5000)),
            Quote::new(dec!(-5000)),
        );
        assert_eq!(eng.state(id), LiquidationState::Closed);
        // equity exactly zero, no shortfall; fee = 1 * 45000 * 0.5%
        assert_eq!(record.shortfall.value(), dec!(0));
        assert_eq!(record.fee.value(), dec!(225));
    }

    #[test]
    fn shortfall_draws_fund_then_escalates() {
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let id = open(&mut mgr, 1, Side::Buy, dec!(1));
        let mut eng = LiquidationEngine::new(
            Symbol::new("BTC-PERP"),
            LiquidationParams::default(),
            InsuranceFund::new(Symbol::new("BTC-PERP"), Quote::new(dec!(300))),
        );
        let now = Timestamp::from_millis(0);
        eng.enqueue(mgr.get(id).unwrap(), dec!(-0.1), now);
        let entry = eng.next(now).unwrap();

        // closed below bankruptcy: margin 5000, close pnl -6000, bad debt 1000
        let record = eng.settle(
            &entry,
            dec!(1),
            Price::new_unchecked(dec!(44000)),
            Quote::new(dec!(5000)),
            Quote::new(dec!(-6000)),
        );

        assert_eq!(record.shortfall.value(), dec!(1000));
        assert_eq!(record.covered_by_fund.value(), dec!(300));
        assert_eq!(record.escalated.value(), dec!(700));
        // fund drained to zero, never negative
        assert_eq!(eng.fund().balance.value(), dec!(0));
        assert_eq!(eng.fund().total_payouts.value(), dec!(300));
    }

    #[test]
    fn lock_blocks_until_ttl_expires() {
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let id = open(&mut mgr, 1, Side::Buy, dec!(1));
        let mut eng = engine();
        let now = Timestamp::from_millis(0);

        eng.enqueue(mgr.get(id).unwrap(), dec!(0.5), now);
        let entry = eng.next(now).unwrap();

        // worker stalls, entry goes back to the queue still locked
        eng.requeue_stalled(entry);
        assert!(eng.next(Timestamp::from_millis(1000)).is_none());

        // after the TTL the lock is re-acquirable
        let retried = eng.next(Timestamp::from_millis(40_000)).unwrap();
        assert_eq!(retried.position_id, id);
    }

    #[test]
    fn locked_head_does_not_stall_lower_priority() {
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let a = open(&mut mgr, 1, Side::Buy, dec!(10));
        let b = open(&mut mgr, 2, Side::Sell, dec!(10));
        let mut eng = engine();
        let now = Timestamp::from_millis(0);

        eng.enqueue(mgr.get(a).unwrap(), dec!(0.3), now);
        eng.enqueue(mgr.get(b).unwrap(), dec!(0.8), now);

        // a worker takes the riskiest entry and stalls on it
        let top = eng.next(now).unwrap();
        assert_eq!(top.position_id, a);
        eng.requeue_stalled(top);

        // the held lock is stepped over, the next entry still drains
        let next = eng.next(Timestamp::from_millis(1000)).unwrap();
        assert_eq!(next.position_id, b);

        // and the stalled entry comes back once its lock expires
        let retried = eng.next(Timestamp::from_millis(40_000)).unwrap();
        assert_eq!(retried.position_id, a);
    }

    #[test]
    fn fund_injection_tracked() {
        let mut fund = InsuranceFund::new(Symbol::new("BTC-PERP"), Quote::new(dec!(1000)));
        fund.inject(Quote::new(dec!(500)));
        assert_eq!(fund.balance.value(), dec!(1500));
        assert_eq!(fund.total_injections.value(), dec!(1500));
        assert!(fund.can_cover(Quote::new(dec!(1500))));
        assert!(!fund.can_cover(Quote::new(dec!(1501))));
    }
}
