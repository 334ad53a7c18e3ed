// 7.0: funding rates. on a fixed interval (8h default) perps settle a
// payment between longs and shorts to pull the mark toward the index.
// 7.1 has the rate math, 7.2 the per-symbol tracker with the settlement
// watermark that makes replays idempotent, 7.3 the rebalance that keeps
// the pool zero-sum when open interest is uneven.

use crate::position::Position;
use crate::types::{PositionId, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingParams {
    /// Settlement interval in milliseconds. Default 8 hours.
    pub interval_ms: i64,
    /// Flat interest component added to the premium.
    pub interest_rate: Decimal,
    /// Premium amplification before clamping.
    pub premium_multiplier: Decimal,
    /// Clamp bounds on the pre-division rate.
    pub min_rate: Decimal,
    pub max_rate: Decimal,
    /// Settlement intervals per day; the clamped rate is divided by this.
    pub intervals_per_day: Decimal,
}

impl Default for FundingParams {
    fn default() -> Self {
        Self {
            interval_ms: 8 * 3600 * 1000,
            interest_rate: dec!(0.0001),
            premium_multiplier: dec!(3),
            min_rate: dec!(-0.0075),
            max_rate: dec!(0.0075),
            intervals_per_day: dec!(3),
        }
    }
}

/// One settled rate, kept as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: Symbol,
    pub rate: Decimal,
    pub premium: Decimal,
    pub mark_price: Price,
    pub index_price: Price,
    pub settled_at: Timestamp,
}

/// One position's share of a settlement. Positive = this user pays.
#[derive(Debug, Clone)]
pub struct FundingPayment {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub side: Side,
    pub amount: Quote,
}

#[derive(Debug, Clone)]
pub struct FundingSettlement {
    pub rate: FundingRate,
    pub payments: Vec<FundingPayment>,
    pub total_paid_by_longs: Quote,
    pub total_received_by_shorts: Quote,
}

// 7.1: premium = (mark - index) / index. positive means perp trades rich.
pub fn premium_index(mark: Price, index: Price) -> Decimal {
    (mark.value() - index.value()) / index.value()
}

/// clamp(premium * multiplier + interest, min, max) / intervalsPerDay.
pub fn funding_rate(premium: Decimal, params: &FundingParams) -> Decimal {
    let raw = premium * params.premium_multiplier + params.interest_rate;
    raw.max(params.min_rate).min(params.max_rate) / params.intervals_per_day
}

/// Positive = position pays, negative = position receives. Longs pay when
/// the rate is positive, shorts when it is negative.
pub fn funding_payment(position: &Position, mark: Price, rate: Decimal) -> Quote {
    position.notional(mark).mul(rate * position.side.sign())
}

// 7.3: a settlement is a transfer, never a mint. forced closes have no
// counterparty trade, so open interest can be lopsided; receiving-side
// credits are pro-rated against the paying total, the last receiver takes
// the division remainder, and with nobody on the receiving side nothing
// moves at all.
fn rebalance(payments: &mut [FundingPayment]) {
    let paid: Decimal = payments
        .iter()
        .map(|p| p.amount.value())
        .filter(|v| *v > Decimal::ZERO)
        .sum();
    let owed: Decimal = payments
        .iter()
        .map(|p| -p.amount.value())
        .filter(|v| *v > Decimal::ZERO)
        .sum();
    if paid == owed {
        return;
    }
    if owed.is_zero() {
        for payment in payments.iter_mut() {
            payment.amount = Quote::zero();
        }
        return;
    }

    let mut receivers: Vec<usize> = payments
        .iter()
        .enumerate()
        .filter(|(_, p)| p.amount.value() < Decimal::ZERO)
        .map(|(i, _)| i)
        .collect();
    let last = receivers.pop().expect("owed is nonzero");
    let mut distributed = Decimal::ZERO;
    for i in receivers {
        let share = paid * payments[i].amount.value().abs() / owed;
        distributed += share;
        payments[i].amount = Quote::new(-share);
    }
    payments[last].amount = Quote::new(distributed - paid);
}

/// Per-symbol rate history and settlement watermark.
#[derive(Debug)]
pub struct FundingTracker {
    symbol: Symbol,
    params: FundingParams,
    history: Vec<FundingRate>,
    /// Last settlement time. A tick before watermark + interval is a no-op,
    /// which makes crash/replay of the funding loop safe.
    last_settled: Option<Timestamp>,
}

impl FundingTracker {
    pub fn new(symbol: Symbol, params: FundingParams) -> Self {
        Self {
            symbol,
            params,
            history: Vec::new(),
            last_settled: None,
        }
    }

    /// Rebuild a tracker from persisted history and watermark.
    pub fn restore(
        symbol: Symbol,
        params: FundingParams,
        history: Vec<FundingRate>,
        last_settled: Option<Timestamp>,
    ) -> Self {
        Self {
            symbol,
            params,
            history,
            last_settled,
        }
    }

    pub fn params(&self) -> &FundingParams {
        &self.params
    }

    pub fn last_settled(&self) -> Option<Timestamp> {
        self.last_settled
    }

    pub fn current_rate(&self) -> Option<&FundingRate> {
        self.history.last()
    }

    pub fn history(&self) -> &[FundingRate] {
        &self.history
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.last_settled {
            None => true,
            Some(at) => at.elapsed_ms(&now) >= self.params.interval_ms,
        }
    }

    // 7.2: compute the rate and every open position's payment, advance the
    // watermark. returns None when the interval has not elapsed; callers
    // may tick as often as they like.
    pub fn settle<'a>(
        &mut self,
        positions: impl Iterator<Item = &'a Position>,
        mark: Price,
        index: Price,
        now: Timestamp,
    ) -> Option<FundingSettlement> {
        if !self.is_due(now) {
            return None;
        }

        let premium = premium_index(mark, index);
        let rate = funding_rate(premium, &self.params);
        let record = FundingRate {
            symbol: self.symbol.clone(),
            rate,
            premium,
            mark_price: mark,
            index_price: index,
            settled_at: now,
        };

        let mut payments: Vec<FundingPayment> = positions
            .filter(|p| p.is_open())
            .map(|position| FundingPayment {
                position_id: position.id,
                user_id: position.user_id,
                side: position.side,
                amount: funding_payment(position, mark, rate),
            })
            .collect();
        rebalance(&mut payments);

        let mut paid_by_longs = Quote::zero();
        let mut received_by_shorts = Quote::zero();
        for payment in &payments {
            match payment.side {
                Side::Buy => paid_by_longs = paid_by_longs.add(payment.amount),
                Side::Sell => received_by_shorts = received_by_shorts.sub(payment.amount),
            }
        }

        self.history.push(record.clone());
        self.last_settled = Some(now);

        Some(FundingSettlement {
            rate: record,
            payments,
            total_paid_by_longs: paid_by_longs,
            total_received_by_shorts: received_by_shorts,
        })
    }
}
