//! Pre-trade admission gate and continuous position risk checks.
//!
//! Every order passes through `RiskEngine::admit` before it may touch the
//! book. A rejection here is synchronous and leaves zero state behind. The
//! same engine also revalues open positions on each mark update and flags
//! the ones that crossed the maintenance floor, feeding the liquidation
//! queue.

use crate::margin::{maintenance_margin, margin_ratio, notional_value, MarginParams};
use crate::position::Position;
use crate::types::{Leverage, Price, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Per-symbol admission limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Hard cap on quantity of a single (user, side) position.
    pub max_position_quantity: Decimal,
    /// Rolling 24h notional cap per user, in quote currency.
    pub daily_notional_cap: Quote,
    /// Maximum |limit - mark| / mark allowed at admission (0.1 = 10%).
    pub max_price_deviation: Decimal,
    /// Minimum gap between two orders from the same user, milliseconds.
    pub min_order_interval_ms: i64,
    /// Optional loss fraction of margin at which a position is flagged
    /// for protective close (0.8 = flag once 80% of margin is gone).
    pub stop_loss_ratio: Option<Decimal>,
    /// Optional profit fraction of margin at which a take-profit flag fires.
    pub take_profit_ratio: Option<Decimal>,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            max_position_quantity: dec!(1000),
            daily_notional_cap: Quote::new(dec!(50_000_000)),
            max_price_deviation: dec!(0.1),
            min_order_interval_ms: 10,
            stop_loss_ratio: None,
            take_profit_ratio: None,
        }
    }
}

/// Typed admission rejection. No book mutation has happened when one of
/// these comes back.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskViolation {
    #[error("leverage {requested} exceeds maximum {maximum}")]
    LeverageExceeded { requested: Decimal, maximum: Decimal },

    #[error("resulting position {resulting} exceeds cap {maximum}")]
    PositionTooLarge { resulting: Decimal, maximum: Decimal },

    #[error("24h notional {accumulated} + {requested} exceeds cap {maximum}")]
    DailyVolumeExceeded {
        accumulated: Decimal,
        requested: Decimal,
        maximum: Decimal,
    },

    #[error("price {price} deviates {deviation} from mark {mark}, cap {maximum}")]
    PriceDeviation {
        price: Decimal,
        mark: Decimal,
        deviation: Decimal,
        maximum: Decimal,
    },

    #[error("order arrived {elapsed_ms}ms after previous, minimum {minimum_ms}ms")]
    OrderTooSoon { elapsed_ms: i64, minimum_ms: i64 },
}

/// Outcome of a continuous risk sweep over one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskFlag {
    Normal,
    /// Margin ratio fell below 1. Candidate for the liquidation queue.
    AtRisk { margin_ratio: Decimal },
    /// Loss consumed the configured fraction of margin.
    StopLoss { pnl: Decimal },
    /// Profit reached the configured fraction of margin.
    TakeProfit { pnl: Decimal },
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default)]
struct UserActivity {
    last_order_at: Option<Timestamp>,
    /// (timestamp, notional) entries inside the rolling 24h window.
    notional_window: VecDeque<(Timestamp, Decimal)>,
}

impl UserActivity {
    fn prune(&mut self, now: Timestamp) {
        let cutoff = now.0 - DAY_MS;
        while let Some((ts, _)) = self.notional_window.front() {
            if ts.0 >= cutoff {
                break;
            }
            self.notional_window.pop_front();
        }
    }

    fn window_total(&self) -> Decimal {
        self.notional_window.iter().map(|(_, n)| *n).sum()
    }
}

/// Admission gate for one symbol.
#[derive(Debug)]
pub struct RiskEngine {
    symbol: Symbol,
    params: RiskParams,
    margin_params: MarginParams,
    activity: HashMap<UserId, UserActivity>,
}

impl RiskEngine {
    pub fn new(symbol: Symbol, params: RiskParams, margin_params: MarginParams) -> Self {
        Self {
            symbol,
            params,
            margin_params,
            activity: HashMap::new(),
        }
    }

    pub fn params(&self) -> &RiskParams {
        &self.params
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    // 4.0: pre-trade gate. all checks run before anything touches the book,
    // the first failure short-circuits. on success the order is recorded
    // against the user's rate limit and rolling notional window.
    pub fn admit(
        &mut self,
        user_id: UserId,
        quantity: Decimal,
        leverage: Leverage,
        limit_price: Option<Price>,
        mark_price: Price,
        current_position_quantity: Decimal,
        now: Timestamp,
    ) -> Result<(), RiskViolation> {
        if leverage.value() > self.margin_params.max_leverage.value() {
            return Err(RiskViolation::LeverageExceeded {
                requested: leverage.value(),
                maximum: self.margin_params.max_leverage.value(),
            });
        }

        let resulting = current_position_quantity + quantity;
        if resulting > self.params.max_position_quantity {
            return Err(RiskViolation::PositionTooLarge {
                resulting,
                maximum: self.params.max_position_quantity,
            });
        }

        if let Some(price) = limit_price {
            let deviation = ((price.value() - mark_price.value()) / mark_price.value()).abs();
            if deviation > self.params.max_price_deviation {
                return Err(RiskViolation::PriceDeviation {
                    price: price.value(),
                    mark: mark_price.value(),
                    deviation,
                    maximum: self.params.max_price_deviation,
                });
            }
        }

        let notional = notional_value(quantity, limit_price.unwrap_or(mark_price)).value();
        let activity = self.activity.entry(user_id).or_default();
        activity.prune(now);

        if let Some(last) = activity.last_order_at {
            let elapsed = last.elapsed_ms(&now);
            if elapsed < self.params.min_order_interval_ms {
                return Err(RiskViolation::OrderTooSoon {
                    elapsed_ms: elapsed,
                    minimum_ms: self.params.min_order_interval_ms,
                });
            }
        }

        let accumulated = activity.window_total();
        if accumulated + notional > self.params.daily_notional_cap.value() {
            return Err(RiskViolation::DailyVolumeExceeded {
                accumulated,
                requested: notional,
                maximum: self.params.daily_notional_cap.value(),
            });
        }

        activity.last_order_at = Some(now);
        activity.notional_window.push_back((now, notional));
        Ok(())
    }

    // 4.1: continuous check, run against every open position on each mark
    // update. margin ratio below 1 dominates the stop/take flags.
    pub fn check_liquidation_risk(&self, position: &Position, mark: Price) -> RiskFlag {
        if !position.is_open() {
            return RiskFlag::Normal;
        }

        let upnl = position.unrealized_pnl_at(mark);
        let mm = maintenance_margin(position.notional(mark), &self.margin_params);
        let ratio = margin_ratio(position.margin, upnl, mm);

        if ratio < Decimal::ONE {
            return RiskFlag::AtRisk { margin_ratio: ratio };
        }

        if !position.margin.value().is_zero() {
            let pnl_fraction = upnl.value() / position.margin.value();
            if let Some(stop) = self.params.stop_loss_ratio {
                if pnl_fraction <= -stop {
                    return RiskFlag::StopLoss { pnl: upnl.value() };
                }
            }
            if let Some(take) = self.params.take_profit_ratio {
                if pnl_fraction >= take {
                    return RiskFlag::TakeProfit { pnl: upnl.value() };
                }
            }
        }

        RiskFlag::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionManager;

    fn engine() -> RiskEngine {
        RiskEngine::new(
            Symbol::new("BTC-PERP"),
            RiskParams::default(),
            MarginParams::default(),
        )
    }

    fn admit_simple(eng: &mut RiskEngine, user: u64, ts: i64) -> Result<(), RiskViolation> {
        eng.admit(
            UserId(user),
            dec!(1),
            Leverage::new(dec!(10)).unwrap(),
            Some(Price::new_unchecked(dec!(50000))),
            Price::new_unchecked(dec!(50000)),
            Decimal::ZERO,
            Timestamp::from_millis(ts),
        )
    }

    #[test]
    fn plain_order_admitted() {
        let mut eng = engine();
        assert!(admit_simple(&mut eng, 1, 0).is_ok());
    }

    #[test]
    fn leverage_over_max_rejected() {
        let mut eng = engine();
        let err = eng.admit(
            UserId(1),
            dec!(1),
            Leverage::new(dec!(150)).unwrap(),
            None,
            Price::new_unchecked(dec!(50000)),
            Decimal::ZERO,
            Timestamp::from_millis(0),
        );
        assert!(matches!(err, Err(RiskViolation::LeverageExceeded { .. })));
    }

    #[test]
    fn position_cap_counts_existing_quantity() {
        let mut eng = engine();
        let err = eng.admit(
            UserId(1),
            dec!(2),
            Leverage::new(dec!(10)).unwrap(),
            None,
            Price::new_unchecked(dec!(50000)),
            dec!(999), // already near the 1000 cap
            Timestamp::from_millis(0),
        );
        assert!(matches!(err, Err(RiskViolation::PositionTooLarge { .. })));
    }

    #[test]
    fn price_far_from_mark_rejected() {
        let mut eng = engine();
        let err = eng.admit(
            UserId(1),
            dec!(1),
            Leverage::new(dec!(10)).unwrap(),
            Some(Price::new_unchecked(dec!(60000))), // 20% above mark
            Price::new_unchecked(dec!(50000)),
            Decimal::ZERO,
            Timestamp::from_millis(0),
        );
        assert!(matches!(err, Err(RiskViolation::PriceDeviation { .. })));
    }

    #[test]
    fn rapid_fire_orders_rejected() {
        let mut eng = engine();
        assert!(admit_simple(&mut eng, 1, 0).is_ok());
        let err = admit_simple(&mut eng, 1, 5); // under the 10ms minimum
        assert!(matches!(err, Err(RiskViolation::OrderTooSoon { .. })));
        // another user is unaffected
        assert!(admit_simple(&mut eng, 2, 5).is_ok());
        // same user after the interval is fine
        assert!(admit_simple(&mut eng, 1, 20).is_ok());
    }

    #[test]
    fn daily_notional_cap_enforced_and_rolls_off() {
        let mut eng = RiskEngine::new(
            Symbol::new("BTC-PERP"),
            RiskParams {
                daily_notional_cap: Quote::new(dec!(100_000)),
                ..RiskParams::default()
            },
            MarginParams::default(),
        );

        // 1 BTC at 50k twice = 100k, at the cap
        assert!(admit_simple(&mut eng, 1, 0).is_ok());
        assert!(admit_simple(&mut eng, 1, 1000).is_ok());
        let err = admit_simple(&mut eng, 1, 2000);
        assert!(matches!(err, Err(RiskViolation::DailyVolumeExceeded { .. })));

        // 24h later the window has drained
        assert!(admit_simple(&mut eng, 1, 2000 + 24 * 60 * 60 * 1000).is_ok());
    }

    #[test]
    fn margin_ratio_below_one_flags_at_risk() {
        let eng = engine();
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let outcome = mgr
            .apply_fill(
                UserId(1),
                Side::Buy,
                dec!(1),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(10)).unwrap(),
                Quote::new(dec!(5000)),
                Timestamp::from_millis(0),
            )
            .unwrap();
        let position = mgr.get(outcome.opened.unwrap()).unwrap();

        // equity 300 against maintenance 226.5: still above the floor
        let flag = eng.check_liquidation_risk(position, Price::new_unchecked(dec!(45300)));
        assert_eq!(flag, RiskFlag::Normal);

        // at 45000 equity is 0, ratio 0 < 1
        let flag = eng.check_liquidation_risk(position, Price::new_unchecked(dec!(45000)));
        assert!(matches!(flag, RiskFlag::AtRisk { .. }));
    }

    #[test]
    fn stop_loss_flag_fires_before_liquidation() {
        let eng = RiskEngine::new(
            Symbol::new("BTC-PERP"),
            RiskParams {
                stop_loss_ratio: Some(dec!(0.5)),
                ..RiskParams::default()
            },
            MarginParams::default(),
        );
        let mut mgr = PositionManager::new(Symbol::new("BTC-PERP"), MarginParams::default());
        let outcome = mgr
            .apply_fill(
                UserId(1),
                Side::Buy,
                dec!(1),
                Price::new_unchecked(dec!(50000)),
                Leverage::new(dec!(10)).unwrap(),
                Quote::new(dec!(5000)),
                Timestamp::from_millis(0),
            )
            .unwrap();
        let position = mgr.get(outcome.opened.unwrap()).unwrap();

        // down 3000 of 5000 margin: 60% loss, past the 50% stop
        let flag = eng.check_liquidation_risk(position, Price::new_unchecked(dec!(47000)));
        assert!(matches!(flag, RiskFlag::StopLoss { .. }));
    }
}
