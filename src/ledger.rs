//! Balance ledger seam.
//!
//! Margin lock and release, fees and funding transfers all go through
//! [`BalanceLedger`]. The engine freezes margin at admission time, before
//! the order can touch the book; once a freeze has succeeded the later
//! frozen-side operations cannot legitimately fail, which is what makes
//! the fill -> position -> margin transfer sequence atomic under the
//! per-symbol lock.

use crate::types::{Quote, UserId};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("user {user_id:?} has {available} {currency} available, needs {requested}")]
    InsufficientAvailable {
        user_id: UserId,
        currency: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("user {user_id:?} has {frozen} {currency} frozen, needs {requested}")]
    InsufficientFrozen {
        user_id: UserId,
        currency: String,
        frozen: Decimal,
        requested: Decimal,
    },
}

pub trait BalanceLedger: Send + Sync {
    /// Move available balance into the frozen bucket. This is the only
    /// ledger call that may reject an order.
    fn freeze(&self, user_id: UserId, currency: &str, amount: Quote) -> Result<(), LedgerError>;

    /// Return frozen balance to available (cancel, unfilled remainder).
    fn unfreeze(&self, user_id: UserId, currency: &str, amount: Quote) -> Result<(), LedgerError>;

    /// Consume frozen balance (margin absorbed into a position, fees).
    fn debit_frozen(
        &self,
        user_id: UserId,
        currency: &str,
        amount: Quote,
    ) -> Result<(), LedgerError>;

    /// Add to available balance (released margin, realized profit,
    /// funding received).
    fn credit(&self, user_id: UserId, currency: &str, amount: Quote);

    /// Deduct from available balance (realized loss, funding paid). Goes
    /// negative rather than failing; solvency is the risk engine's job.
    fn debit(&self, user_id: UserId, currency: &str, amount: Quote);

    fn available(&self, user_id: UserId, currency: &str) -> Quote;
    fn frozen(&self, user_id: UserId, currency: &str) -> Quote;
}

#[derive(Debug, Default, Clone, Copy)]
struct BalanceRow {
    available: Decimal,
    frozen: Decimal,
}

/// Ledger held in memory, suitable for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    rows: Mutex<HashMap<(UserId, String), BalanceRow>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&self, user_id: UserId, currency: &str, amount: Quote) {
        let mut rows = self.rows.lock();
        let row = rows.entry((user_id, currency.to_string())).or_default();
        row.available += amount.value();
    }
}

impl BalanceLedger for InMemoryLedger {
    fn freeze(&self, user_id: UserId, currency: &str, amount: Quote) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock();
        let row = rows.entry((user_id, currency.to_string())).or_default();
        if row.available < amount.value() {
            return Err(LedgerError::InsufficientAvailable {
                user_id,
                currency: currency.to_string(),
                available: row.available,
                requested: amount.value(),
            });
        }
        row.available -= amount.value();
        row.frozen += amount.value();
        Ok(())
    }

    fn unfreeze(&self, user_id: UserId, currency: &str, amount: Quote) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock();
        let row = rows.entry((user_id, currency.to_string())).or_default();
        if row.frozen < amount.value() {
            return Err(LedgerError::InsufficientFrozen {
                user_id,
                currency: currency.to_string(),
                frozen: row.frozen,
                requested: amount.value(),
            });
        }
        row.frozen -= amount.value();
        row.available += amount.value();
        Ok(())
    }

    fn debit_frozen(
        &self,
        user_id: UserId,
        currency: &str,
        amount: Quote,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock();
        let row = rows.entry((user_id, currency.to_string())).or_default();
        if row.frozen < amount.value() {
            return Err(LedgerError::InsufficientFrozen {
                user_id,
                currency: currency.to_string(),
                frozen: row.frozen,
                requested: amount.value(),
            });
        }
        row.frozen -= amount.value();
        Ok(())
    }

    fn credit(&self, user_id: UserId, currency: &str, amount: Quote) {
        let mut rows = self.rows.lock();
        let row = rows.entry((user_id, currency.to_string())).or_default();
        row.available += amount.value();
    }

    fn debit(&self, user_id: UserId, currency: &str, amount: Quote) {
        let mut rows = self.rows.lock();
        let row = rows.entry((user_id, currency.to_string())).or_default();
        row.available -= amount.value();
    }

    fn available(&self, user_id: UserId, currency: &str) -> Quote {
        let rows = self.rows.lock();
        Quote::new(
            rows.get(&(user_id, currency.to_string()))
                .map(|r| r.available)
                .unwrap_or_default(),
        )
    }

    fn frozen(&self, user_id: UserId, currency: &str) -> Quote {
        let rows = self.rows.lock();
        Quote::new(
            rows.get(&(user_id, currency.to_string()))
                .map(|r| r.frozen)
                .unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const USDT: &str = "USDT";

    #[test]
    fn freeze_moves_between_buckets() {
        let ledger = InMemoryLedger::new();
        ledger.deposit(UserId(1), USDT, Quote::new(dec!(10000)));

        ledger.freeze(UserId(1), USDT, Quote::new(dec!(4000))).unwrap();
        assert_eq!(ledger.available(UserId(1), USDT).value(), dec!(6000));
        assert_eq!(ledger.frozen(UserId(1), USDT).value(), dec!(4000));

        ledger.unfreeze(UserId(1), USDT, Quote::new(dec!(1000))).unwrap();
        assert_eq!(ledger.available(UserId(1), USDT).value(), dec!(7000));
        assert_eq!(ledger.frozen(UserId(1), USDT).value(), dec!(3000));
    }

    #[test]
    fn freeze_beyond_available_fails_cleanly() {
        let ledger = InMemoryLedger::new();
        ledger.deposit(UserId(1), USDT, Quote::new(dec!(100)));

        let err = ledger.freeze(UserId(1), USDT, Quote::new(dec!(200)));
        assert!(matches!(err, Err(LedgerError::InsufficientAvailable { .. })));
        // nothing moved
        assert_eq!(ledger.available(UserId(1), USDT).value(), dec!(100));
        assert_eq!(ledger.frozen(UserId(1), USDT).value(), dec!(0));
    }

    #[test]
    fn debit_frozen_consumes_margin() {
        let ledger = InMemoryLedger::new();
        ledger.deposit(UserId(1), USDT, Quote::new(dec!(1000)));
        ledger.freeze(UserId(1), USDT, Quote::new(dec!(1000))).unwrap();

        ledger.debit_frozen(UserId(1), USDT, Quote::new(dec!(600))).unwrap();
        assert_eq!(ledger.frozen(UserId(1), USDT).value(), dec!(400));
        assert_eq!(ledger.available(UserId(1), USDT).value(), dec!(0));
    }

    #[test]
    fn currencies_are_independent() {
        let ledger = InMemoryLedger::new();
        ledger.deposit(UserId(1), "USDT", Quote::new(dec!(500)));
        ledger.deposit(UserId(1), "USDC", Quote::new(dec!(700)));

        ledger.freeze(UserId(1), "USDC", Quote::new(dec!(700))).unwrap();
        assert_eq!(ledger.available(UserId(1), "USDT").value(), dec!(500));
        assert_eq!(ledger.frozen(UserId(1), "USDC").value(), dec!(700));
    }
}
