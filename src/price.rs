//! Price feed seam.
//!
//! The core is agnostic to where mark and index prices come from; anything
//! implementing [`PriceFeed`] will do. A missing or stale price surfaces as
//! a typed error so the funding and risk loops can skip the affected
//! symbol instead of halting.

use crate::types::{Price, Symbol, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PriceError {
    #[error("no price published for {0}")]
    Missing(Symbol),

    #[error("price for {symbol} is {age_ms}ms old, maximum {max_age_ms}ms")]
    Stale {
        symbol: Symbol,
        age_ms: i64,
        max_age_ms: i64,
    },
}

pub trait PriceFeed: Send + Sync {
    fn mark_price(&self, symbol: &Symbol) -> Result<Price, PriceError>;
    fn index_price(&self, symbol: &Symbol) -> Result<Price, PriceError>;
}

#[derive(Debug, Clone, Copy)]
struct FeedEntry {
    mark: Price,
    index: Price,
    updated_at: Timestamp,
}

/// Feed backed by pushed updates. Prices older than `max_age_ms` read as
/// stale; zero disables the check (useful in tests and replays).
#[derive(Debug)]
pub struct InMemoryPriceFeed {
    prices: RwLock<HashMap<Symbol, FeedEntry>>,
    max_age_ms: i64,
}

impl InMemoryPriceFeed {
    pub fn new(max_age_ms: i64) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            max_age_ms,
        }
    }

    pub fn publish(&self, symbol: Symbol, mark: Price, index: Price, now: Timestamp) {
        self.prices.write().insert(
            symbol,
            FeedEntry {
                mark,
                index,
                updated_at: now,
            },
        );
    }

    fn entry(&self, symbol: &Symbol) -> Result<FeedEntry, PriceError> {
        let entry = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| PriceError::Missing(symbol.clone()))?;

        if self.max_age_ms > 0 {
            let age = entry.updated_at.elapsed_ms(&Timestamp::now());
            if age > self.max_age_ms {
                return Err(PriceError::Stale {
                    symbol: symbol.clone(),
                    age_ms: age,
                    max_age_ms: self.max_age_ms,
                });
            }
        }
        Ok(entry)
    }
}

impl PriceFeed for InMemoryPriceFeed {
    fn mark_price(&self, symbol: &Symbol) -> Result<Price, PriceError> {
        Ok(self.entry(symbol)?.mark)
    }

    fn index_price(&self, symbol: &Symbol) -> Result<Price, PriceError> {
        Ok(self.entry(symbol)?.index)
    }
}
