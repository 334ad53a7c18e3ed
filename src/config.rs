//! Per-symbol contract parameters and the exchange-level configuration.

use crate::adl::AdlParams;
use crate::funding::FundingParams;
use crate::liquidation::LiquidationParams;
use crate::margin::MarginParams;
use crate::risk::RiskParams;
use crate::types::{Price, Quote, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContractError {
    #[error("quantity {quantity} below minimum {minimum}")]
    BelowMinQuantity { quantity: Decimal, minimum: Decimal },

    #[error("quantity {quantity} not aligned to lot size {lot_size}")]
    LotMisaligned { quantity: Decimal, lot_size: Decimal },
}

/// Contract definition for one perpetual symbol. Params for every engine
/// stage ride along so a symbol is fully described in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: Symbol,
    /// Quote currency margin and settlement happen in.
    pub currency: String,
    /// Price increment; submitted prices are rounded to the nearest tick.
    pub tick_size: Decimal,
    /// Quantity increment; misaligned quantities are rejected.
    pub lot_size: Decimal,
    pub min_quantity: Decimal,
    pub margin: MarginParams,
    pub risk: RiskParams,
    pub liquidation: LiquidationParams,
    pub adl: AdlParams,
    pub funding: FundingParams,
    /// Seed balance of the symbol's insurance fund.
    pub initial_insurance: Quote,
}

impl SymbolConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            currency: "USDT".to_string(),
            tick_size: Decimal::new(1, 1),  // 0.1
            lot_size: Decimal::new(1, 4),   // 0.0001
            min_quantity: Decimal::new(1, 4),
            margin: MarginParams::default(),
            risk: RiskParams::default(),
            liquidation: LiquidationParams::default(),
            adl: AdlParams::default(),
            funding: FundingParams::default(),
            initial_insurance: Quote::zero(),
        }
    }

    pub fn validate_quantity(&self, quantity: Decimal) -> Result<(), ContractError> {
        if quantity < self.min_quantity {
            return Err(ContractError::BelowMinQuantity {
                quantity,
                minimum: self.min_quantity,
            });
        }
        if !(quantity % self.lot_size).is_zero() {
            return Err(ContractError::LotMisaligned {
                quantity,
                lot_size: self.lot_size,
            });
        }
        Ok(())
    }

    /// Round a submitted price to the nearest tick.
    pub fn align_price(&self, price: Price) -> Price {
        let ticks = (price.value() / self.tick_size).round();
        Price::new_unchecked(ticks * self.tick_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub symbols: Vec<SymbolConfig>,
}

impl ExchangeConfig {
    pub fn single(symbol: SymbolConfig) -> Self {
        Self {
            symbols: vec![symbol],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn quantity_validation() {
        let config = SymbolConfig::new("BTC-PERP");

        assert!(config.validate_quantity(dec!(0.5)).is_ok());
        assert!(matches!(
            config.validate_quantity(dec!(0.00005)),
            Err(ContractError::BelowMinQuantity { .. })
        ));
        assert!(matches!(
            config.validate_quantity(dec!(0.00015)),
            Err(ContractError::LotMisaligned { .. })
        ));
    }

    #[test]
    fn price_rounds_to_tick() {
        let config = SymbolConfig::new("BTC-PERP");
        let aligned = config.align_price(Price::new_unchecked(dec!(50000.16)));
        assert_eq!(aligned.value(), dec!(50000.2));
    }
}
