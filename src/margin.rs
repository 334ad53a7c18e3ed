//! Margin math shared by the position, risk and liquidation paths.
//!
//! Initial margin (IM) backs a new position: notional divided by leverage.
//! Maintenance margin (MM) is the floor that keeps it open: notional times
//! the maintenance margin ratio. The margin ratio compares position equity
//! (margin + unrealized PnL) against MM; below 1 the position is
//! liquidatable.

use crate::types::{Leverage, Price, Quote};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginParams {
    pub max_leverage: Leverage,
    /// Maintenance margin as a fraction of notional (0.005 = 0.5%).
    pub maintenance_margin_ratio: Decimal,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            max_leverage: Leverage::new(dec!(100)).expect("static leverage"),
            maintenance_margin_ratio: dec!(0.005),
        }
    }
}

pub fn notional_value(quantity: Decimal, price: Price) -> Quote {
    Quote::new(quantity.abs() * price.value())
}

/// IM = notional / leverage.
pub fn initial_margin(notional: Quote, leverage: Leverage) -> Quote {
    notional.mul(leverage.initial_margin_fraction())
}

/// MM = notional * maintenance margin ratio.
pub fn maintenance_margin(notional: Quote, params: &MarginParams) -> Quote {
    notional.mul(params.maintenance_margin_ratio)
}

/// (margin + uPnL) / MM. Below 1 triggers liquidation.
pub fn margin_ratio(margin: Quote, unrealized_pnl: Quote, maintenance: Quote) -> Decimal {
    if maintenance.value().is_zero() {
        return Decimal::MAX;
    }
    (margin.value() + unrealized_pnl.value()) / maintenance.value()
}
