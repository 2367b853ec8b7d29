//! Position sizing: whole shares from capital, margin utilization and leverage.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::TradingConfig;

/// Outcome of sizing an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    Quantity(u64),
    /// Buying power does not cover a single share. Not an error.
    Skip,
}

impl Sizing {
    pub fn quantity(&self) -> Option<u64> {
        match self {
            Sizing::Quantity(q) => Some(*q),
            Sizing::Skip => None,
        }
    }
}

/// Calculator for entry quantities.
pub struct PositionSizer {
    margin_utilization: Decimal,
    leverage: Decimal,
}

impl PositionSizer {
    pub fn new(config: &TradingConfig) -> Self {
        let leverage = if config.use_leverage_in_sizing {
            config.leverage
        } else {
            Decimal::ONE
        };
        Self {
            margin_utilization: config.margin_utilization,
            leverage,
        }
    }

    /// quantity = floor(capital × margin_utilization × leverage / entry_price)
    pub fn size(&self, capital: Decimal, entry_price: Decimal) -> Sizing {
        if entry_price <= Decimal::ZERO || capital <= Decimal::ZERO {
            return Sizing::Skip;
        }

        let buying_power = capital * self.margin_utilization * self.leverage;
        let quantity = (buying_power / entry_price).floor().to_u64().unwrap_or(0);

        if quantity == 0 {
            Sizing::Skip
        } else {
            Sizing::Quantity(quantity)
        }
    }

    /// Margin blocked by `quantity` shares at `price`.
    pub fn margin_required(&self, quantity: u64, price: Decimal) -> Decimal {
        if self.leverage.is_zero() {
            return Decimal::ZERO;
        }
        Decimal::from(quantity) * price / self.leverage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_worked_example() {
        let sizer = PositionSizer::new(&TradingConfig::default());
        // 20000 × 0.5 × 5 / 200
        assert_eq!(sizer.size(dec!(20000), dec!(200)), Sizing::Quantity(250));
        assert_eq!(sizer.margin_required(250, dec!(200)), dec!(10000));
    }

    #[test]
    fn test_floors_fractional_shares() {
        let sizer = PositionSizer::new(&TradingConfig::default());
        // 50000 / 3500 = 14.28...
        assert_eq!(sizer.size(dec!(20000), dec!(3500)), Sizing::Quantity(14));
    }

    #[test]
    fn test_expensive_stock_is_skipped() {
        let sizer = PositionSizer::new(&TradingConfig::default());
        assert_eq!(sizer.size(dec!(20000), dec!(60000)), Sizing::Skip);
        assert_eq!(sizer.size(dec!(20000), Decimal::ZERO), Sizing::Skip);
        assert_eq!(Sizing::Skip.quantity(), None);
    }

    #[test]
    fn test_without_leverage() {
        let config = TradingConfig {
            use_leverage_in_sizing: false,
            ..Default::default()
        };
        let sizer = PositionSizer::new(&config);
        assert_eq!(sizer.size(dec!(20000), dec!(200)), Sizing::Quantity(50));
    }

    #[test]
    fn test_quantity_never_exceeds_buying_power() {
        let sizer = PositionSizer::new(&TradingConfig::default());
        for price in [dec!(1.05), dec!(17.3), dec!(199.99), dec!(4321.5), dec!(49999)] {
            if let Sizing::Quantity(q) = sizer.size(dec!(20000), price) {
                assert!(Decimal::from(q) * price <= dec!(50000));
                assert!(Decimal::from(q + 1) * price > dec!(50000));
            }
        }
    }
}
