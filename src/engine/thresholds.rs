// Price-threshold multipliers per (side, payment method), resolved once when the
// configuration is loaded. BUY multipliers are price floors relative to the
// base price, SELL multipliers are price ceilings.

use std::collections::HashMap;

use serde::Deserialize;

use crate::engine::types::{PaymentMethod, Side};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThresholdRule {
    pub side: Side,
    pub payment_method: PaymentMethod,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdError {
    #[error("duplicate threshold rule for {side:?}/{method:?}")]
    Duplicate { side: Side, method: PaymentMethod },
    #[error("threshold multiplier must be positive and finite, got {0}")]
    Invalid(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    by_method: HashMap<(Side, PaymentMethod), f64>,
    default_buy: f64,
    default_sell: f64,
}

fn check(multiplier: f64) -> Result<f64, ThresholdError> {
    if multiplier.is_finite() && multiplier > 0.0 {
        Ok(multiplier)
    } else {
        Err(ThresholdError::Invalid(multiplier))
    }
}

impl ThresholdTable {
    pub fn from_rules(default_buy: f64, default_sell: f64, rules: &[ThresholdRule]) -> Result<Self, ThresholdError> {
        let mut by_method = HashMap::with_capacity(rules.len());
        for rule in rules {
            let key = (rule.side, rule.payment_method);
            if by_method.insert(key, check(rule.multiplier)?).is_some() {
                return Err(ThresholdError::Duplicate { side: rule.side, method: rule.payment_method });
            }
        }
        Ok(Self { by_method, default_buy: check(default_buy)?, default_sell: check(default_sell)? })
    }

    fn default_for(&self, side: Side) -> f64 {
        match side {
            Side::BUY => self.default_buy,
            Side::SELL => self.default_sell,
        }
    }

    /// Multiplier for a listing accepting `methods`. With several methods the
    /// most conservative one applies: the highest floor for BUY, the lowest
    /// ceiling for SELL.
    pub fn multiplier(&self, side: Side, methods: &[PaymentMethod]) -> f64 {
        let per_method = methods
            .iter()
            .map(|m| self.by_method.get(&(side, *m)).copied().unwrap_or_else(|| self.default_for(side)));
        let picked = match side {
            Side::BUY => per_method.fold(None, |acc: Option<f64>, m| Some(acc.map_or(m, |a| a.max(m)))),
            Side::SELL => per_method.fold(None, |acc: Option<f64>, m| Some(acc.map_or(m, |a| a.min(m)))),
        };
        picked.unwrap_or_else(|| self.default_for(side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ThresholdTable {
        ThresholdTable::from_rules(
            0.97,
            1.03,
            &[
                ThresholdRule { side: Side::BUY, payment_method: PaymentMethod::CashDeposit, multiplier: 0.99 },
                ThresholdRule { side: Side::SELL, payment_method: PaymentMethod::CashDeposit, multiplier: 1.01 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_and_default() {
        let t = table();
        assert_eq!(t.multiplier(Side::BUY, &[PaymentMethod::CashDeposit]), 0.99);
        assert_eq!(t.multiplier(Side::BUY, &[PaymentMethod::BankTransfer]), 0.97);
        assert_eq!(t.multiplier(Side::SELL, &[]), 1.03);
    }

    #[test]
    fn test_most_conservative_wins() {
        let t = table();
        let both = [PaymentMethod::BankTransfer, PaymentMethod::CashDeposit];
        assert_eq!(t.multiplier(Side::BUY, &both), 0.99);
        assert_eq!(t.multiplier(Side::SELL, &both), 1.01);
    }

    #[test]
    fn test_rejects_bad_rules() {
        let dup = ThresholdRule { side: Side::BUY, payment_method: PaymentMethod::Card, multiplier: 0.9 };
        assert_eq!(
            ThresholdTable::from_rules(0.97, 1.03, &[dup.clone(), dup]),
            Err(ThresholdError::Duplicate { side: Side::BUY, method: PaymentMethod::Card })
        );
        assert!(ThresholdTable::from_rules(0.0, 1.03, &[]).is_err());
    }
}
