use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::CheckoutConfig;

/// Rounds a money amount to cents, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn line_total(quantity: i32, unit_price: Decimal) -> Decimal {
    round_money(unit_price * Decimal::from(quantity))
}

/// Flat-rate shipping waived at or above a subtotal threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingPolicy {
    pub free_shipping_threshold: Decimal,
    pub flat_rate: Decimal,
}

impl ShippingPolicy {
    pub fn from_config(config: &CheckoutConfig) -> Self {
        Self {
            free_shipping_threshold: config.free_shipping_threshold,
            flat_rate: config.flat_shipping_cost,
        }
    }

    pub fn shipping_for(&self, subtotal: Decimal) -> Decimal {
        if subtotal >= self.free_shipping_threshold {
            Decimal::ZERO
        } else {
            round_money(self.flat_rate)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
}

impl OrderTotals {
    /// `lines` are `(quantity, unit_price)` pairs.
    pub fn compute<I>(lines: I, policy: &ShippingPolicy) -> Self
    where
        I: IntoIterator<Item = (i32, Decimal)>,
    {
        let subtotal = round_money(
            lines
                .into_iter()
                .map(|(quantity, unit_price)| line_total(quantity, unit_price))
                .sum(),
        );
        let shipping_cost = policy.shipping_for(subtotal);
        Self {
            subtotal,
            shipping_cost,
            total: round_money(subtotal + shipping_cost),
        }
    }
}
