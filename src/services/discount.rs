//! Tiered discount calculator (§4.6).
//!
//! Given a subtotal, finds the highest qualifying tier threshold and
//! applies its rate. Ties round half up, matching `rust_decimal`'s
//! `round_dp_with_strategy(2, MidpointAwayFromZero)` — subtotals are
//! always non-negative so away-from-zero and half-up coincide.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::config::DiscountTier;

/// `tiers` must be sorted ascending by threshold (`AppConfig::load` enforces
/// this at startup). Returns the discount amount, rounded to 2 decimal
/// places — never more than `subtotal` itself.
pub fn calculate_discount(subtotal: Decimal, tiers: &[DiscountTier]) -> Decimal {
    let rate = tiers
        .iter()
        .rev()
        .find(|tier| subtotal >= tier.threshold)
        .map(|tier| tier.rate)
        .unwrap_or(Decimal::ZERO);

    if rate.is_zero() {
        return Decimal::ZERO;
    }

    let raw = subtotal * rate;
    let rounded = raw.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    rounded.min(subtotal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tiers() -> Vec<DiscountTier> {
        vec![
            DiscountTier {
                threshold: dec!(50.00),
                rate: dec!(0.05),
            },
            DiscountTier {
                threshold: dec!(100.00),
                rate: dec!(0.10),
            },
            DiscountTier {
                threshold: dec!(200.00),
                rate: dec!(0.15),
            },
        ]
    }

    #[test]
    fn below_lowest_tier_has_no_discount() {
        assert_eq!(calculate_discount(dec!(49.99), &tiers()), Decimal::ZERO);
    }

    #[test]
    fn exact_threshold_qualifies() {
        assert_eq!(calculate_discount(dec!(50.00), &tiers()), dec!(2.50));
        assert_eq!(calculate_discount(dec!(100.00), &tiers()), dec!(10.00));
        assert_eq!(calculate_discount(dec!(200.00), &tiers()), dec!(30.00));
    }

    #[test]
    fn highest_qualifying_tier_wins() {
        assert_eq!(calculate_discount(dec!(250.00), &tiers()), dec!(37.50));
    }

    #[test]
    fn rounds_half_up() {
        // 63.33 * 0.05 = 3.1665 -> 3.17
        assert_eq!(calculate_discount(dec!(63.33), &tiers()), dec!(3.17));
    }

    #[test]
    fn mid_tier_applies_mid_rate() {
        assert_eq!(calculate_discount(dec!(150.00), &tiers()), dec!(15.00));
    }
}
