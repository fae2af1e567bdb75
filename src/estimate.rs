//! Price and print-time estimate derived from a toolpath summary.
//!
//! Both figures are linear in the summary:
//! `price = base_price + price_per_unit * filament_length` and
//! `time = base_time + time_per_layer * layer_count`.
//! A missing summary yields exactly zero for both.

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::toolpath::ToolpathSummary;

/// Raw numeric estimate. Formatting is a presentation concern, see [`format_price`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    #[serde(rename = "priceEstimate")]
    pub price: Decimal,
    #[serde(rename = "timeEstimate")]
    pub time: Decimal,
}

impl Estimate {
    pub const ZERO: Estimate = Estimate {
        price: Decimal::ZERO,
        time: Decimal::ZERO,
    };
}

/// The four constants of the linear price/time model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingModel {
    pub base_price: Decimal,
    pub price_per_unit: Decimal,
    pub base_time: Decimal,
    pub time_per_layer: Decimal,
}

impl Default for PricingModel {
    fn default() -> Self {
        Self {
            base_price: Decimal::new(100, 2),
            price_per_unit: Decimal::new(1, 2),
            base_time: Decimal::new(100, 2),
            time_per_layer: Decimal::new(1, 2),
        }
    }
}

impl PricingModel {
    /// Apply the model. A field missing from an otherwise present summary
    /// contributes nothing beyond its base constant. A result outside the
    /// `Decimal` range yields [`Estimate::ZERO`].
    pub fn estimate(&self, summary: Option<&ToolpathSummary>) -> Estimate {
        let Some(summary) = summary else {
            return Estimate::ZERO;
        };

        let filament = summary
            .total_filament_length
            .filter(|v| v.is_finite() && *v > 0.0)
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ZERO);
        let layers = Decimal::from(summary.layer_count.unwrap_or(0));

        let price = self
            .price_per_unit
            .checked_mul(filament)
            .and_then(|v| self.base_price.checked_add(v));
        let time = self
            .time_per_layer
            .checked_mul(layers)
            .and_then(|v| self.base_time.checked_add(v));

        match (price, time) {
            (Some(price), Some(time)) => Estimate { price, time },
            _ => {
                warn!(
                    filament = %filament,
                    layers = %layers,
                    "Estimate overflowed, falling back to zero"
                );
                Estimate::ZERO
            }
        }
    }
}

/// Render a price for display: two decimals, half away from zero, with a
/// currency symbol for common codes and the ISO code otherwise.
pub fn format_price(price: Decimal, currency: &str) -> String {
    let rounded = price.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let code = currency.trim().to_uppercase();
    match code.as_str() {
        "USD" => format!("${:.2}", rounded),
        "EUR" => format!("€{:.2}", rounded),
        "GBP" => format!("£{:.2}", rounded),
        "" => format!("{:.2}", rounded),
        _ => format!("{:.2} {}", rounded, code),
    }
}

/// One-line human readable description of a summary.
pub fn quick_analysis(summary: Option<&ToolpathSummary>) -> String {
    let Some(summary) = summary else {
        return "toolpath could not be analyzed".to_string();
    };

    let mut parts = Vec::new();
    if let Some(layers) = summary.layer_count {
        parts.push(format!("{} layers", layers));
    }
    if let Some(length) = summary.total_filament_length {
        parts.push(format!("{:.1} mm filament", length));
    }
    if let Some(size) = summary.model_bounding_size {
        parts.push(format!("{:.1} x {:.1} x {:.1} mm", size.x, size.y, size.z));
    }
    if let Some(ref raw) = summary.print_time_raw {
        parts.push(format!("engine estimate {}", raw));
    }

    if parts.is_empty() {
        "toolpath could not be analyzed".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::toolpath::BoundingSize;

    fn model() -> PricingModel {
        PricingModel {
            base_price: dec!(1.00),
            price_per_unit: dec!(0.01),
            base_time: dec!(1.00),
            time_per_layer: dec!(0.01),
        }
    }

    #[test]
    fn test_linear_model() {
        let summary = ToolpathSummary {
            total_filament_length: Some(100.0),
            layer_count: Some(50),
            ..Default::default()
        };
        let est = model().estimate(Some(&summary));
        assert_eq!(est.price, dec!(2.00));
        assert_eq!(est.time, dec!(1.50));
    }

    #[test]
    fn test_null_summary_is_exactly_zero() {
        let est = model().estimate(None);
        assert_eq!(est.price, Decimal::ZERO);
        assert_eq!(est.time, Decimal::ZERO);
        assert_eq!(est, Estimate::ZERO);
    }

    #[test]
    fn test_missing_fields_fall_back_to_base() {
        let summary = ToolpathSummary {
            print_time_raw: Some("1h".to_string()),
            ..Default::default()
        };
        let est = model().estimate(Some(&summary));
        assert_eq!(est.price, dec!(1.00));
        assert_eq!(est.time, dec!(1.00));
    }

    #[test]
    fn test_non_finite_filament_ignored() {
        let summary = ToolpathSummary {
            total_filament_length: Some(f64::NAN),
            layer_count: Some(10),
            ..Default::default()
        };
        let est = model().estimate(Some(&summary));
        assert_eq!(est.price, dec!(1.00));
        assert_eq!(est.time, dec!(1.10));
    }

    #[test]
    fn test_overflowing_filament_is_zero() {
        let summary = ToolpathSummary {
            total_filament_length: Some(5e28),
            layer_count: Some(10),
            ..Default::default()
        };
        let pricing = PricingModel {
            price_per_unit: dec!(2),
            ..model()
        };
        assert_eq!(pricing.estimate(Some(&summary)), Estimate::ZERO);
    }

    #[test]
    fn test_default_model_matches_documented_constants() {
        assert_eq!(PricingModel::default(), model());
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(dec!(2), "USD"), "$2.00");
        assert_eq!(format_price(dec!(2.345), "usd"), "$2.35");
        assert_eq!(format_price(dec!(12.5), "EUR"), "€12.50");
        assert_eq!(format_price(dec!(3.1), "CHF"), "3.10 CHF");
        assert_eq!(format_price(dec!(0), ""), "0.00");
    }

    #[test]
    fn test_estimate_serializes_with_client_field_names() {
        let json = serde_json::to_value(Estimate {
            price: dec!(2.00),
            time: dec!(1.50),
        })
        .unwrap();
        assert_eq!(json["priceEstimate"], "2.00");
        assert_eq!(json["timeEstimate"], "1.50");
    }

    #[test]
    fn test_quick_analysis() {
        let summary = ToolpathSummary {
            total_filament_length: Some(1234.56),
            layer_count: Some(142),
            model_bounding_size: Some(BoundingSize {
                x: 40.0,
                y: 40.0,
                z: 28.4,
            }),
            print_time_raw: None,
            print_time_seconds: None,
        };
        assert_eq!(
            quick_analysis(Some(&summary)),
            "142 layers, 1234.6 mm filament, 40.0 x 40.0 x 28.4 mm"
        );
        assert_eq!(quick_analysis(None), "toolpath could not be analyzed");
    }
}
