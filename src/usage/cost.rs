//! Per-bucket USD cost calculation from a hot-swappable pricing map
//! (spec.md §4.5 "Cost calculation").

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ModelPricing;
use crate::db::CostBreakdown;
use crate::model::TokenUsage;

/// Swapped atomically under a short write-lock (`UpdatePricing`, spec.md
/// §4.5); readers take the read-lock for the briefest consistent snapshot
/// (spec.md §5 "Shared-resource policy").
pub struct PricingTable {
    inner: RwLock<Arc<PricingInner>>,
}

struct PricingInner {
    by_model: HashMap<String, ModelPricing>,
    default: ModelPricing,
}

impl PricingTable {
    pub fn new(by_model: HashMap<String, ModelPricing>, default: ModelPricing) -> Self {
        Self {
            inner: RwLock::new(Arc::new(PricingInner { by_model, default })),
        }
    }

    /// Atomically replaces the entire pricing table.
    pub fn update(&self, by_model: HashMap<String, ModelPricing>, default: ModelPricing) {
        *self.inner.write() = Arc::new(PricingInner { by_model, default });
    }

    pub fn rate_for(&self, model: &str) -> ModelPricing {
        let snapshot = self.inner.read().clone();
        snapshot.by_model.get(model).cloned().unwrap_or_else(|| snapshot.default.clone())
    }

    pub fn cost_for(&self, model: &str, usage: TokenUsage) -> CostBreakdown {
        let rate = self.rate_for(model);
        calculate_cost(usage, &rate)
    }
}

/// `per_bucket_cost = tokens * rate_per_million / 1_000_000`; total is the
/// sum of the four buckets (spec.md §4.5, §8 "Cost correctness").
pub fn calculate_cost(usage: TokenUsage, pricing: &ModelPricing) -> CostBreakdown {
    let input_cost_usd = usage.input_tokens as f64 * pricing.input_per_million / 1_000_000.0;
    let output_cost_usd = usage.output_tokens as f64 * pricing.output_per_million / 1_000_000.0;
    let cache_creation_cost_usd =
        usage.cache_creation_input_tokens as f64 * pricing.cache_creation_per_million / 1_000_000.0;
    let cache_read_cost_usd =
        usage.cache_read_input_tokens as f64 * pricing.cache_read_per_million / 1_000_000.0;
    CostBreakdown {
        input_cost_usd,
        output_cost_usd,
        cache_creation_cost_usd,
        cache_read_cost_usd,
        total_cost_usd: input_cost_usd + output_cost_usd + cache_creation_cost_usd + cache_read_cost_usd,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cost_matches_per_bucket_formula() {
        let pricing = ModelPricing {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_creation_per_million: 3.75,
            cache_read_per_million: 0.3,
        };
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_input_tokens: 10,
            cache_read_input_tokens: 20,
        };
        let cost = calculate_cost(usage, &pricing);
        let expected_total = (100.0 * 3.0 + 50.0 * 15.0 + 10.0 * 3.75 + 20.0 * 0.3) / 1_000_000.0;
        assert!((cost.total_cost_usd - expected_total).abs() < 1e-9);
    }

    #[test]
    fn pricing_table_falls_back_to_default() {
        let table = PricingTable::new(HashMap::new(), ModelPricing {
            input_per_million: 1.0,
            output_per_million: 2.0,
            cache_creation_per_million: 0.0,
            cache_read_per_million: 0.0,
        });
        let rate = table.rate_for("unknown-model");
        assert_eq!(rate.input_per_million, 1.0);
    }

    #[test]
    fn pricing_update_replaces_table_atomically() {
        let table = PricingTable::new(HashMap::new(), ModelPricing::default());
        let mut m = HashMap::new();
        m.insert(
            "claude-x".to_string(),
            ModelPricing {
                input_per_million: 5.0,
                ..Default::default()
            },
        );
        table.update(m, ModelPricing::default());
        assert_eq!(table.rate_for("claude-x").input_per_million, 5.0);
    }
}
