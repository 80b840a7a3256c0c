use std::collections::BTreeMap;

use slmbench_core::{
    round_to, CategoryStats, ItemResult, PerformanceSummary, RunConfig, RunSummary,
};

/// Builds a `RunSummary` from one model's finished pass. Pure: the same
/// results, config and timestamp always give the same summary.
pub struct RunAggregator;

impl RunAggregator {
    pub fn summarize(
        model: &str,
        results: &[ItemResult],
        config: &RunConfig,
        timestamp: u64,
    ) -> RunSummary {
        let successful: Vec<&ItemResult> = results.iter().filter(|r| r.metrics.is_success()).collect();
        let failed_items = Self::failed_items(results);

        let total_items = results.len() as u32;
        let success_rate = match total_items {
            0 => 0.0,
            n => successful.len() as f64 / n as f64,
        };

        RunSummary {
            model: model.to_string(),
            timestamp,
            config: config.clone(),
            total_items,
            successful: successful.len() as u32,
            failed: failed_items.len() as u32,
            success_rate,
            performance: Self::performance(&successful),
            category_breakdown: Self::category_breakdown(&successful),
            failed_items,
        }
    }

    fn performance(successful: &[&ItemResult]) -> Option<PerformanceSummary> {
        if successful.is_empty() {
            return None;
        }

        let tps: Vec<f64> = successful.iter().map(|r| r.metrics.tokens_per_second).collect();
        let ttft: Vec<f64> = successful.iter().filter_map(|r| r.metrics.ttft).collect();
        let decode: Vec<f64> = successful.iter().map(|r| r.metrics.decode_tps).collect();
        let durations: Vec<f64> = successful.iter().map(|r| r.metrics.duration).collect();
        let tokens: Vec<u64> = successful.iter().map(|r| r.metrics.output_tokens).collect();

        let total_tokens: u64 = tokens.iter().sum();
        let total_time: f64 = durations.iter().sum();

        Some(PerformanceSummary {
            avg_tokens_per_second: round_to(mean(&tps), 2),
            min_tokens_per_second: round_to(min(&tps), 2),
            max_tokens_per_second: round_to(max(&tps), 2),
            avg_ttft: round_to(mean(&ttft), 3),
            min_ttft: round_to(min(&ttft), 3),
            max_ttft: round_to(max(&ttft), 3),
            avg_decode_tps: round_to(mean(&decode), 2),
            avg_duration: round_to(mean(&durations), 3),
            avg_output_tokens: round_to(total_tokens as f64 / tokens.len() as f64, 1),
            total_tokens_generated: total_tokens,
            total_time_spent: round_to(total_time, 2),
        })
    }

    /// Items without a category are left out; categories with no successful
    /// item never appear.
    fn category_breakdown(successful: &[&ItemResult]) -> BTreeMap<String, CategoryStats> {
        let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for result in successful {
            let Some(category) = result.category else { continue };
            grouped
                .entry(category.label().to_string())
                .or_default()
                .push(result.metrics.tokens_per_second);
        }

        grouped
            .into_iter()
            .map(|(category, tps)| {
                let stats = CategoryStats {
                    count: tps.len() as u32,
                    avg_tps: round_to(mean(&tps), 2),
                };
                (category, stats)
            })
            .collect()
    }

    /// Ids of items that did not succeed, in dataset order.
    pub fn failed_items(results: &[ItemResult]) -> Vec<String> {
        results
            .iter()
            .filter(|r| !r.metrics.is_success())
            .map(|r| r.id.clone())
            .collect()
    }
}

fn mean(values: &[f64]) -> f64 {
    match values.is_empty() {
        true => 0.0,
        false => values.iter().sum::<f64>() / values.len() as f64,
    }
}

fn min(values: &[f64]) -> f64 {
    match values.is_empty() {
        true => 0.0,
        false => values.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

fn max(values: &[f64]) -> f64 {
    match values.is_empty() {
        true => 0.0,
        false => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}
