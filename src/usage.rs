//! Token pricing and cost analysis over the usage log.
//!
//! Prices are USD per 1K tokens. Dated model snapshots such as
//! `gpt-4o-2024-08-06` are priced by their longest matching family prefix;
//! anything unknown falls back to [`FALLBACK_PRICE`].

use crate::model::{Stage, UsageRecord};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Input and output price per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub input: f64,
    pub output: f64,
}

pub const FALLBACK_PRICE: Price = Price {
    input: 0.01,
    output: 0.01,
};

const PRICES: &[(&str, Price)] = &[
    ("gpt-3.5-turbo", Price { input: 0.0015, output: 0.002 }),
    ("gpt-4o-mini", Price { input: 0.00015, output: 0.0006 }),
    ("gpt-4o", Price { input: 0.0025, output: 0.01 }),
    ("gpt-4.1-nano", Price { input: 0.0001, output: 0.0004 }),
    ("gpt-4.1-mini", Price { input: 0.0004, output: 0.0016 }),
    ("gpt-4.1", Price { input: 0.002, output: 0.008 }),
    ("gpt-4", Price { input: 0.03, output: 0.06 }),
];

pub fn price_for(model: &str) -> Price {
    let model = model.rsplit('/').next().unwrap_or(model);
    PRICES
        .iter()
        .filter(|(name, _)| model == *name || model.starts_with(&format!("{name}-")))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, p)| *p)
        .unwrap_or(FALLBACK_PRICE)
}

pub fn cost_usd(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let p = price_for(model);
    (prompt_tokens as f64 / 1000.0) * p.input + (completion_tokens as f64 / 1000.0) * p.output
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageBucket {
    pub requests: u64,
    pub failed: u64,
    pub tokens: u64,
    pub cost: f64,
}

impl UsageBucket {
    fn add(&mut self, r: &UsageRecord) {
        self.requests += 1;
        if !r.succeeded() {
            self.failed += 1;
        }
        self.tokens += r.total_tokens();
        self.cost += r.cost_usd;
    }

    fn average_cost(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.cost / self.requests as f64
        }
    }
}

/// Cost analysis over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub period_days: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub average_cost_per_request: f64,
    pub model_breakdown: BTreeMap<String, UsageBucket>,
    /// Keyed by task name (`classification`, `field_identification`,
    /// `data_extraction`).
    pub task_breakdown: BTreeMap<String, UsageBucket>,
    /// Distinct models seen per task, for [`UsageSummary::suggestions`].
    #[serde(skip)]
    task_models: BTreeMap<String, Vec<String>>,
}

impl UsageSummary {
    /// Summarise records newer than `now - days`.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a UsageRecord>,
        days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        // Windows reaching past chrono's range cover everything.
        let cutoff = Duration::try_days(i64::from(days))
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut summary = UsageSummary {
            period_days: days,
            ..Default::default()
        };
        let mut total = UsageBucket::default();

        for r in records.into_iter().filter(|r| r.timestamp > cutoff) {
            total.add(r);
            summary.model_breakdown.entry(r.model.clone()).or_default().add(r);
            let task = r.stage.task_name().to_string();
            summary.task_breakdown.entry(task.clone()).or_default().add(r);
            let models = summary.task_models.entry(task).or_default();
            if !models.contains(&r.model) {
                models.push(r.model.clone());
            }
        }

        summary.total_requests = total.requests;
        summary.failed_requests = total.failed;
        summary.total_tokens = total.tokens;
        summary.total_cost = round6(total.cost);
        summary.average_cost_per_request = round6(total.average_cost());
        for bucket in summary
            .model_breakdown
            .values_mut()
            .chain(summary.task_breakdown.values_mut())
        {
            bucket.cost = round6(bucket.cost);
        }
        summary
    }

    pub fn is_empty(&self) -> bool {
        self.total_requests == 0
    }

    /// Hints for cheaper model choices based on the observed mix.
    pub fn suggestions(&self) -> Vec<String> {
        if self.is_empty() {
            return vec!["No usage data available for optimization suggestions".to_string()];
        }
        let mut out = Vec::new();
        for (task, bucket) in &self.task_breakdown {
            let avg = bucket.average_cost();
            let models = self.task_models.get(task).map(Vec::as_slice).unwrap_or_default();
            let uses = |family: &str| models.iter().any(|m| m == family || m.starts_with(&format!("{family}-")));

            if task == Stage::Classification.task_name() && (uses("gpt-4") || uses("gpt-4o")) {
                out.push(format!(
                    "Classification: consider gpt-3.5-turbo instead of a GPT-4 class model (avg cost: ${avg:.4})"
                ));
            }
            if task == Stage::FieldIdentification.task_name() && avg > 0.01 {
                out.push(format!(
                    "Field identification: high average cost ${avg:.4}, consider gpt-4o-mini"
                ));
            }
            if task == Stage::Extraction.task_name() && uses("gpt-3.5-turbo") {
                out.push(format!(
                    "Data extraction: a cheaper model may reduce accuracy (avg cost: ${avg:.4})"
                ));
            }
        }
        if out.is_empty() {
            out.push("Current model selection appears optimized for the workload".to_string());
        }
        out
    }
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: Stage, model: &str, tokens: (u64, u64), age_days: i64, error: Option<&str>) -> UsageRecord {
        let now = Utc::now();
        UsageRecord {
            timestamp: now - Duration::days(age_days),
            document_id: Some("d".into()),
            stage,
            model: model.into(),
            attempt: 1,
            prompt_tokens: tokens.0,
            completion_tokens: tokens.1,
            cost_usd: cost_usd(model, tokens.0, tokens.1),
            duration_ms: 10,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn known_models_use_table_prices() {
        assert!((cost_usd("gpt-4o", 1000, 1000) - 0.0125).abs() < 1e-12);
        assert!((cost_usd("gpt-3.5-turbo", 2000, 0) - 0.003).abs() < 1e-12);
        assert_eq!(price_for("gpt-4o-mini").input, 0.00015);
        assert_eq!(price_for("gpt-4").output, 0.06);
    }

    #[test]
    fn snapshots_match_longest_family() {
        assert_eq!(price_for("gpt-4o-2024-08-06"), price_for("gpt-4o"));
        assert_eq!(price_for("gpt-4o-mini-2024-07-18"), price_for("gpt-4o-mini"));
        assert_eq!(price_for("gpt-4.1-mini"), Price { input: 0.0004, output: 0.0016 });
        assert_eq!(price_for("openai/gpt-4o"), price_for("gpt-4o"));
    }

    #[test]
    fn unknown_model_falls_back() {
        assert_eq!(price_for("claude-sonnet"), FALLBACK_PRICE);
        assert_eq!(price_for("gpt-40"), FALLBACK_PRICE);
        assert!((cost_usd("mystery", 500, 500) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn summary_groups_by_model_and_task_within_window() {
        let records = vec![
            record(Stage::Classification, "gpt-3.5-turbo", (1000, 100), 0, None),
            record(Stage::Extraction, "gpt-4o", (2000, 500), 1, None),
            record(Stage::Extraction, "gpt-4o", (0, 0), 1, Some("HTTP 503")),
            record(Stage::Extraction, "gpt-4o", (9000, 9000), 30, None),
        ];
        let s = UsageSummary::from_records(&records, 7, Utc::now());

        assert_eq!(s.total_requests, 3);
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.total_tokens, 3600);
        assert_eq!(s.model_breakdown["gpt-4o"].requests, 2);
        assert_eq!(s.task_breakdown["data_extraction"].failed, 1);
        assert_eq!(s.task_breakdown["classification"].tokens, 1100);
        assert!((s.total_cost - 0.0117).abs() < 1e-9);
    }

    #[test]
    fn suggestions_flag_expensive_classification() {
        let records = vec![record(Stage::Classification, "gpt-4o", (1000, 100), 0, None)];
        let s = UsageSummary::from_records(&records, 7, Utc::now());
        assert!(s.suggestions()[0].starts_with("Classification"));

        let empty = UsageSummary::from_records(&[], 7, Utc::now());
        assert!(empty.is_empty());
        assert_eq!(empty.suggestions().len(), 1);
    }

    #[test]
    fn huge_window_covers_every_record() {
        let records = vec![
            record(Stage::Classification, "gpt-4o", (10, 10), 0, None),
            record(Stage::Extraction, "gpt-4o", (10, 10), 4000, None),
        ];
        let s = UsageSummary::from_records(&records, u32::MAX, Utc::now());
        assert_eq!(s.period_days, u32::MAX);
        assert_eq!(s.total_requests, 2);
    }
}
