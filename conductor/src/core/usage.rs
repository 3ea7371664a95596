//! Estimated token accounting per worker.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::types::WorkerRole;

/// Rough token estimate: the larger of `chars / 3.5` and `words * 1.3`.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.trim().is_empty() {
        return 0;
    }
    let chars = text.chars().count() as f64 / 3.5;
    let words = text.split_whitespace().count() as f64 * 1.3;
    chars.max(words) as u64
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

impl WorkerUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Running totals for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLedger {
    workers: BTreeMap<WorkerRole, WorkerUsage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt: the prompt sent and the reply selected.
    pub fn record(&mut self, worker: WorkerRole, prompt: &str, reply: &str) {
        let usage = self.workers.entry(worker).or_default();
        usage.input_tokens += estimate_tokens(prompt);
        usage.output_tokens += estimate_tokens(reply);
        usage.calls += 1;
    }

    pub fn worker(&self, worker: WorkerRole) -> WorkerUsage {
        self.workers.get(&worker).copied().unwrap_or_default()
    }

    pub fn totals(&self) -> WorkerUsage {
        self.workers
            .values()
            .fold(WorkerUsage::default(), |acc, usage| WorkerUsage {
                input_tokens: acc.input_tokens + usage.input_tokens,
                output_tokens: acc.output_tokens + usage.output_tokens,
                calls: acc.calls + usage.calls,
            })
    }

    /// Snapshot with costs applied.
    pub fn report(&self, input_cost_per_token: f64, output_cost_per_token: f64) -> UsageReport {
        let cost = |usage: &WorkerUsage| {
            usage.input_tokens as f64 * input_cost_per_token
                + usage.output_tokens as f64 * output_cost_per_token
        };
        let workers = self
            .workers
            .iter()
            .map(|(role, usage)| {
                (
                    *role,
                    WorkerCost {
                        usage: *usage,
                        cost: cost(usage),
                    },
                )
            })
            .collect();
        let totals = self.totals();
        UsageReport {
            workers,
            totals: WorkerCost {
                usage: totals,
                cost: cost(&totals),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkerCost {
    #[serde(flatten)]
    pub usage: WorkerUsage,
    pub cost: f64,
}

/// Serialized as `usage.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub workers: BTreeMap<WorkerRole, WorkerCost>,
    pub totals: WorkerCost,
}
