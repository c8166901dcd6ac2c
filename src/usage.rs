// ===============================
// src/usage.rs (token & cost tracker)
// ===============================
use parking_lot::Mutex;

use crate::metrics::MODEL_TOKENS;

// gpt-4o-mini pricing (USD per 1M tokens)
pub const INPUT_USD_PER_1M: f64 = 0.150;
pub const OUTPUT_USD_PER_1M: f64 = 0.600;
// hanya untuk tampilan ringkasan
pub const JPY_PER_USD: f64 = 150.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub requests: u64,
}

impl UsageCounters {
    pub fn input_cost(&self) -> f64 {
        self.prompt_tokens as f64 / 1_000_000.0 * INPUT_USD_PER_1M
    }
    pub fn output_cost(&self) -> f64 {
        self.completion_tokens as f64 / 1_000_000.0 * OUTPUT_USD_PER_1M
    }
    pub fn cost(&self) -> f64 {
        self.input_cost() + self.output_cost()
    }
}

/// Process-lifetime token accounting shared by every worker.
#[derive(Debug, Default)]
pub struct UsageTracker {
    inner: Mutex<UsageCounters>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_usage(&self, prompt_tokens: u64, completion_tokens: u64) {
        {
            let mut c = self.inner.lock();
            c.prompt_tokens += prompt_tokens;
            c.completion_tokens += completion_tokens;
            c.requests += 1;
        }
        MODEL_TOKENS.with_label_values(&["prompt"]).inc_by(prompt_tokens);
        MODEL_TOKENS.with_label_values(&["completion"]).inc_by(completion_tokens);
    }

    pub fn snapshot(&self) -> UsageCounters {
        *self.inner.lock()
    }

    /// Estimated spend in USD
    pub fn cost(&self) -> f64 {
        self.snapshot().cost()
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let c = self.snapshot();
        let total = c.cost();
        vec![
            format!("requests          : {}", c.requests),
            format!("prompt tokens     : {}", c.prompt_tokens),
            format!("completion tokens : {}", c.completion_tokens),
            format!("input cost        : ${:.4}", c.input_cost()),
            format!("output cost       : ${:.4}", c.output_cost()),
            format!("total cost        : ${:.4} (~JPY {:.2})", total, total * JPY_PER_USD),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cost_formula() {
        let t = UsageTracker::new();
        t.add_usage(1_000_000, 500_000);
        assert!((t.cost() - (0.150 + 0.300)).abs() < 1e-12);
        assert_eq!(t.snapshot().requests, 1);
    }

    #[test]
    fn test_empty_tracker_costs_nothing() {
        let t = UsageTracker::new();
        assert_eq!(t.cost(), 0.0);
        assert_eq!(t.summary_lines().len(), 6);
    }

    #[test]
    fn test_concurrent_increments_sum_exactly() {
        let t = Arc::new(UsageTracker::new());
        let threads = 8;
        let per_thread = 1_000;
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let t = t.clone();
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        t.add_usage(i as u64 + 1, 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let c = t.snapshot();
        assert_eq!(c.requests, threads * per_thread);
        // sum_{i=1..8} i * 1000
        assert_eq!(c.prompt_tokens, 36 * per_thread);
        assert_eq!(c.completion_tokens, 2 * threads * per_thread);
    }
}
