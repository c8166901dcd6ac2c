// ===============================
// src/retry.rs
// ===============================
//
// Bounded retry yang dipakai bareng oleh fetcher dan advisor.
// - max_attempts = total percobaan (bukan jumlah retry).
// - Tidak ada sleep setelah percobaan terakhir.
//
use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::metrics::RETRIES;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    /// (attempt+1) * step  -> 5s, 10s, ...
    Linear { step: Duration },
    /// base * 2^attempt     -> 1s, 2s, 4s, ...
    Exponential { base: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { step } => step.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential { base } => base.saturating_mul(1u32 << attempt.min(16)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    /// Market data: 3 attempts, 5s / 10s between them
    pub fn market_data() -> Self {
        Self::new(3, Backoff::Linear { step: Duration::from_secs(5) })
    }

    /// Model API: first call + 2 retries, 1s / 2s between them
    pub fn model() -> Self {
        Self::new(3, Backoff::Exponential { base: Duration::from_secs(1) })
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::None)
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    /// `op` receives the zero-based attempt index.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= self.max_attempts => return Err(e),
                Err(e) => {
                    let wait = self.backoff.delay(attempt);
                    warn!(
                        op = label,
                        attempt = attempt + 1,
                        max = self.max_attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    RETRIES.with_label_values(&[label]).inc();
                    if !wait.is_zero() {
                        sleep(wait).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
