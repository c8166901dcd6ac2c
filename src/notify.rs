// ===============================
// src/notify.rs
// ===============================
//
// Hand-off ringkasan run ke chat webhook (Slack-compatible `{"text": ...}`).
// Satu kali POST, tanpa retry; gagal kirim tidak mengubah exit code.
//
use serde_json::json;
use std::fmt::Write as _;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::domain::JobStatus;
use crate::pipeline::RunReport;
use crate::usage::JPY_PER_USD;

impl RunReport {
    /// Plain-text summary of the run
    pub fn to_message(&self) -> String {
        let j = &self.job;
        let icon = match j.status {
            JobStatus::Success => "✅",
            JobStatus::PartialSuccess => "⚠️",
            JobStatus::Failure => "❌",
        };
        let cost = self.usage.cost();

        let mut m = String::new();
        let _ = writeln!(m, "{icon} Daily AI analysis batch: {}", j.status.as_str());
        let _ = writeln!(m, "date     : {}", j.job_date.format("%Y-%m-%d %H:%M UTC"));
        match self.proposals {
            Some(n) => {
                let _ = writeln!(m, "mode     : portfolio");
                let _ = writeln!(
                    m,
                    "holdings : {} total, {} ok, {} failed, {n} proposals",
                    j.total_stocks, j.success_count, j.failure_count
                );
            }
            None => {
                let _ = writeln!(m, "mode     : {}", self.mode.as_str());
                let _ = writeln!(
                    m,
                    "stocks   : {} total, {} ok ({} already done today), {} failed",
                    j.total_stocks, j.success_count, self.skipped, j.failure_count
                );
            }
        }
        let _ = writeln!(m, "duration : {:.1}s", j.duration_ms as f64 / 1000.0);
        let _ = writeln!(
            m,
            "model    : {} requests, {} tokens, ${:.4} (~JPY {:.2})",
            self.usage.requests,
            self.usage.prompt_tokens + self.usage.completion_tokens,
            cost,
            cost * JPY_PER_USD
        );
        if let Some(err) = &j.error_message {
            let _ = writeln!(m, "note     : {err}");
        }
        if !self.recent.is_empty() {
            let ok = self.recent.iter().filter(|r| r.status == JobStatus::Success).count();
            let _ = writeln!(m, "7 days   : {ok}/{} runs fully successful", self.recent.len());
        }
        m
    }
}

/// Best-effort POST of the summary
pub async fn send(webhook_url: &str, text: &str) {
    let client = match reqwest::Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "notify: cannot build http client");
            return;
        }
    };
    match client.post(webhook_url).json(&json!({ "text": text })).send().await {
        Ok(rsp) if rsp.status().is_success() => info!("notify: summary delivered"),
        Ok(rsp) => warn!(status = rsp.status().as_u16(), "notify: webhook rejected summary"),
        Err(e) => warn!(error = %e, "notify: webhook unreachable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::domain::BatchJobLog;
    use crate::usage::UsageCounters;
    use chrono::{TimeZone, Utc};

    fn report(status: JobStatus, ok: usize, failed: usize) -> RunReport {
        let job = BatchJobLog {
            id: "job-1".into(),
            job_date: Utc.with_ymd_and_hms(2026, 3, 2, 21, 0, 0).unwrap(),
            status,
            total_stocks: ok + failed,
            success_count: ok,
            failure_count: failed,
            error_message: (failed > 0).then(|| format!("{failed} of {} instruments failed", ok + failed)),
            duration_ms: 12_340,
        };
        RunReport {
            recent: vec![job.clone()],
            job,
            mode: RunMode::Concurrent,
            skipped: 1,
            proposals: None,
            usage: UsageCounters { prompt_tokens: 1_000_000, completion_tokens: 0, requests: 4 },
        }
    }

    #[test]
    fn test_message_partial_success() {
        let m = report(JobStatus::PartialSuccess, 2, 1).to_message();
        assert!(m.starts_with("⚠️ Daily AI analysis batch: partial_success"));
        assert!(m.contains("2026-03-02 21:00 UTC"));
        assert!(m.contains("3 total, 2 ok (1 already done today), 1 failed"));
        assert!(m.contains("duration : 12.3s"));
        assert!(m.contains("$0.1500 (~JPY 22.50)"));
        assert!(m.contains("note     : 1 of 3 instruments failed"));
        assert!(m.contains("7 days   : 0/1 runs fully successful"));
    }

    #[test]
    fn test_message_success_has_no_note() {
        let m = report(JobStatus::Success, 3, 0).to_message();
        assert!(m.starts_with("✅"));
        assert!(!m.contains("note"));
    }

    #[test]
    fn test_message_portfolio_run() {
        let mut r = report(JobStatus::Success, 4, 0);
        r.proposals = Some(2);
        let m = r.to_message();
        assert!(m.contains("mode     : portfolio"));
        assert!(m.contains("holdings : 4 total, 4 ok, 0 failed, 2 proposals"));
        assert!(!m.contains("stocks"));
    }

    #[tokio::test]
    async fn test_send_to_unreachable_webhook_does_not_panic() {
        send("http://127.0.0.1:9/hook", "hello").await;
    }
}
