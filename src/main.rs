// ===============================
// src/main.rs
// ===============================
/*
 cd /home/kukuhtw/rust/stock_batch_rust

 # jalankan sekali (biasanya dari cron jam 06:00 JST)
 RUST_LOG=info METRICS_PORT=9898 cargo run --release -- --with-indicators

 # paksa analisis ulang untuk satu ticker
 cargo run --release -- --force --sequential --ticker 7203

 # review holdings terbuka -> action proposals (biasanya jam 18:00 JST)
 cargo run --release -- --portfolio

 # metrics selama batch berjalan
 curl -s localhost:9898/metrics | egrep '^(instruments_total|retries_total|model_fallbacks_total)'
*/
/*
=============================================================================
Project : stock_batch_rust - daily AI analysis batch for a JP/US stock catalog
Module  : <module_name>.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Pulls valuation metrics and daily prices from Yahoo Finance,
          computes SMA/RSI signals, asks an OpenAI chat model for a
          Buy/Sell/Hold call with bounded retries, and upserts results
          into SQLite once per instrument per local day. Sequential or
          worker-pool execution, Prometheus metrics, JSONL events.
          Portfolio run turns open holdings into action proposals.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
mod advisor;
mod columns;
mod config;
mod domain;
mod error;
mod feed;
mod indicators;
mod metrics;
mod notify;
mod pipeline;
mod queue;
mod recorder;
mod retry;
mod store;
mod usage;

use chrono::Utc;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::{Advisor, OpenAiChat};
use crate::config::Settings;
use crate::domain::Event;
use crate::error::BatchError;
use crate::feed::{Fetcher, YahooFinance};
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::usage::UsageTracker;

const MARKET_DATA_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config (.env + env + CLI) ----
    let settings = config::load();

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = settings.metrics_port {
        metrics::serve_metrics(port);
    }
    metrics::CONFIG_RUN_MODE
        .with_label_values(&[settings.run_mode.as_str()])
        .set(settings.max_workers as i64);

    info!(
        db = %settings.database_path,
        mode = settings.run_mode.as_str(),
        workers = settings.max_workers,
        timezone = %settings.timezone,
        force = settings.force,
        with_indicators = settings.with_indicators,
        portfolio = settings.portfolio,
        tickers = ?settings.tickers,
        model = %settings.openai_model,
        "startup config"
    );

    let code = match run(settings).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "batch failed");
            1
        }
    };
    std::process::exit(code);
}

type Components = (Fetcher, Advisor, Arc<UsageTracker>);

// Upstream clients (constructor injection)
fn build(settings: &Settings) -> Result<Components, BatchError> {
    let api_key = settings
        .openai_api_key
        .clone()
        .ok_or_else(|| BatchError::Config("OPENAI_API_KEY is not set".into()))?;
    let yahoo = YahooFinance::new(&settings.market_data_url, MARKET_DATA_TIMEOUT)
        .map_err(|e| BatchError::Config(format!("market data client: {e}")))?;
    let chat = OpenAiChat::new(&settings.openai_base_url, &api_key, &settings.openai_model, settings.openai_timeout)
        .map_err(|e| BatchError::Config(format!("model client: {e}")))?;

    let usage = Arc::new(UsageTracker::new());
    let fetcher = Fetcher::new(
        Arc::new(yahoo),
        RetryPolicy::market_data(),
        settings.rate_limit_delay,
        settings.history_range(),
    );
    let advisor = Advisor::new(Arc::new(chat), usage.clone(), RetryPolicy::model());
    Ok((fetcher, advisor, usage))
}

async fn run(settings: Settings) -> Result<i32, BatchError> {
    let started = Utc::now();
    let clock = Instant::now();

    let (fetcher, advisor, usage) = match build(&settings) {
        Ok(c) => c,
        Err(e) => {
            pipeline::record_run_failure(&settings, started, clock, &e);
            return Err(e);
        }
    };

    // ---- Previous run (informational) ----
    let previous = store::blocking(|| {
        let s = Store::open(&settings.database_path, settings.columns.clone())?;
        s.ensure_schema()?;
        s.latest_job_log()
    });
    match previous {
        Ok(Some(prev)) => info!(
            date = %prev.job_date,
            status = prev.status.as_str(),
            success = prev.success_count,
            failed = prev.failure_count,
            "previous run"
        ),
        Ok(None) => info!("no previous run recorded"),
        Err(e) => warn!(error = %e, "previous run unavailable"),
    }

    // ---- Recorder (optional) ----
    let (events, recorder) = match settings.record_file.clone() {
        Some(path) => {
            let (tx, rx) = mpsc::channel::<Event>(1024);
            (Some(tx), Some(tokio::spawn(recorder::run(rx, path))))
        }
        None => (None, None),
    };

    let webhook = settings.notify_webhook_url.clone();
    let pipeline = Pipeline::new(settings, Arc::new(fetcher), Arc::new(advisor), events);
    let result = pipeline.run().await;

    // tutup channel supaya recorder flush & berhenti
    drop(pipeline);
    if let Some(handle) = recorder {
        if let Err(e) = handle.await {
            warn!(error = %e, "recorder task ended abnormally");
        }
    }

    let report = result?;
    for line in usage.summary_lines() {
        info!("{line}");
    }
    metrics::LAST_RUN_COST_MICROUSD.set((usage.cost() * 1_000_000.0).round() as i64);
    if let Some(url) = webhook {
        notify::send(&url, &report.to_message()).await;
    }
    Ok(report.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::{Col, ColumnMap};
    use crate::domain::JobStatus;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_api_key_writes_one_failure_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::from_env();
        s.database_path = dir.path().join("batch.db").to_string_lossy().into_owned();
        s.columns = ColumnMap::snake_case();
        s.openai_api_key = None;
        s.record_file = None;
        s.notify_webhook_url = None;

        let err = run(s.clone()).await.unwrap_err();
        assert!(matches!(err, BatchError::Config(_)));

        let store = Store::open(&s.database_path, s.columns.clone()).unwrap();
        assert_eq!(store.count_rows(Col::JobLogsTable).unwrap(), 1);
        let log = store.latest_job_log().unwrap().unwrap();
        assert_eq!(log.status, JobStatus::Failure);
        assert_eq!((log.total_stocks, log.success_count, log.failure_count), (0, 0, 0));
        assert!(log.error_message.unwrap().contains("OPENAI_API_KEY"));
    }
}
