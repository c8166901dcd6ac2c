// ===============================
// src/pipeline.rs (sequential + worker pool)
// ===============================
//
// Batch scheduler: satu run = list -> proses (sequential / worker pool) -> 1 job log.
//
// Catalog run, per instrumen (gagal di langkah mana pun = mark_failure, lanjut ke item berikut):
//   idempotency gate -> fetch -> (indicators) -> advise -> upsert analysis -> upsert prices
//
// Portfolio run (--portfolio), per holding terbuka, sequential:
//   fetch -> indicators -> advise (dengan harga beli) -> action proposal bila perlu
//
// State yang dibagi antar worker hanya: WorkQueue (counters) dan UsageTracker.
// Tiap worker membuka koneksi Store sendiri; semua call SQLite lewat store::blocking.
//
use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{sleep, Instant},
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::advisor::{AdviceRequest, Advisor};
use crate::config::{RunMode, Settings};
use crate::domain::{
    ActionProposal, ActionType, BatchJobLog, Event, Holding, Instrument, JobStatus, RawMarketSnapshot, TechnicalIndicators,
};
use crate::error::{BatchError, StoreError};
use crate::feed::{normalize_ticker, Fetcher};
use crate::indicators::compute_from_bars;
use crate::metrics::{INSTRUMENTS, LAST_RUN_DURATION_MS, PRICE_ROWS, PROPOSALS};
use crate::queue::{Counts, WorkQueue};
use crate::store::{blocking, local_today, Store, UpsertOutcome};
use crate::usage::UsageCounters;

/// Result of one batch run, handed to main / notify
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job: BatchJobLog,
    pub mode: RunMode,
    pub skipped: usize,
    /// Portfolio run only: proposals written
    pub proposals: Option<usize>,
    pub usage: UsageCounters,
    /// Job logs of the trailing 7 days (this run included), newest first
    pub recent: Vec<BatchJobLog>,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.job.failure_count > 0 || self.job.status == JobStatus::Failure { 1 } else { 0 }
    }
}

#[derive(Debug)]
enum Outcome {
    Analyzed,
    Skipped,
    Failed,
}

#[derive(Debug)]
enum Review {
    Proposed,
    NoAction,
    Failed,
}

fn job_log(started: DateTime<Utc>, clock: Instant, total: usize, success: usize, error_message: Option<String>) -> BatchJobLog {
    BatchJobLog {
        id: Uuid::new_v4().to_string(),
        job_date: started,
        status: JobStatus::derive(total, success),
        total_stocks: total,
        success_count: success,
        failure_count: total.saturating_sub(success),
        error_message,
        duration_ms: clock.elapsed().as_millis() as i64,
    }
}

/// Run-level failure (config, store, listing): job log "failure" best-effort
/// lewat koneksi baru. Gagal tulis hanya di-log.
pub fn record_run_failure(settings: &Settings, started: DateTime<Utc>, clock: Instant, err: &BatchError) -> BatchJobLog {
    error!(error = %err, "batch aborted");
    let log = job_log(started, clock, 0, 0, Some(err.to_string()));
    let written = blocking(|| {
        let st = Store::open(&settings.database_path, settings.columns.clone())?;
        st.ensure_schema()?;
        st.append_job_log(&log)
    });
    match written {
        Ok(()) => info!(id = %log.id, "failure job log written"),
        Err(e) => error!(error = %e, "failed to write job log"),
    }
    log
}

#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<Settings>,
    fetcher: Arc<Fetcher>,
    advisor: Arc<Advisor>,
    events: Option<mpsc::Sender<Event>>,
}

impl Pipeline {
    pub fn new(settings: Settings, fetcher: Arc<Fetcher>, advisor: Arc<Advisor>, events: Option<mpsc::Sender<Event>>) -> Self {
        Self { settings: Arc::new(settings), fetcher, advisor, events }
    }

    fn open_store(&self) -> Result<Store, StoreError> {
        blocking(|| {
            let st = Store::open(&self.settings.database_path, self.settings.columns.clone())?;
            st.ensure_schema()?;
            Ok(st)
        })
    }

    async fn emit(&self, ev: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ev).await;
        }
    }

    async fn abort(&self, started: DateTime<Utc>, clock: Instant, err: StoreError) -> BatchError {
        let err = BatchError::from(err);
        let log = record_run_failure(&self.settings, started, clock, &err);
        self.emit(Event::Run(log)).await;
        err
    }

    // "7203", "7203.T" dan "7203.t" dianggap ticker yang sama di kedua sisi
    fn wanted(&self, inst: &Instrument) -> bool {
        let tickers = &self.settings.tickers;
        if tickers.is_empty() {
            return true;
        }
        let have = normalize_ticker(&inst.ticker.to_ascii_uppercase(), inst.market);
        tickers.iter().any(|w| normalize_ticker(&w.to_ascii_uppercase(), inst.market) == have)
    }

    fn select(&self, mut instruments: Vec<Instrument>) -> Vec<Instrument> {
        instruments.retain(|i| i.analysis_target && self.wanted(i));
        instruments
    }

    pub async fn run(&self) -> Result<RunReport, BatchError> {
        if self.settings.portfolio {
            self.run_portfolio().await
        } else {
            self.run_catalog().await
        }
    }

    async fn run_catalog(&self) -> Result<RunReport, BatchError> {
        let started = Utc::now();
        let clock = Instant::now();
        let s = &self.settings;

        let listed = self.open_store().and_then(|st| blocking(|| st.list_instruments()).map(|v| (st, v)));
        let (store, instruments) = match listed {
            Ok((st, v)) => (st, self.select(v)),
            Err(e) => return Err(self.abort(started, clock, e).await),
        };

        let total = instruments.len();
        info!(
            total,
            mode = s.run_mode.as_str(),
            workers = s.max_workers,
            force = s.force,
            with_indicators = s.with_indicators,
            "batch started"
        );

        let (counts, skipped) = if total == 0 {
            warn!("no eligible instruments");
            (Counts::default(), 0)
        } else {
            match s.run_mode {
                RunMode::Sequential => self.run_sequential(store, instruments).await,
                RunMode::Concurrent => {
                    drop(store);
                    self.run_concurrent(instruments).await
                }
            }
        };

        Ok(self.finish(started, clock, total, counts, skipped, None, "instruments").await)
    }

    // Satu job log + ringkasan 7 hari, lewat koneksi baru
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        started: DateTime<Utc>,
        clock: Instant,
        total: usize,
        counts: Counts,
        skipped: usize,
        proposals: Option<usize>,
        unit: &str,
    ) -> RunReport {
        let error_message = if total == 0 {
            Some(format!("no eligible {unit}"))
        } else if counts.success < total {
            Some(format!("{} of {} {unit} failed", total - counts.success, total))
        } else {
            None
        };
        let job = job_log(started, clock, total, counts.success, error_message);

        let recent = match self.open_store() {
            Ok(st) => blocking(|| {
                match st.append_job_log(&job) {
                    Ok(()) => info!(id = %job.id, status = job.status.as_str(), "job log written"),
                    Err(e) => error!(error = %e, status = job.status.as_str(), "failed to write job log"),
                }
                st.job_logs_since(started - ChronoDuration::days(7)).unwrap_or_default()
            }),
            Err(e) => {
                error!(error = %e, "failed to write job log");
                Vec::new()
            }
        };

        LAST_RUN_DURATION_MS.set(job.duration_ms);
        self.emit(Event::Run(job.clone())).await;
        info!(
            status = job.status.as_str(),
            total = job.total_stocks,
            success = job.success_count,
            failed = job.failure_count,
            skipped,
            proposals = proposals.unwrap_or(0),
            duration_ms = job.duration_ms,
            "batch finished"
        );

        RunReport {
            job,
            mode: self.settings.run_mode,
            skipped,
            proposals,
            usage: self.advisor.usage().snapshot(),
            recent,
        }
    }

    async fn run_sequential(&self, mut store: Store, instruments: Vec<Instrument>) -> (Counts, usize) {
        let queue = WorkQueue::new(instruments);
        let mut skipped = 0;
        while let Some(inst) = queue.next() {
            match self.process(&mut store, &inst).await {
                Outcome::Failed => queue.mark_failure(),
                Outcome::Skipped => {
                    skipped += 1;
                    queue.mark_success();
                }
                Outcome::Analyzed => queue.mark_success(),
            }
            info!(ticker = %inst.ticker, progress = %queue.progress());
            if !queue.is_empty() && !self.settings.sequential_delay.is_zero() {
                sleep(self.settings.sequential_delay).await;
            }
        }
        (queue.counts(), skipped)
    }

    async fn run_concurrent(&self, instruments: Vec<Instrument>) -> (Counts, usize) {
        let workers = self.settings.max_workers.max(1).min(instruments.len());
        let queue = Arc::new(WorkQueue::new(instruments));

        let handles: Vec<_> = (0..workers)
            .map(|wid| {
                let me = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move { me.worker(wid, queue).await })
            })
            .collect();

        let mut skipped = 0;
        for r in join_all(handles).await {
            match r {
                Ok(n) => skipped += n,
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }
        (queue.counts(), skipped)
    }

    async fn worker(&self, wid: usize, queue: Arc<WorkQueue<Instrument>>) -> usize {
        let mut store = match self.open_store() {
            Ok(st) => Some(st),
            Err(e) => {
                error!(worker = wid, error = %e, "worker cannot open store");
                None
            }
        };
        let mut skipped = 0;
        while let Some(inst) = queue.next() {
            let outcome = match store.as_mut() {
                Some(st) => self.process(st, &inst).await,
                None => {
                    self.fail(&inst, "store", "store unavailable").await;
                    Outcome::Failed
                }
            };
            match outcome {
                Outcome::Failed => queue.mark_failure(),
                Outcome::Skipped => {
                    skipped += 1;
                    queue.mark_success();
                }
                Outcome::Analyzed => queue.mark_success(),
            }
            info!(worker = wid, ticker = %inst.ticker, progress = %queue.progress());
        }
        skipped
    }

    async fn fail(&self, inst: &Instrument, stage: &str, error: impl std::fmt::Display) -> Outcome {
        let error = error.to_string();
        warn!(ticker = %inst.ticker, stage, %error, "instrument failed");
        INSTRUMENTS.with_label_values(&["failed"]).inc();
        self.emit(Event::Failed { ticker: inst.ticker.clone(), stage: stage.to_string(), error }).await;
        Outcome::Failed
    }

    async fn process(&self, store: &mut Store, inst: &Instrument) -> Outcome {
        let s = &self.settings;
        let now = Utc::now();

        if !s.force {
            let today = local_today(&s.timezone, now);
            match blocking(|| store.analysis_for_day(&inst.id, &s.timezone, today)) {
                Ok(Some(id)) => {
                    info!(ticker = %inst.ticker, analysis = %id, "already analyzed today, skip");
                    INSTRUMENTS.with_label_values(&["skipped"]).inc();
                    self.emit(Event::Skipped { ticker: inst.ticker.clone(), reason: "already analyzed today".into() }).await;
                    return Outcome::Skipped;
                }
                Ok(None) => {}
                Err(e) => return self.fail(inst, "idempotency", e).await,
            }
        }

        let snap = self.fetcher.fetch(inst).await;
        if !snap.is_usable() {
            let err = snap.error.clone().unwrap_or_else(|| "no current price".to_string());
            return self.fail(inst, "fetch", err).await;
        }

        let indicators = if s.with_indicators {
            match compute_from_bars(&snap.price_history) {
                Ok(ind) => Some(ind),
                Err(e) => return self.fail(inst, "indicators", e).await,
            }
        } else {
            None
        };

        let advice = self
            .advisor
            .recommend(&AdviceRequest { snapshot: &snap, indicators: indicators.as_ref(), purchase_price: None })
            .await;

        let outcome = match blocking(|| store.upsert_analysis(&inst.id, &snap, &advice, now, &s.timezone)) {
            Ok((_, o)) => o,
            Err(e) => return self.fail(inst, "persist_analysis", e).await,
        };
        let rows = match blocking(|| store.upsert_price_history(&inst.id, &snap.price_history, s.price_write_mode)) {
            Ok(n) => n,
            Err(e) => return self.fail(inst, "persist_prices", e).await,
        };
        PRICE_ROWS.inc_by(rows as u64);
        INSTRUMENTS.with_label_values(&["success"]).inc();

        info!(
            ticker = %inst.ticker,
            recommendation = %advice.recommendation,
            confidence = advice.confidence_score,
            prices = rows,
            updated = outcome == UpsertOutcome::Updated,
            "analyzed"
        );
        self.emit(Event::Analyzed {
            ticker: inst.ticker.clone(),
            recommendation: advice.recommendation,
            confidence: advice.confidence_score,
            prices: rows,
        })
        .await;
        Outcome::Analyzed
    }

    // ========== Portfolio run ==========

    async fn run_portfolio(&self) -> Result<RunReport, BatchError> {
        let started = Utc::now();
        let clock = Instant::now();

        let listed = self.open_store().and_then(|st| blocking(|| st.list_open_holdings()).map(|v| (st, v)));
        let (mut store, holdings) = match listed {
            Ok((st, mut v)) => {
                v.retain(|h| self.wanted(&h.instrument));
                (st, v)
            }
            Err(e) => return Err(self.abort(started, clock, e).await),
        };

        let total = holdings.len();
        info!(total, "portfolio run started");
        if total == 0 {
            warn!("no open holdings");
        }

        // beberapa user bisa pegang instrumen yang sama: fetch sekali per instrumen
        let mut market: HashMap<String, Arc<(RawMarketSnapshot, TechnicalIndicators)>> = HashMap::new();
        let queue = WorkQueue::new(holdings);
        let mut proposals = 0;
        while let Some(h) = queue.next() {
            match self.review(&mut store, &h, &mut market).await {
                Review::Proposed => {
                    proposals += 1;
                    queue.mark_success();
                }
                Review::NoAction => queue.mark_success(),
                Review::Failed => queue.mark_failure(),
            }
            info!(ticker = %h.instrument.ticker, user = %h.user_id, progress = %queue.progress());
            if !queue.is_empty() && !self.settings.sequential_delay.is_zero() {
                sleep(self.settings.sequential_delay).await;
            }
        }
        drop(store);

        Ok(self.finish(started, clock, total, queue.counts(), 0, Some(proposals), "holdings").await)
    }

    async fn review(
        &self,
        store: &mut Store,
        h: &Holding,
        market: &mut HashMap<String, Arc<(RawMarketSnapshot, TechnicalIndicators)>>,
    ) -> Review {
        let inst = &h.instrument;
        let data = match market.get(&inst.id) {
            Some(d) => d.clone(),
            None => {
                let snap = self.fetcher.fetch(inst).await;
                if !snap.is_usable() {
                    let err = snap.error.clone().unwrap_or_else(|| "no current price".to_string());
                    self.fail(inst, "fetch", err).await;
                    return Review::Failed;
                }
                let ind = match compute_from_bars(&snap.price_history) {
                    Ok(ind) => ind,
                    Err(e) => {
                        self.fail(inst, "indicators", e).await;
                        return Review::Failed;
                    }
                };
                let d = Arc::new((snap, ind));
                market.insert(inst.id.clone(), d.clone());
                d
            }
        };
        let (snap, ind) = (&data.0, &data.1);

        let advice = self
            .advisor
            .recommend(&AdviceRequest { snapshot: snap, indicators: Some(ind), purchase_price: Some(h.purchase_price) })
            .await;
        let pnl_pct = snap.current_price.and_then(|p| h.pnl_pct(p));

        let Some(action) = ActionType::for_holding(&advice, pnl_pct) else {
            INSTRUMENTS.with_label_values(&["success"]).inc();
            info!(ticker = %inst.ticker, user = %h.user_id, recommendation = %advice.recommendation, ?pnl_pct, "no action");
            return Review::NoAction;
        };

        let proposal = ActionProposal {
            user_id: h.user_id.clone(),
            instrument_id: inst.id.clone(),
            action,
            reason: advice.reason.clone(),
            confidence: advice.confidence_score,
        };
        if let Err(e) = blocking(|| store.replace_proposal(&proposal, Utc::now())) {
            self.fail(inst, "persist_proposal", e).await;
            return Review::Failed;
        }
        INSTRUMENTS.with_label_values(&["success"]).inc();
        PROPOSALS.with_label_values(&[action.as_str()]).inc();
        info!(ticker = %inst.ticker, user = %h.user_id, action = action.as_str(), ?pnl_pct, "proposal written");
        self.emit(Event::Proposed { ticker: inst.ticker.clone(), user_id: h.user_id.clone(), action, pnl_pct }).await;
        Review::Proposed
    }
}
