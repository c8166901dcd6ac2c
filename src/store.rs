// ===============================
// src/store.rs
// ===============================
//! SQLite persistence for analyses, price history and batch job logs.
//!
//! Every statement is built from a [`ColumnMap`], so the same code runs
//! against the snake_case and the camelCase schema revisions. Each worker
//! opens its own [`Store`]; connections are never shared across tasks.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::columns::{Col, ColumnMap};
use crate::domain::{
    ActionProposal, Advice, BatchJobLog, Holding, Instrument, JobStatus, Market, PriceBar, RawMarketSnapshot,
};
use crate::error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

// 100 baris x 10 parameter, jauh di bawah limit variabel SQLite
const BULK_CHUNK_ROWS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceWriteMode {
    /// One `INSERT .. ON CONFLICT DO UPDATE` per bar
    PerRow,
    /// Delete the touched date range, then multi-row insert
    Bulk,
}

impl PriceWriteMode {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "bulk" | "batch" => PriceWriteMode::Bulk,
            _ => PriceWriteMode::PerRow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

pub fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn ts_from_sql(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s:?}: {e}")))
}

/// [start, end) of a local calendar day, expressed in UTC
pub fn local_day_bounds(tz: &Tz, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let to_utc = |d: NaiveDate| {
        let naive = d.and_time(NaiveTime::MIN);
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    };
    let next = day.succ_opt().unwrap_or(day);
    (to_utc(day), to_utc(next))
}

pub fn local_today(tz: &Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(tz).date_naive()
}

/// Runs SQLite work from async code without parking a tokio worker thread
/// (busy_timeout bisa tidur sampai 10s). Butuh runtime multi-thread.
pub fn blocking<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    tokio::task::block_in_place(f)
}

pub struct Store {
    conn: Connection,
    cols: ColumnMap,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, cols: ColumnMap) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL: beberapa worker menulis ke file yang sama
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(Self { conn, cols })
    }

    /// Create the four tables if missing (local runs and tests; production
    /// schemas are owned elsewhere).
    pub fn ensure_schema(&self) -> Result<()> {
        let c = &self.cols;
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {stocks} (
                {sid} TEXT PRIMARY KEY,
                {ticker} TEXT NOT NULL UNIQUE,
                {market} TEXT NOT NULL DEFAULT 'JP',
                {target} INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS {analyses} (
                {aid} TEXT PRIMARY KEY,
                {a_stock} TEXT NOT NULL,
                {a_date} TEXT NOT NULL,
                {rec} TEXT NOT NULL,
                {conf} INTEGER NOT NULL,
                {reason} TEXT NOT NULL,
                {price} REAL,
                {pe} REAL,
                {pb} REAL,
                {roe} REAL,
                {dy} REAL,
                {created} TEXT NOT NULL,
                {updated} TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS "idx_analyses_stock_date" ON {analyses} ({a_stock}, {a_date});
            CREATE TABLE IF NOT EXISTS {prices} (
                {pid} TEXT PRIMARY KEY,
                {p_stock} TEXT NOT NULL,
                {p_date} TEXT NOT NULL,
                {open} REAL NOT NULL,
                {high} REAL NOT NULL,
                {low} REAL NOT NULL,
                {close} REAL NOT NULL,
                {volume} INTEGER NOT NULL,
                {created} TEXT NOT NULL,
                {updated} TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS "uq_price_history_stock_date" ON {prices} ({p_stock}, {p_date});
            CREATE TABLE IF NOT EXISTS {jobs} (
                {jid} TEXT PRIMARY KEY,
                {j_date} TEXT NOT NULL,
                {status} TEXT NOT NULL,
                {total} INTEGER NOT NULL,
                {ok} INTEGER NOT NULL,
                {failed} INTEGER NOT NULL,
                {err} TEXT,
                {duration} INTEGER NOT NULL,
                {created} TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS {holdings} (
                {hid} TEXT PRIMARY KEY,
                {h_user} TEXT NOT NULL,
                {h_stock} TEXT NOT NULL,
                {shares} REAL NOT NULL,
                {buy} REAL NOT NULL,
                {sold} TEXT
            );
            CREATE TABLE IF NOT EXISTS {proposals} (
                {prid} TEXT PRIMARY KEY,
                {pr_user} TEXT NOT NULL,
                {pr_stock} TEXT NOT NULL,
                {action} TEXT NOT NULL,
                {pr_reason} TEXT NOT NULL,
                {pr_conf} INTEGER NOT NULL,
                {read} INTEGER NOT NULL DEFAULT 0,
                {created} TEXT NOT NULL
            );
            "#,
            stocks = c.q(Col::InstrumentsTable),
            sid = c.q(Col::InstrumentId),
            ticker = c.q(Col::InstrumentTicker),
            market = c.q(Col::InstrumentMarket),
            target = c.q(Col::InstrumentTarget),
            analyses = c.q(Col::AnalysesTable),
            aid = c.q(Col::AnalysisId),
            a_stock = c.q(Col::AnalysisInstrument),
            a_date = c.q(Col::AnalysisDate),
            rec = c.q(Col::Recommendation),
            conf = c.q(Col::ConfidenceScore),
            reason = c.q(Col::Reason),
            price = c.q(Col::CurrentPrice),
            pe = c.q(Col::PeRatio),
            pb = c.q(Col::PbRatio),
            roe = c.q(Col::Roe),
            dy = c.q(Col::DividendYield),
            prices = c.q(Col::PricesTable),
            pid = c.q(Col::PriceId),
            p_stock = c.q(Col::PriceInstrument),
            p_date = c.q(Col::PriceDate),
            open = c.q(Col::Open),
            high = c.q(Col::High),
            low = c.q(Col::Low),
            close = c.q(Col::Close),
            volume = c.q(Col::Volume),
            jobs = c.q(Col::JobLogsTable),
            jid = c.q(Col::JobId),
            j_date = c.q(Col::JobDate),
            status = c.q(Col::JobStatus),
            total = c.q(Col::TotalStocks),
            ok = c.q(Col::SuccessCount),
            failed = c.q(Col::FailureCount),
            err = c.q(Col::ErrorMessage),
            duration = c.q(Col::Duration),
            holdings = c.q(Col::HoldingsTable),
            hid = c.q(Col::HoldingId),
            h_user = c.q(Col::HoldingUser),
            h_stock = c.q(Col::HoldingInstrument),
            shares = c.q(Col::Shares),
            buy = c.q(Col::PurchasePrice),
            sold = c.q(Col::SoldDate),
            proposals = c.q(Col::ProposalsTable),
            prid = c.q(Col::ProposalId),
            pr_user = c.q(Col::ProposalUser),
            pr_stock = c.q(Col::ProposalInstrument),
            action = c.q(Col::ActionType),
            pr_reason = c.q(Col::ProposalReason),
            pr_conf = c.q(Col::ProposalConfidence),
            read = c.q(Col::IsRead),
            created = c.q(Col::CreatedAt),
            updated = c.q(Col::UpdatedAt),
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    // ========== Instruments ==========

    /// Eligible instruments in ticker order
    pub fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let c = &self.cols;
        let sql = format!(
            "SELECT {id}, {ticker}, {market} FROM {t} WHERE {target} = 1 ORDER BY {ticker}",
            id = c.q(Col::InstrumentId),
            ticker = c.q(Col::InstrumentTicker),
            market = c.q(Col::InstrumentMarket),
            target = c.q(Col::InstrumentTarget),
            t = c.q(Col::InstrumentsTable),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let market: String = row.get(2)?;
            Ok(Instrument { id: row.get(0)?, ticker: row.get(1)?, market: Market::parse(&market), analysis_target: true })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========== Analyses ==========

    /// Id of the analysis recorded for `instrument_id` on local `day`, if any
    pub fn analysis_for_day(&self, instrument_id: &str, tz: &Tz, day: NaiveDate) -> Result<Option<String>> {
        let c = &self.cols;
        let (start, end) = local_day_bounds(tz, day);
        let sql = format!(
            "SELECT {id} FROM {t} WHERE {stock} = ?1 AND {date} >= ?2 AND {date} < ?3 ORDER BY {date} DESC LIMIT 1",
            id = c.q(Col::AnalysisId),
            t = c.q(Col::AnalysesTable),
            stock = c.q(Col::AnalysisInstrument),
            date = c.q(Col::AnalysisDate),
        );
        let id = self
            .conn
            .query_row(&sql, params![instrument_id, ts_to_sql(&start), ts_to_sql(&end)], |r| r.get(0))
            .optional()?;
        Ok(id)
    }

    /// Upsert keyed on (instrument, local day of `now`). Satu transaksi;
    /// rollback otomatis kalau ada statement yang gagal.
    pub fn upsert_analysis(
        &mut self,
        instrument_id: &str,
        snap: &RawMarketSnapshot,
        advice: &Advice,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> Result<(String, UpsertOutcome)> {
        let existing = self.analysis_for_day(instrument_id, tz, local_today(tz, now))?;
        let c = &self.cols;
        let now_s = ts_to_sql(&now);
        let tx = self.conn.transaction()?;

        let out = match existing {
            Some(id) => {
                let sql = format!(
                    "UPDATE {t} SET {date} = ?1, {rec} = ?2, {conf} = ?3, {reason} = ?4, {price} = ?5, \
                     {pe} = ?6, {pb} = ?7, {roe} = ?8, {dy} = ?9, {updated} = ?10 WHERE {id} = ?11",
                    t = c.q(Col::AnalysesTable),
                    date = c.q(Col::AnalysisDate),
                    rec = c.q(Col::Recommendation),
                    conf = c.q(Col::ConfidenceScore),
                    reason = c.q(Col::Reason),
                    price = c.q(Col::CurrentPrice),
                    pe = c.q(Col::PeRatio),
                    pb = c.q(Col::PbRatio),
                    roe = c.q(Col::Roe),
                    dy = c.q(Col::DividendYield),
                    updated = c.q(Col::UpdatedAt),
                    id = c.q(Col::AnalysisId),
                );
                tx.execute(
                    &sql,
                    params![
                        now_s,
                        advice.recommendation.as_str(),
                        advice.confidence_score,
                        advice.reason,
                        snap.current_price,
                        snap.pe_ratio,
                        snap.pb_ratio,
                        snap.roe,
                        snap.dividend_yield,
                        now_s,
                        id,
                    ],
                )?;
                (id, UpsertOutcome::Updated)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let sql = format!(
                    "INSERT INTO {t} ({id}, {stock}, {date}, {rec}, {conf}, {reason}, {price}, {pe}, {pb}, {roe}, {dy}, {created}, {updated}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    t = c.q(Col::AnalysesTable),
                    id = c.q(Col::AnalysisId),
                    stock = c.q(Col::AnalysisInstrument),
                    date = c.q(Col::AnalysisDate),
                    rec = c.q(Col::Recommendation),
                    conf = c.q(Col::ConfidenceScore),
                    reason = c.q(Col::Reason),
                    price = c.q(Col::CurrentPrice),
                    pe = c.q(Col::PeRatio),
                    pb = c.q(Col::PbRatio),
                    roe = c.q(Col::Roe),
                    dy = c.q(Col::DividendYield),
                    created = c.q(Col::CreatedAt),
                    updated = c.q(Col::UpdatedAt),
                );
                tx.execute(
                    &sql,
                    params![
                        id,
                        instrument_id,
                        now_s,
                        advice.recommendation.as_str(),
                        advice.confidence_score,
                        advice.reason,
                        snap.current_price,
                        snap.pe_ratio,
                        snap.pb_ratio,
                        snap.roe,
                        snap.dividend_yield,
                        now_s,
                        now_s,
                    ],
                )?;
                (id, UpsertOutcome::Inserted)
            }
        };
        tx.commit()?;
        Ok(out)
    }

    // ========== Price history ==========

    pub fn upsert_price_history(&mut self, instrument_id: &str, bars: &[PriceBar], mode: PriceWriteMode) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        match mode {
            PriceWriteMode::PerRow => self.upsert_prices_per_row(instrument_id, bars),
            PriceWriteMode::Bulk => self.replace_prices_bulk(instrument_id, bars),
        }
    }

    fn upsert_prices_per_row(&mut self, instrument_id: &str, bars: &[PriceBar]) -> Result<usize> {
        let c = &self.cols;
        let now_s = ts_to_sql(&Utc::now());
        let sql = format!(
            "INSERT INTO {t} ({id}, {stock}, {date}, {open}, {high}, {low}, {close}, {volume}, {created}, {updated}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT ({stock}, {date}) DO UPDATE SET \
             {open} = excluded.{open}, {high} = excluded.{high}, {low} = excluded.{low}, \
             {close} = excluded.{close}, {volume} = excluded.{volume}, {updated} = excluded.{updated}",
            t = c.q(Col::PricesTable),
            id = c.q(Col::PriceId),
            stock = c.q(Col::PriceInstrument),
            date = c.q(Col::PriceDate),
            open = c.q(Col::Open),
            high = c.q(Col::High),
            low = c.q(Col::Low),
            close = c.q(Col::Close),
            volume = c.q(Col::Volume),
            created = c.q(Col::CreatedAt),
            updated = c.q(Col::UpdatedAt),
        );
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for b in bars {
                stmt.execute(params![
                    Uuid::new_v4().to_string(),
                    instrument_id,
                    b.date.to_string(),
                    b.open,
                    b.high,
                    b.low,
                    b.close,
                    b.volume,
                    now_s,
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    fn replace_prices_bulk(&mut self, instrument_id: &str, bars: &[PriceBar]) -> Result<usize> {
        let c = &self.cols;
        let now_s = ts_to_sql(&Utc::now());
        let (mut lo, mut hi) = (bars[0].date, bars[0].date);
        for b in bars {
            lo = lo.min(b.date);
            hi = hi.max(b.date);
        }

        // duplikat tanggal di input: yang terakhir menang
        let mut uniq: Vec<&PriceBar> = Vec::with_capacity(bars.len());
        for b in bars {
            match uniq.iter().position(|u| u.date == b.date) {
                Some(i) => uniq[i] = b,
                None => uniq.push(b),
            }
        }

        let delete_sql = format!(
            "DELETE FROM {t} WHERE {stock} = ?1 AND {date} >= ?2 AND {date} <= ?3",
            t = c.q(Col::PricesTable),
            stock = c.q(Col::PriceInstrument),
            date = c.q(Col::PriceDate),
        );
        let insert_head = format!(
            "INSERT INTO {t} ({id}, {stock}, {date}, {open}, {high}, {low}, {close}, {volume}, {created}, {updated}) VALUES ",
            t = c.q(Col::PricesTable),
            id = c.q(Col::PriceId),
            stock = c.q(Col::PriceInstrument),
            date = c.q(Col::PriceDate),
            open = c.q(Col::Open),
            high = c.q(Col::High),
            low = c.q(Col::Low),
            close = c.q(Col::Close),
            volume = c.q(Col::Volume),
            created = c.q(Col::CreatedAt),
            updated = c.q(Col::UpdatedAt),
        );

        let tx = self.conn.transaction()?;
        tx.execute(&delete_sql, params![instrument_id, lo.to_string(), hi.to_string()])?;
        for chunk in uniq.chunks(BULK_CHUNK_ROWS) {
            let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let mut values: Vec<Value> = Vec::with_capacity(chunk.len() * 10);
            for b in chunk {
                values.push(Value::Text(Uuid::new_v4().to_string()));
                values.push(Value::Text(instrument_id.to_string()));
                values.push(Value::Text(b.date.to_string()));
                values.push(Value::Real(b.open));
                values.push(Value::Real(b.high));
                values.push(Value::Real(b.low));
                values.push(Value::Real(b.close));
                values.push(Value::Integer(b.volume));
                values.push(Value::Text(now_s.clone()));
                values.push(Value::Text(now_s.clone()));
            }
            tx.execute(&format!("{insert_head}{placeholders}"), params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(uniq.len())
    }

    // ========== Portfolio ==========

    /// Open holdings (sold_date IS NULL) of every user, joined with their
    /// instrument, ordered by user then ticker
    pub fn list_open_holdings(&self) -> Result<Vec<Holding>> {
        let c = &self.cols;
        let sql = format!(
            "SELECT h.{hid}, h.{user}, s.{sid}, s.{ticker}, s.{market}, s.{target}, h.{shares}, h.{buy} \
             FROM {holdings} h JOIN {stocks} s ON h.{h_stock} = s.{sid} \
             WHERE h.{sold} IS NULL ORDER BY h.{user}, s.{ticker}",
            hid = c.q(Col::HoldingId),
            user = c.q(Col::HoldingUser),
            sid = c.q(Col::InstrumentId),
            ticker = c.q(Col::InstrumentTicker),
            market = c.q(Col::InstrumentMarket),
            target = c.q(Col::InstrumentTarget),
            shares = c.q(Col::Shares),
            buy = c.q(Col::PurchasePrice),
            holdings = c.q(Col::HoldingsTable),
            stocks = c.q(Col::InstrumentsTable),
            h_stock = c.q(Col::HoldingInstrument),
            sold = c.q(Col::SoldDate),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let market: String = row.get(4)?;
            Ok(Holding {
                id: row.get(0)?,
                user_id: row.get(1)?,
                instrument: Instrument {
                    id: row.get(2)?,
                    ticker: row.get(3)?,
                    market: Market::parse(&market),
                    analysis_target: row.get(5)?,
                },
                shares: row.get(6)?,
                purchase_price: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Drops unread proposals for the same user+instrument from the last 24h,
    /// then inserts the new one. Satu transaksi.
    pub fn replace_proposal(&mut self, p: &ActionProposal, now: DateTime<Utc>) -> Result<String> {
        let c = &self.cols;
        let now_s = ts_to_sql(&now);
        let cutoff = ts_to_sql(&(now - chrono::Duration::days(1)));
        let tx = self.conn.transaction()?;

        let del = format!(
            "DELETE FROM {t} WHERE {user} = ?1 AND {stock} = ?2 AND {read} = 0 AND {created} > ?3",
            t = c.q(Col::ProposalsTable),
            user = c.q(Col::ProposalUser),
            stock = c.q(Col::ProposalInstrument),
            read = c.q(Col::IsRead),
            created = c.q(Col::CreatedAt),
        );
        tx.execute(&del, params![p.user_id, p.instrument_id, cutoff])?;

        let id = Uuid::new_v4().to_string();
        let ins = format!(
            "INSERT INTO {t} ({id}, {user}, {stock}, {action}, {reason}, {conf}, {read}, {created}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            t = c.q(Col::ProposalsTable),
            id = c.q(Col::ProposalId),
            user = c.q(Col::ProposalUser),
            stock = c.q(Col::ProposalInstrument),
            action = c.q(Col::ActionType),
            reason = c.q(Col::ProposalReason),
            conf = c.q(Col::ProposalConfidence),
            read = c.q(Col::IsRead),
            created = c.q(Col::CreatedAt),
        );
        tx.execute(&ins, params![id, p.user_id, p.instrument_id, p.action.as_str(), p.reason, p.confidence, now_s])?;
        tx.commit()?;
        Ok(id)
    }

    // ========== Job logs ==========

    pub fn append_job_log(&self, log: &BatchJobLog) -> Result<()> {
        let c = &self.cols;
        let sql = format!(
            "INSERT INTO {t} ({id}, {date}, {status}, {total}, {ok}, {failed}, {err}, {duration}, {created}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            t = c.q(Col::JobLogsTable),
            id = c.q(Col::JobId),
            date = c.q(Col::JobDate),
            status = c.q(Col::JobStatus),
            total = c.q(Col::TotalStocks),
            ok = c.q(Col::SuccessCount),
            failed = c.q(Col::FailureCount),
            err = c.q(Col::ErrorMessage),
            duration = c.q(Col::Duration),
            created = c.q(Col::CreatedAt),
        );
        self.conn.execute(
            &sql,
            params![
                log.id,
                ts_to_sql(&log.job_date),
                log.status.as_str(),
                log.total_stocks as i64,
                log.success_count as i64,
                log.failure_count as i64,
                log.error_message,
                log.duration_ms,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    fn job_logs_query(&self, where_clause: &str) -> String {
        let c = &self.cols;
        format!(
            "SELECT {id}, {date}, {status}, {total}, {ok}, {failed}, {err}, {duration} FROM {t} {where_clause} ORDER BY {date} DESC",
            id = c.q(Col::JobId),
            date = c.q(Col::JobDate),
            status = c.q(Col::JobStatus),
            total = c.q(Col::TotalStocks),
            ok = c.q(Col::SuccessCount),
            failed = c.q(Col::FailureCount),
            err = c.q(Col::ErrorMessage),
            duration = c.q(Col::Duration),
            t = c.q(Col::JobLogsTable),
        )
    }

    fn read_job_logs(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<BatchJobLog>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, i64>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, i64>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, date, status, total, ok, failed, err, duration) = row?;
            let status = JobStatus::parse(&status).ok_or_else(|| StoreError::Corrupt(format!("job status {status:?}")))?;
            out.push(BatchJobLog {
                id,
                job_date: ts_from_sql(&date)?,
                status,
                total_stocks: total.max(0) as usize,
                success_count: ok.max(0) as usize,
                failure_count: failed.max(0) as usize,
                error_message: err,
                duration_ms: duration,
            });
        }
        Ok(out)
    }

    pub fn latest_job_log(&self) -> Result<Option<BatchJobLog>> {
        let sql = format!("{} LIMIT 1", self.job_logs_query(""));
        Ok(self.read_job_logs(&sql, &[])?.into_iter().next())
    }

    pub fn job_logs_since(&self, since: DateTime<Utc>) -> Result<Vec<BatchJobLog>> {
        let where_clause = format!("WHERE {} >= ?1", self.cols.q(Col::JobDate));
        let sql = self.job_logs_query(&where_clause);
        let since_s = ts_to_sql(&since);
        self.read_job_logs(&sql, &[&since_s as &dyn rusqlite::ToSql])
    }
}

#[cfg(test)]
impl Store {
    pub fn open_in_memory(cols: ColumnMap) -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()?, cols })
    }

    pub fn count_analyses(&self, instrument_id: &str) -> Result<i64> {
        let c = &self.cols;
        let sql = format!(
            "SELECT COUNT(*) FROM {t} WHERE {stock} = ?1",
            t = c.q(Col::AnalysesTable),
            stock = c.q(Col::AnalysisInstrument)
        );
        Ok(self.conn.query_row(&sql, params![instrument_id], |r| r.get(0))?)
    }

    pub fn price_history(&self, instrument_id: &str) -> Result<Vec<PriceBar>> {
        let c = &self.cols;
        let sql = format!(
            "SELECT {date}, {open}, {high}, {low}, {close}, {volume} FROM {t} WHERE {stock} = ?1 ORDER BY {date}",
            date = c.q(Col::PriceDate),
            open = c.q(Col::Open),
            high = c.q(Col::High),
            low = c.q(Col::Low),
            close = c.q(Col::Close),
            volume = c.q(Col::Volume),
            t = c.q(Col::PricesTable),
            stock = c.q(Col::PriceInstrument),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![instrument_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, f64>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, i64>(5)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (date, open, high, low, close, volume) = row?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .map_err(|e| StoreError::Corrupt(format!("date {date:?}: {e}")))?;
            out.push(PriceBar { date, open, high, low, close, volume });
        }
        Ok(out)
    }

    pub fn insert_instrument(&self, inst: &Instrument) -> Result<()> {
        let c = &self.cols;
        let sql = format!(
            "INSERT INTO {t} ({id}, {ticker}, {market}, {target}) VALUES (?1, ?2, ?3, ?4)",
            t = c.q(Col::InstrumentsTable),
            id = c.q(Col::InstrumentId),
            ticker = c.q(Col::InstrumentTicker),
            market = c.q(Col::InstrumentMarket),
            target = c.q(Col::InstrumentTarget),
        );
        self.conn.execute(&sql, params![inst.id, inst.ticker, inst.market.as_str(), inst.analysis_target])?;
        Ok(())
    }

    pub fn insert_holding(&self, id: &str, user_id: &str, instrument_id: &str, purchase_price: f64, sold: bool) -> Result<()> {
        let c = &self.cols;
        let sql = format!(
            "INSERT INTO {t} ({id}, {user}, {stock}, {shares}, {buy}, {sold}) VALUES (?1, ?2, ?3, 100, ?4, ?5)",
            t = c.q(Col::HoldingsTable),
            id = c.q(Col::HoldingId),
            user = c.q(Col::HoldingUser),
            stock = c.q(Col::HoldingInstrument),
            shares = c.q(Col::Shares),
            buy = c.q(Col::PurchasePrice),
            sold = c.q(Col::SoldDate),
        );
        let sold_at = sold.then(|| "2026-01-05".to_string());
        self.conn.execute(&sql, params![id, user_id, instrument_id, purchase_price, sold_at])?;
        Ok(())
    }

    /// (user, instrument, action, confidence) of every proposal, oldest first
    pub fn proposals(&self) -> Result<Vec<(String, String, String, i64)>> {
        let c = &self.cols;
        let sql = format!(
            "SELECT {user}, {stock}, {action}, {conf} FROM {t} ORDER BY {created}, {user}",
            user = c.q(Col::ProposalUser),
            stock = c.q(Col::ProposalInstrument),
            action = c.q(Col::ActionType),
            conf = c.q(Col::ProposalConfidence),
            t = c.q(Col::ProposalsTable),
            created = c.q(Col::CreatedAt),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_rows(&self, table: Col) -> Result<i64> {
        Ok(self.conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.cols.q(table)), [], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionType, Recommendation};
    use chrono::Duration as ChronoDuration;

    fn store(cols: ColumnMap) -> Store {
        let s = Store::open_in_memory(cols).unwrap();
        s.ensure_schema().unwrap();
        s
    }

    fn inst(id: &str, ticker: &str, target: bool) -> Instrument {
        Instrument { id: id.into(), ticker: ticker.into(), market: Market::Jp, analysis_target: target }
    }

    fn advice(rec: Recommendation, score: u8) -> Advice {
        Advice { recommendation: rec, confidence_score: score, reason: "test".into() }
    }

    fn bar(day: u32, close: f64) -> PriceBar {
        PriceBar { date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(), open: close, high: close, low: close, close, volume: 100 }
    }

    #[test]
    fn test_list_instruments_eligible_in_ticker_order() {
        let s = store(ColumnMap::snake_case());
        s.insert_instrument(&inst("b", "9984", true)).unwrap();
        s.insert_instrument(&inst("a", "7203", true)).unwrap();
        s.insert_instrument(&inst("c", "6758", false)).unwrap();
        let list = s.list_instruments().unwrap();
        let tickers: Vec<&str> = list.iter().map(|i| i.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["7203", "9984"]);
    }

    #[test]
    fn test_upsert_analysis_same_day_updates_in_place() {
        let mut s = store(ColumnMap::camel_case());
        let tz = chrono_tz::Asia::Tokyo;
        let snap = RawMarketSnapshot { current_price: Some(2500.0), ..Default::default() };
        // 2026-03-10 09:00 JST dan 20:00 JST -> hari lokal yang sama
        let morning = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 3, 10, 11, 0, 0).unwrap();

        let (id1, o1) = s.upsert_analysis("a", &snap, &advice(Recommendation::Buy, 80), morning, &tz).unwrap();
        let (id2, o2) = s.upsert_analysis("a", &snap, &advice(Recommendation::Sell, 40), evening, &tz).unwrap();
        assert_eq!(o1, UpsertOutcome::Inserted);
        assert_eq!(o2, UpsertOutcome::Updated);
        assert_eq!(id1, id2);
        assert_eq!(s.count_analyses("a").unwrap(), 1);
    }

    #[test]
    fn test_upsert_analysis_next_local_day_keeps_history() {
        let mut s = store(ColumnMap::snake_case());
        let tz = chrono_tz::Asia::Tokyo;
        let snap = RawMarketSnapshot::default();
        // 14:00 UTC = 23:00 JST; +2h = 01:00 JST hari berikutnya
        let late = Utc.with_ymd_and_hms(2026, 3, 10, 14, 0, 0).unwrap();
        let after_midnight = late + ChronoDuration::hours(2);
        s.upsert_analysis("a", &snap, &advice(Recommendation::Hold, 50), late, &tz).unwrap();
        let (_, o) = s.upsert_analysis("a", &snap, &advice(Recommendation::Hold, 50), after_midnight, &tz).unwrap();
        assert_eq!(o, UpsertOutcome::Inserted);
        assert_eq!(s.count_analyses("a").unwrap(), 2);

        let day = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        assert!(s.analysis_for_day("a", &tz, day).unwrap().is_some());
        let day_before = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert!(s.analysis_for_day("a", &tz, day_before).unwrap().is_none());
    }

    #[test]
    fn test_price_history_conflict_overwrites() {
        let mut s = store(ColumnMap::snake_case());
        let n = s.upsert_price_history("a", &[bar(1, 100.0), bar(2, 101.0)], PriceWriteMode::PerRow).unwrap();
        assert_eq!(n, 2);
        s.upsert_price_history("a", &[bar(2, 150.0), bar(3, 102.0)], PriceWriteMode::PerRow).unwrap();
        let rows = s.price_history("a").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].close, 150.0);
    }

    #[test]
    fn test_price_history_bulk_replaces_range() {
        let mut s = store(ColumnMap::camel_case());
        s.upsert_price_history("a", &[bar(1, 100.0), bar(2, 101.0), bar(5, 99.0)], PriceWriteMode::Bulk).unwrap();
        let n = s.upsert_price_history("a", &[bar(2, 200.0), bar(3, 201.0), bar(3, 202.0)], PriceWriteMode::Bulk).unwrap();
        assert_eq!(n, 2);
        let rows = s.price_history("a").unwrap();
        let closes: Vec<f64> = rows.iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![100.0, 200.0, 202.0, 99.0]);
    }

    #[test]
    fn test_bulk_handles_more_than_one_chunk() {
        let mut s = store(ColumnMap::snake_case());
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let bars: Vec<PriceBar> = (0..250)
            .map(|i| PriceBar { date: start + ChronoDuration::days(i), open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1 })
            .collect();
        assert_eq!(s.upsert_price_history("a", &bars, PriceWriteMode::Bulk).unwrap(), 250);
        assert_eq!(s.count_rows(Col::PricesTable).unwrap(), 250);
    }

    #[test]
    fn test_price_upsert_rolls_back_on_error() {
        let mut s = store(ColumnMap::snake_case());
        s.conn.execute_batch(r#"DROP TABLE "price_history";"#).unwrap();
        assert!(s.upsert_price_history("a", &[bar(1, 1.0)], PriceWriteMode::PerRow).is_err());
    }

    #[test]
    fn test_job_log_roundtrip_and_latest() {
        let s = store(ColumnMap::snake_case());
        let older = BatchJobLog {
            id: "j1".into(),
            job_date: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            status: JobStatus::Success,
            total_stocks: 2,
            success_count: 2,
            failure_count: 0,
            error_message: None,
            duration_ms: 1200,
        };
        let newer = BatchJobLog {
            id: "j2".into(),
            job_date: Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
            status: JobStatus::PartialSuccess,
            total_stocks: 3,
            success_count: 2,
            failure_count: 1,
            error_message: Some("1 instrument failed".into()),
            duration_ms: 3400,
        };
        s.append_job_log(&older).unwrap();
        s.append_job_log(&newer).unwrap();
        assert_eq!(s.latest_job_log().unwrap(), Some(newer.clone()));
        let since = s.job_logs_since(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()).unwrap();
        assert_eq!(since, vec![newer]);
    }

    #[test]
    fn test_open_holdings_skip_sold_positions() {
        let s = store(ColumnMap::camel_case());
        s.insert_instrument(&inst("a", "7203", true)).unwrap();
        s.insert_instrument(&inst("b", "6758", false)).unwrap();
        s.insert_holding("h1", "u2", "a", 2000.0, false).unwrap();
        s.insert_holding("h2", "u1", "a", 2100.0, false).unwrap();
        s.insert_holding("h3", "u1", "b", 3000.0, false).unwrap();
        s.insert_holding("h4", "u1", "a", 1500.0, true).unwrap();

        let open = s.list_open_holdings().unwrap();
        let ids: Vec<&str> = open.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["h3", "h2", "h1"]);
        // target flag tidak memfilter holdings
        assert!(!open[0].instrument.analysis_target);
        assert_eq!(open[1].purchase_price, 2100.0);
    }

    #[test]
    fn test_replace_proposal_keeps_one_unread_per_day() {
        let mut s = store(ColumnMap::snake_case());
        let p = |action| ActionProposal {
            user_id: "u1".into(),
            instrument_id: "a".into(),
            action,
            reason: "r".into(),
            confidence: 70,
        };
        let morning = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        s.replace_proposal(&p(ActionType::HoldAlert), morning).unwrap();
        s.replace_proposal(&p(ActionType::Sell), morning + ChronoDuration::hours(9)).unwrap();
        let rows = s.proposals().unwrap();
        assert_eq!(rows, vec![("u1".to_string(), "a".to_string(), "SELL".to_string(), 70)]);

        // lebih dari 24 jam kemudian -> proposal lama tetap ada
        s.replace_proposal(&p(ActionType::Sell), morning + ChronoDuration::hours(40)).unwrap();
        assert_eq!(s.proposals().unwrap().len(), 2);
    }

    #[test]
    fn test_local_day_bounds_tokyo() {
        let tz = chrono_tz::Asia::Tokyo;
        let (start, end) = local_day_bounds(&tz, NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 9, 15, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap());
    }
}
