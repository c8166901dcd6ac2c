// ===============================
// src/config.rs
// ===============================
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
use chrono_tz::Tz;
use clap::Parser;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::columns::ColumnMap;
use crate::store::PriceWriteMode;

/// Strategi eksekusi batch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Sequential,
    Concurrent,
}

impl RunMode {
    pub fn parse_one(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" | "serial" => Some(RunMode::Sequential),
            "concurrent" | "parallel" | "pool" => Some(RunMode::Concurrent),
            _ => None,
        }
    }

    pub fn from_env(key: &str, default_mode: RunMode) -> RunMode {
        env::var(key).ok().and_then(|v| Self::parse_one(&v)).unwrap_or(default_mode)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Sequential => "sequential",
            RunMode::Concurrent => "concurrent",
        }
    }
}

/// Per-run overrides on top of the environment
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "stock_batch_rust", version, about = "Daily AI analysis batch for the stock catalog")]
pub struct Cli {
    /// Re-analyze instruments already analyzed today
    #[arg(long)]
    pub force: bool,
    /// Process one instrument at a time (ticker order)
    #[arg(long)]
    pub sequential: bool,
    /// Worker pool size for concurrent mode
    #[arg(long)]
    pub workers: Option<usize>,
    /// Compute SMA/RSI over ~3 months and include them in the prompt
    #[arg(long)]
    pub with_indicators: bool,
    /// Analyze open holdings and write action proposals instead of the catalog run
    #[arg(long)]
    pub portfolio: bool,
    /// Restrict the run to these tickers (repeatable)
    #[arg(long = "ticker")]
    pub tickers: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Settings {
    // storage
    pub database_path: String,
    pub columns: ColumnMap,
    pub price_write_mode: PriceWriteMode,

    // upstreams
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub openai_timeout: Duration,
    pub market_data_url: String,

    // scheduling
    pub run_mode: RunMode,
    pub max_workers: usize,
    pub rate_limit_delay: Duration,
    pub sequential_delay: Duration,
    pub timezone: Tz,
    pub force: bool,
    pub with_indicators: bool,
    pub portfolio: bool,
    pub tickers: Vec<String>,

    // side outputs
    pub record_file: Option<String>,
    pub metrics_port: Option<u16>,
    pub notify_webhook_url: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Settings {
    /// Environment only (tanpa CLI); dipakai juga oleh tests
    pub fn from_env() -> Settings {
        let columns = ColumnMap::from_style(&env::var("SCHEMA_STYLE").unwrap_or_default())
            .with_overrides(&env::var("COLUMN_OVERRIDES").unwrap_or_default());

        let timezone = env::var("BATCH_TIMEZONE")
            .ok()
            .and_then(|s| s.trim().parse::<Tz>().ok())
            .unwrap_or(chrono_tz::Asia::Tokyo);

        let tickers: Vec<String> = env::var("TICKERS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|x| x.trim())
                    .filter(|x| !x.is_empty())
                    .map(|x| x.to_ascii_uppercase())
                    .collect()
            })
            .unwrap_or_default();

        Settings {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "stock_batch.db".to_string()),
            columns,
            price_write_mode: PriceWriteMode::parse(&env::var("PRICE_WRITE_MODE").unwrap_or_default()),
            openai_api_key: env_nonempty("OPENAI_API_KEY"),
            openai_base_url: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_timeout: Duration::from_secs(env_parse("OPENAI_TIMEOUT_SECS").unwrap_or(30)),
            market_data_url: env::var("MARKET_DATA_URL")
                .unwrap_or_else(|_| "https://query1.finance.yahoo.com".to_string()),
            run_mode: RunMode::from_env("RUN_MODE", RunMode::Concurrent),
            max_workers: env_parse::<usize>("MAX_WORKERS").unwrap_or(5).max(1),
            rate_limit_delay: Duration::from_millis(env_parse("RATE_LIMIT_DELAY_MS").unwrap_or(1000)),
            sequential_delay: Duration::from_millis(env_parse("SEQUENTIAL_DELAY_MS").unwrap_or(1000)),
            timezone,
            force: env_bool("FORCE"),
            with_indicators: env_bool("WITH_INDICATORS"),
            portfolio: env_bool("PORTFOLIO_MODE"),
            tickers,
            record_file: env_nonempty("RECORD_FILE"),
            metrics_port: env_parse("METRICS_PORT"),
            notify_webhook_url: env_nonempty("NOTIFY_WEBHOOK_URL"),
        }
    }

    /// CLI flags win over the environment
    pub fn apply_cli(mut self, cli: &Cli) -> Settings {
        self.force |= cli.force;
        self.with_indicators |= cli.with_indicators;
        self.portfolio |= cli.portfolio;
        if cli.sequential {
            self.run_mode = RunMode::Sequential;
        }
        if let Some(w) = cli.workers {
            self.max_workers = w.max(1);
        }
        if !cli.tickers.is_empty() {
            self.tickers = cli.tickers.iter().map(|t| t.trim().to_ascii_uppercase()).collect();
        }
        self
    }

    /// Trailing window for the price series; portfolio run selalu pakai indikator
    pub fn history_range(&self) -> &'static str {
        if self.with_indicators || self.portfolio { "3mo" } else { "1mo" }
    }
}

pub fn load() -> Settings {
    // Pastikan .env dibaca (DATABASE_PATH, OPENAI_API_KEY, dll)
    let _ = dotenv();
    let cli = Cli::parse();
    Settings::from_env().apply_cli(&cli)
}
