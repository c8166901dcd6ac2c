// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market classifier: domestic (Tokyo) vs foreign (US) listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Market { Jp, Us }

impl Market {
    pub fn parse(s: &str) -> Market {
        match s.trim().to_ascii_uppercase().as_str() {
            "JP" | "JPX" | "TSE" => Market::Jp,
            _ => Market::Us,
        }
    }
    pub fn as_str(&self) -> &'static str { match self { Market::Jp => "JP", Market::Us => "US" } }
    pub fn currency(&self) -> &'static str { match self { Market::Jp => "JPY", Market::Us => "USD" } }
}

/// Row dari tabel instruments (read-only untuk pipeline ini)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument { pub id: String, pub ticker: String, pub market: Market, pub analysis_target: bool }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar { pub date: NaiveDate, pub open: f64, pub high: f64, pub low: f64, pub close: f64, pub volume: i64 }

/// Per-run, per-instrument bundle from the market-data source.
/// Optional metrics are `None` when upstream returns nothing or zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMarketSnapshot {
    pub ticker: String,
    pub market: Option<Market>,
    pub company_name: String,
    pub sector: String,
    pub current_price: Option<f64>,
    pub pe_ratio: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub price_history: Vec<PriceBar>,
    pub error: Option<String>,
}

impl RawMarketSnapshot {
    pub fn new(ticker: &str, market: Market) -> Self {
        Self { ticker: ticker.to_string(), market: Some(market), ..Default::default() }
    }

    /// Snapshot usable downstream: no error and a positive current price
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && self.current_price.map(|p| p > 0.0).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation { Buy, Sell, Hold }

impl Recommendation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Recommendation::Buy),
            "sell" => Some(Recommendation::Sell),
            "hold" => Some(Recommendation::Hold),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Recommendation::Buy => "Buy", Recommendation::Sell => "Sell", Recommendation::Hold => "Hold" }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Structured model output (or the deterministic fallback)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advice { pub recommendation: Recommendation, pub confidence_score: u8, pub reason: String }

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub sma_5: f64,
    pub sma_25: f64,
    pub rsi: f64,
    pub current_price: f64,
    pub previous_sma_5: f64,
    pub previous_sma_25: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend { Up, Down, Flat }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsiSignal { Overbought, Oversold, Neutral }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossSignal { GoldenCross, DeadCross, NoSignal }

impl Trend {
    pub fn as_str(&self) -> &'static str { match self { Trend::Up => "up", Trend::Down => "down", Trend::Flat => "flat" } }
}
impl RsiSignal {
    pub fn as_str(&self) -> &'static str {
        match self { RsiSignal::Overbought => "overbought", RsiSignal::Oversold => "oversold", RsiSignal::Neutral => "neutral" }
    }
}
impl CrossSignal {
    pub fn as_str(&self) -> &'static str {
        match self { CrossSignal::GoldenCross => "golden_cross", CrossSignal::DeadCross => "dead_cross", CrossSignal::NoSignal => "no_signal" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub trend: Trend,
    pub sma_5: f64,
    pub sma_25: f64,
    pub rsi: f64,
    pub rsi_signal: RsiSignal,
    pub cross: CrossSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus { Success, PartialSuccess, Failure }

impl JobStatus {
    /// all ok -> success, sebagian -> partial_success, nol -> failure
    pub fn derive(total: usize, success: usize) -> JobStatus {
        if total > 0 && success == total {
            JobStatus::Success
        } else if success > 0 {
            JobStatus::PartialSuccess
        } else {
            JobStatus::Failure
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self { JobStatus::Success => "success", JobStatus::PartialSuccess => "partial_success", JobStatus::Failure => "failure" }
    }
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(JobStatus::Success),
            "partial_success" => Some(JobStatus::PartialSuccess),
            "failure" => Some(JobStatus::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobLog {
    pub id: String,
    pub job_date: DateTime<Utc>,
    pub status: JobStatus,
    pub total_stocks: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

/// Open position (sold_date kosong) joined with its instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding { pub id: String, pub user_id: String, pub instrument: Instrument, pub shares: f64, pub purchase_price: f64 }

impl Holding {
    /// Unrealized P/L in percent; None tanpa harga beli yang valid
    pub fn pnl_pct(&self, current_price: f64) -> Option<f64> {
        (self.purchase_price > 0.0 && current_price.is_finite())
            .then(|| (current_price - self.purchase_price) / self.purchase_price * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType { Sell, HoldAlert }

impl ActionType {
    pub fn as_str(&self) -> &'static str { match self { ActionType::Sell => "SELL", ActionType::HoldAlert => "HOLD_ALERT" } }

    /// Sell call -> SELL; move of 10% or more either way -> HOLD_ALERT; else nothing
    pub fn for_holding(advice: &Advice, pnl_pct: Option<f64>) -> Option<ActionType> {
        if advice.recommendation == Recommendation::Sell {
            Some(ActionType::Sell)
        } else if pnl_pct.map(|p| p.abs() >= 10.0).unwrap_or(false) {
            Some(ActionType::HoldAlert)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub user_id: String,
    pub instrument_id: String,
    pub action: ActionType,
    pub reason: String,
    pub confidence: u8,
}

/// One line per outcome in the JSONL recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Analyzed { ticker: String, recommendation: Recommendation, confidence: u8, prices: usize },
    Skipped { ticker: String, reason: String },
    Failed { ticker: String, stage: String, error: String },
    Proposed { ticker: String, user_id: String, action: ActionType, pnl_pct: Option<f64> },
    Run(BatchJobLog),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_derivation() {
        assert_eq!(JobStatus::derive(3, 3), JobStatus::Success);
        assert_eq!(JobStatus::derive(3, 2), JobStatus::PartialSuccess);
        assert_eq!(JobStatus::derive(3, 0), JobStatus::Failure);
        // run kosong tidak dihitung sukses
        assert_eq!(JobStatus::derive(0, 0), JobStatus::Failure);
    }

    #[test]
    fn test_recommendation_parse() {
        assert_eq!(Recommendation::parse(" buy "), Some(Recommendation::Buy));
        assert_eq!(Recommendation::parse("HOLD"), Some(Recommendation::Hold));
        assert_eq!(Recommendation::parse("strong buy"), None);
    }

    #[test]
    fn test_proposal_rule() {
        let advice = |r| Advice { recommendation: r, confidence_score: 60, reason: String::new() };
        assert_eq!(ActionType::for_holding(&advice(Recommendation::Sell), Some(1.0)), Some(ActionType::Sell));
        assert_eq!(ActionType::for_holding(&advice(Recommendation::Hold), Some(-10.0)), Some(ActionType::HoldAlert));
        assert_eq!(ActionType::for_holding(&advice(Recommendation::Buy), Some(12.5)), Some(ActionType::HoldAlert));
        assert_eq!(ActionType::for_holding(&advice(Recommendation::Hold), Some(9.99)), None);
        assert_eq!(ActionType::for_holding(&advice(Recommendation::Hold), None), None);
    }

    #[test]
    fn test_holding_pnl() {
        let inst = Instrument { id: "s".into(), ticker: "7203".into(), market: Market::Jp, analysis_target: false };
        let h = Holding { id: "h".into(), user_id: "u".into(), instrument: inst, shares: 100.0, purchase_price: 2000.0 };
        assert_eq!(h.pnl_pct(2300.0), Some(15.0));
        let free = Holding { purchase_price: 0.0, ..h };
        assert_eq!(free.pnl_pct(2300.0), None);
    }

    #[test]
    fn test_snapshot_usable_requires_positive_price() {
        let mut s = RawMarketSnapshot::new("7203", Market::Jp);
        assert!(!s.is_usable());
        s.current_price = Some(0.0);
        assert!(!s.is_usable());
        s.current_price = Some(2500.0);
        assert!(s.is_usable());
        s.error = Some("boom".into());
        assert!(!s.is_usable());
    }
}
