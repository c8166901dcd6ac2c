// ===============================
// src/columns.rs
// ===============================
//
// Mapping kolom logis -> identifier fisik.
// Dua revisi skema yang dikenal: snake_case (baru) dan camelCase ber-quote (lama).
// Override per kolom lewat COLUMN_OVERRIDES="analyses.instrument_id=stockId;..."
//
use ahash::AHashMap as HashMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Col {
    // instruments
    InstrumentsTable,
    InstrumentId,
    InstrumentTicker,
    InstrumentMarket,
    InstrumentTarget,
    // analyses
    AnalysesTable,
    AnalysisId,
    AnalysisInstrument,
    AnalysisDate,
    Recommendation,
    ConfidenceScore,
    Reason,
    CurrentPrice,
    PeRatio,
    PbRatio,
    Roe,
    DividendYield,
    // price history
    PricesTable,
    PriceId,
    PriceInstrument,
    PriceDate,
    Open,
    High,
    Low,
    Close,
    Volume,
    // job logs
    JobLogsTable,
    JobId,
    JobDate,
    JobStatus,
    TotalStocks,
    SuccessCount,
    FailureCount,
    ErrorMessage,
    Duration,
    // holdings (portfolio run, read-only)
    HoldingsTable,
    HoldingId,
    HoldingUser,
    HoldingInstrument,
    Shares,
    PurchasePrice,
    SoldDate,
    // action proposals
    ProposalsTable,
    ProposalId,
    ProposalUser,
    ProposalInstrument,
    ActionType,
    ProposalReason,
    ProposalConfidence,
    IsRead,
    // shared
    CreatedAt,
    UpdatedAt,
}

impl Col {
    pub const ALL: [Col; 52] = [
        Col::InstrumentsTable, Col::InstrumentId, Col::InstrumentTicker, Col::InstrumentMarket, Col::InstrumentTarget,
        Col::AnalysesTable, Col::AnalysisId, Col::AnalysisInstrument, Col::AnalysisDate, Col::Recommendation,
        Col::ConfidenceScore, Col::Reason, Col::CurrentPrice, Col::PeRatio, Col::PbRatio, Col::Roe, Col::DividendYield,
        Col::PricesTable, Col::PriceId, Col::PriceInstrument, Col::PriceDate, Col::Open, Col::High, Col::Low,
        Col::Close, Col::Volume,
        Col::JobLogsTable, Col::JobId, Col::JobDate, Col::JobStatus, Col::TotalStocks, Col::SuccessCount,
        Col::FailureCount, Col::ErrorMessage, Col::Duration,
        Col::HoldingsTable, Col::HoldingId, Col::HoldingUser, Col::HoldingInstrument, Col::Shares, Col::PurchasePrice,
        Col::SoldDate,
        Col::ProposalsTable, Col::ProposalId, Col::ProposalUser, Col::ProposalInstrument, Col::ActionType,
        Col::ProposalReason, Col::ProposalConfidence, Col::IsRead,
        Col::CreatedAt, Col::UpdatedAt,
    ];

    /// Stable key used by COLUMN_OVERRIDES
    pub fn key(&self) -> &'static str {
        match self {
            Col::InstrumentsTable => "instruments",
            Col::InstrumentId => "instruments.id",
            Col::InstrumentTicker => "instruments.ticker",
            Col::InstrumentMarket => "instruments.market",
            Col::InstrumentTarget => "instruments.analysis_target",
            Col::AnalysesTable => "analyses",
            Col::AnalysisId => "analyses.id",
            Col::AnalysisInstrument => "analyses.instrument_id",
            Col::AnalysisDate => "analyses.analysis_date",
            Col::Recommendation => "analyses.recommendation",
            Col::ConfidenceScore => "analyses.confidence_score",
            Col::Reason => "analyses.reason",
            Col::CurrentPrice => "analyses.current_price",
            Col::PeRatio => "analyses.pe_ratio",
            Col::PbRatio => "analyses.pb_ratio",
            Col::Roe => "analyses.roe",
            Col::DividendYield => "analyses.dividend_yield",
            Col::PricesTable => "price_history",
            Col::PriceId => "price_history.id",
            Col::PriceInstrument => "price_history.instrument_id",
            Col::PriceDate => "price_history.date",
            Col::Open => "price_history.open",
            Col::High => "price_history.high",
            Col::Low => "price_history.low",
            Col::Close => "price_history.close",
            Col::Volume => "price_history.volume",
            Col::JobLogsTable => "batch_job_logs",
            Col::JobId => "batch_job_logs.id",
            Col::JobDate => "batch_job_logs.job_date",
            Col::JobStatus => "batch_job_logs.status",
            Col::TotalStocks => "batch_job_logs.total_stocks",
            Col::SuccessCount => "batch_job_logs.success_count",
            Col::FailureCount => "batch_job_logs.failure_count",
            Col::ErrorMessage => "batch_job_logs.error_message",
            Col::Duration => "batch_job_logs.duration",
            Col::HoldingsTable => "holdings",
            Col::HoldingId => "holdings.id",
            Col::HoldingUser => "holdings.user_id",
            Col::HoldingInstrument => "holdings.instrument_id",
            Col::Shares => "holdings.shares",
            Col::PurchasePrice => "holdings.purchase_price",
            Col::SoldDate => "holdings.sold_date",
            Col::ProposalsTable => "action_proposals",
            Col::ProposalId => "action_proposals.id",
            Col::ProposalUser => "action_proposals.user_id",
            Col::ProposalInstrument => "action_proposals.instrument_id",
            Col::ActionType => "action_proposals.action_type",
            Col::ProposalReason => "action_proposals.reason",
            Col::ProposalConfidence => "action_proposals.confidence",
            Col::IsRead => "action_proposals.is_read",
            Col::CreatedAt => "created_at",
            Col::UpdatedAt => "updated_at",
        }
    }

    fn snake(&self) -> &'static str {
        match self {
            Col::InstrumentsTable => "stocks",
            Col::InstrumentId | Col::AnalysisId | Col::PriceId | Col::JobId | Col::HoldingId | Col::ProposalId => "id",
            Col::InstrumentTicker => "ticker",
            Col::InstrumentMarket => "market",
            Col::InstrumentTarget => "is_ai_analysis_target",
            Col::AnalysesTable => "analyses",
            Col::AnalysisInstrument | Col::PriceInstrument | Col::HoldingInstrument | Col::ProposalInstrument => "stock_id",
            Col::AnalysisDate => "analysis_date",
            Col::Recommendation => "recommendation",
            Col::ConfidenceScore => "confidence_score",
            Col::Reason => "reason",
            Col::CurrentPrice => "current_price",
            Col::PeRatio => "pe_ratio",
            Col::PbRatio => "pb_ratio",
            Col::Roe => "roe",
            Col::DividendYield => "dividend_yield",
            Col::PricesTable => "price_history",
            Col::PriceDate => "date",
            Col::Open => "open",
            Col::High => "high",
            Col::Low => "low",
            Col::Close => "close",
            Col::Volume => "volume",
            Col::JobLogsTable => "batch_job_logs",
            Col::JobDate => "job_date",
            Col::JobStatus => "status",
            Col::TotalStocks => "total_stocks",
            Col::SuccessCount => "success_count",
            Col::FailureCount => "failure_count",
            Col::ErrorMessage => "error_message",
            Col::Duration => "duration",
            Col::HoldingsTable => "holdings",
            Col::HoldingUser | Col::ProposalUser => "user_id",
            Col::Shares => "shares",
            Col::PurchasePrice => "purchase_price",
            Col::SoldDate => "sold_date",
            Col::ProposalsTable => "action_proposals",
            Col::ActionType => "action_type",
            Col::ProposalReason => "reason",
            Col::ProposalConfidence => "confidence",
            Col::IsRead => "is_read",
            Col::CreatedAt => "created_at",
            Col::UpdatedAt => "updated_at",
        }
    }

    fn camel(&self) -> &'static str {
        match self {
            Col::InstrumentTarget => "isAiAnalysisTarget",
            Col::AnalysisInstrument | Col::PriceInstrument | Col::HoldingInstrument | Col::ProposalInstrument => "stockId",
            Col::HoldingUser | Col::ProposalUser => "userId",
            Col::PurchasePrice => "purchasePrice",
            Col::SoldDate => "soldDate",
            Col::ActionType => "actionType",
            Col::IsRead => "isRead",
            Col::AnalysisDate => "analysisDate",
            Col::ConfidenceScore => "confidenceScore",
            Col::CurrentPrice => "currentPrice",
            Col::PeRatio => "peRatio",
            Col::PbRatio => "pbRatio",
            Col::DividendYield => "dividendYield",
            Col::JobDate => "jobDate",
            Col::TotalStocks => "totalStocks",
            Col::SuccessCount => "successCount",
            Col::FailureCount => "failureCount",
            Col::ErrorMessage => "errorMessage",
            Col::CreatedAt => "createdAt",
            Col::UpdatedAt => "updatedAt",
            other => other.snake(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMap {
    names: HashMap<Col, String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self::snake_case()
    }
}

impl ColumnMap {
    pub fn snake_case() -> Self {
        Self { names: Col::ALL.iter().map(|c| (*c, c.snake().to_string())).collect() }
    }

    pub fn camel_case() -> Self {
        Self { names: Col::ALL.iter().map(|c| (*c, c.camel().to_string())).collect() }
    }

    pub fn from_style(style: &str) -> Self {
        match style.trim().to_ascii_lowercase().as_str() {
            "camel" | "camelcase" | "prisma" => Self::camel_case(),
            _ => Self::snake_case(),
        }
    }

    /// `key=name;key=name`; unknown keys are logged and ignored
    pub fn with_overrides(mut self, spec: &str) -> Self {
        for pair in spec.split([';', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            let Some((k, v)) = pair.split_once('=') else {
                warn!(%pair, "column override without '='");
                continue;
            };
            let (k, v) = (k.trim(), v.trim());
            match Col::ALL.iter().find(|c| c.key() == k) {
                Some(col) if !v.is_empty() => {
                    self.names.insert(*col, v.to_string());
                }
                _ => warn!(key = %k, "unknown column override"),
            }
        }
        self
    }

    /// Raw physical name
    pub fn name(&self, col: Col) -> &str {
        self.names.get(&col).map(String::as_str).unwrap_or_else(|| col.snake())
    }

    /// Quoted identifier, safe to splice into SQL
    pub fn q(&self, col: Col) -> String {
        format!("\"{}\"", self.name(col).replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let snake = ColumnMap::snake_case();
        let camel = ColumnMap::camel_case();
        assert_eq!(snake.name(Col::AnalysisInstrument), "stock_id");
        assert_eq!(camel.name(Col::AnalysisInstrument), "stockId");
        assert_eq!(camel.q(Col::ConfidenceScore), "\"confidenceScore\"");
        // kolom yang sama di kedua revisi
        assert_eq!(camel.name(Col::Recommendation), "recommendation");
        assert_eq!(camel.name(Col::AnalysesTable), "analyses");
        assert_eq!(camel.name(Col::ActionType), "actionType");
        assert_eq!(snake.name(Col::HoldingInstrument), "stock_id");
    }

    #[test]
    fn test_overrides() {
        let m = ColumnMap::from_style("snake").with_overrides("instruments=tickers; analyses.reason=rationale;bogus.key=x;noequals");
        assert_eq!(m.name(Col::InstrumentsTable), "tickers");
        assert_eq!(m.name(Col::Reason), "rationale");
        assert_eq!(m.name(Col::Roe), "roe");
    }

    #[test]
    fn test_quote_escapes() {
        let m = ColumnMap::snake_case().with_overrides("analyses.reason=we\"ird");
        assert_eq!(m.q(Col::Reason), "\"we\"\"ird\"");
    }

    #[test]
    fn test_keys_are_unique() {
        let mut keys: Vec<&str> = Col::ALL.iter().map(|c| c.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), Col::ALL.len());
    }
}
