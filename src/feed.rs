// ===============================
// src/feed.rs
// ===============================
//
// Market data fetcher (Yahoo Finance) dengan retry + rate-limit delay.
// - Ticker pasar JP otomatis diberi suffix ".T" (kalau belum ada).
// - Gagal ambil histori harga = warning saja; yang fatal hanya harga saat ini.
// - Delay rate-limit SELALU dijalankan, baik sukses maupun gagal.
//
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::domain::{Instrument, Market, PriceBar, RawMarketSnapshot};
use crate::error::FetchError;
use crate::metrics::FETCH_LATENCY;
use crate::retry::RetryPolicy;

const JP_SUFFIX: &str = ".T";

/// Valuation fields as the provider reports them (ratios as fractions)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quote {
    pub long_name: Option<String>,
    pub sector: Option<String>,
    pub current_price: Option<f64>,
    pub trailing_pe: Option<f64>,
    pub price_to_book: Option<f64>,
    pub return_on_equity: Option<f64>,
    pub dividend_yield: Option<f64>,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError>;
    /// Daily bars over a provider range string ("1mo", "3mo")
    async fn history(&self, symbol: &str, range: &str) -> Result<Vec<PriceBar>, FetchError>;
}

pub fn normalize_ticker(ticker: &str, market: Market) -> String {
    let t = ticker.trim();
    match market {
        Market::Jp if !t.ends_with(JP_SUFFIX) => format!("{t}{JP_SUFFIX}"),
        _ => t.to_string(),
    }
}

// Nilai 0 / NaN dari upstream dianggap "tidak ada"
fn present(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x != 0.0)
}

// ---------------------------------------------------------------------------
// Yahoo Finance payloads (hanya field yang dipakai)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct Raw {
    raw: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryEnvelope {
    quote_summary: SummaryBody,
}

#[derive(Debug, Deserialize)]
struct SummaryBody {
    #[serde(default)]
    result: Option<Vec<SummaryResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SummaryResult {
    price: Option<PriceModule>,
    summary_detail: Option<SummaryDetail>,
    default_key_statistics: Option<KeyStatistics>,
    financial_data: Option<FinancialData>,
    asset_profile: Option<AssetProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PriceModule {
    long_name: Option<String>,
    short_name: Option<String>,
    regular_market_price: Option<Raw>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SummaryDetail {
    #[serde(rename = "trailingPE")]
    trailing_pe: Option<Raw>,
    dividend_yield: Option<Raw>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct KeyStatistics {
    price_to_book: Option<Raw>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FinancialData {
    current_price: Option<Raw>,
    return_on_equity: Option<Raw>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssetProfile {
    sector: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChartResult {
    meta: ChartMeta,
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChartMeta {
    gmtoffset: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChartIndicators {
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChartQuote {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<i64>>,
}

fn raw(v: &Option<Raw>) -> Option<f64> {
    v.as_ref().and_then(|r| r.raw)
}

fn parse_summary(body: &str) -> Result<Quote, FetchError> {
    let env: SummaryEnvelope = serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    if let Some(err) = env.quote_summary.error.filter(|e| !e.is_null()) {
        return Err(FetchError::Decode(format!("quoteSummary error: {err}")));
    }
    let r = env
        .quote_summary
        .result
        .and_then(|v| v.into_iter().next())
        .ok_or_else(|| FetchError::Decode("quoteSummary: empty result".into()))?;

    let price = r.price.unwrap_or_default();
    let detail = r.summary_detail.unwrap_or_default();
    let stats = r.default_key_statistics.unwrap_or_default();
    let fin = r.financial_data.unwrap_or_default();

    Ok(Quote {
        long_name: price.long_name.or(price.short_name),
        sector: r.asset_profile.and_then(|a| a.sector),
        current_price: raw(&fin.current_price).or_else(|| raw(&price.regular_market_price)),
        trailing_pe: raw(&detail.trailing_pe),
        price_to_book: raw(&stats.price_to_book),
        return_on_equity: raw(&fin.return_on_equity),
        dividend_yield: raw(&detail.dividend_yield),
    })
}

fn parse_chart(body: &str) -> Result<Vec<PriceBar>, FetchError> {
    let env: ChartEnvelope = serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    if let Some(err) = env.chart.error.filter(|e| !e.is_null()) {
        return Err(FetchError::Decode(format!("chart error: {err}")));
    }
    let Some(r) = env.chart.result.and_then(|v| v.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let Some(q) = r.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();
    let mut bars = Vec::with_capacity(r.timestamp.len());
    for (i, ts) in r.timestamp.iter().enumerate() {
        // bar tanpa close (hari libur / data bolong) dilewati
        let Some(close) = at(&q.close, i) else { continue };
        let Some(local) = DateTime::from_timestamp(ts + r.meta.gmtoffset, 0) else { continue };
        let date: NaiveDate = local.date_naive();
        bars.push(PriceBar {
            date,
            open: at(&q.open, i).unwrap_or(close),
            high: at(&q.high, i).unwrap_or(close),
            low: at(&q.low, i).unwrap_or(close),
            close,
            volume: q.volume.get(i).copied().flatten().unwrap_or(0),
        });
    }
    Ok(bars)
}

/// Yahoo Finance public endpoints
pub struct YahooFinance {
    http: reqwest::Client,
    base: Url,
}

impl YahooFinance {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let base = Url::parse(base_url).map_err(|e| FetchError::Decode(format!("bad base url {base_url}: {e}")))?;
        let http = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (stock_batch_rust)")
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str, symbol: &str) -> Result<Url, FetchError> {
        let p = format!("{}/{}", path.trim_end_matches('/'), urlencoding::encode(symbol));
        self.base.join(&p).map_err(|e| FetchError::Decode(format!("bad url: {e}")))
    }

    async fn get_text(&self, url: Url, query: &[(&str, &str)]) -> Result<String, FetchError> {
        debug!(%url, "GET");
        let rsp = self.http.get(url).query(query).send().await?;
        let status = rsp.status();
        let body = rsp.text().await?;
        if !status.is_success() {
            return Err(FetchError::Status { status: status.as_u16(), body: body.chars().take(200).collect() });
        }
        Ok(body)
    }
}

#[async_trait]
impl MarketDataSource for YahooFinance {
    async fn quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        let url = self.endpoint("v10/finance/quoteSummary", symbol)?;
        let body = self
            .get_text(url, &[("modules", "price,summaryDetail,defaultKeyStatistics,financialData,assetProfile")])
            .await?;
        parse_summary(&body)
    }

    async fn history(&self, symbol: &str, range: &str) -> Result<Vec<PriceBar>, FetchError> {
        let url = self.endpoint("v8/finance/chart", symbol)?;
        let body = self.get_text(url, &[("range", range), ("interval", "1d")]).await?;
        parse_chart(&body)
    }
}

/// Rate-limited, retrying wrapper around a [`MarketDataSource`]
pub struct Fetcher {
    source: Arc<dyn MarketDataSource>,
    retry: RetryPolicy,
    rate_limit_delay: Duration,
    history_range: String,
}

impl Fetcher {
    pub fn new(source: Arc<dyn MarketDataSource>, retry: RetryPolicy, rate_limit_delay: Duration, history_range: &str) -> Self {
        Self { source, retry, rate_limit_delay, history_range: history_range.to_string() }
    }

    async fn fetch_once(&self, inst: &Instrument, symbol: &str) -> Result<RawMarketSnapshot, FetchError> {
        let q = self.source.quote(symbol).await?;
        let price = present(q.current_price).filter(|p| *p > 0.0).ok_or_else(|| FetchError::NoPrice(symbol.to_string()))?;

        let mut snap = RawMarketSnapshot::new(&inst.ticker, inst.market);
        snap.company_name = q.long_name.unwrap_or_else(|| inst.ticker.clone());
        snap.sector = q.sector.unwrap_or_else(|| "Unknown".to_string());
        snap.current_price = Some(price);
        snap.pe_ratio = present(q.trailing_pe);
        snap.pb_ratio = present(q.price_to_book);
        // ROE & dividend yield disimpan dalam persen
        snap.roe = present(q.return_on_equity).map(|x| x * 100.0);
        snap.dividend_yield = present(q.dividend_yield).map(|x| x * 100.0);

        match self.source.history(symbol, &self.history_range).await {
            Ok(mut bars) => {
                bars.sort_by_key(|b| b.date);
                snap.price_history = bars;
            }
            Err(e) => warn!(ticker = %inst.ticker, error = %e, "price history unavailable, continuing without it"),
        }
        Ok(snap)
    }

    /// Never fails: on exhausted retries the snapshot carries `error`.
    pub async fn fetch(&self, inst: &Instrument) -> RawMarketSnapshot {
        let symbol = normalize_ticker(&inst.ticker, inst.market);
        let started = Instant::now();
        let result = self.retry.run("market_data", |_| self.fetch_once(inst, &symbol)).await;
        FETCH_LATENCY.observe(started.elapsed().as_secs_f64() * 1000.0);

        let snap = match result {
            Ok(s) => s,
            Err(e) => {
                warn!(ticker = %inst.ticker, %symbol, error = %e, "market data fetch failed");
                let mut s = RawMarketSnapshot::new(&inst.ticker, inst.market);
                s.error = Some(e.to_string());
                s
            }
        };

        if !self.rate_limit_delay.is_zero() {
            sleep(self.rate_limit_delay).await;
        }
        snap
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeSource;
    use super::*;

    fn jp(ticker: &str) -> Instrument {
        Instrument { id: format!("id-{ticker}"), ticker: ticker.into(), market: Market::Jp, analysis_target: true }
    }

    fn fetcher(src: FakeSource) -> (Arc<FakeSource>, Fetcher) {
        let src = Arc::new(src);
        let f = Fetcher::new(src.clone(), RetryPolicy::immediate(3), Duration::ZERO, "1mo");
        (src, f)
    }

    #[test]
    fn test_normalize_ticker() {
        assert_eq!(normalize_ticker("7203", Market::Jp), "7203.T");
        assert_eq!(normalize_ticker("7203.T", Market::Jp), "7203.T");
        assert_eq!(normalize_ticker("AAPL", Market::Us), "AAPL");
    }

    #[test]
    fn test_parse_summary() {
        let body = r#"{"quoteSummary":{"result":[{
            "price":{"longName":"Toyota Motor Corporation","regularMarketPrice":{"raw":2850.5}},
            "summaryDetail":{"trailingPE":{"raw":9.8},"dividendYield":{"raw":0.0281}},
            "defaultKeyStatistics":{"priceToBook":{"raw":1.12}},
            "financialData":{"returnOnEquity":{"raw":0.131}},
            "assetProfile":{"sector":"Consumer Cyclical"}
        }],"error":null}}"#;
        let q = parse_summary(body).unwrap();
        assert_eq!(q.long_name.as_deref(), Some("Toyota Motor Corporation"));
        assert_eq!(q.current_price, Some(2850.5));
        assert_eq!(q.trailing_pe, Some(9.8));
        assert_eq!(q.price_to_book, Some(1.12));
        assert_eq!(q.sector.as_deref(), Some("Consumer Cyclical"));
    }

    #[test]
    fn test_parse_summary_error_payload() {
        let body = r#"{"quoteSummary":{"result":null,"error":{"code":"Not Found"}}}"#;
        assert!(matches!(parse_summary(body), Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_parse_chart_skips_null_closes() {
        // 2026-03-02 00:00 UTC dan +1 hari; gmtoffset JST
        let body = r#"{"chart":{"result":[{
            "meta":{"gmtoffset":32400},
            "timestamp":[1772409600,1772496000,1772582400],
            "indicators":{"quote":[{
                "open":[100.0,null,102.0],"high":[101.0,null,103.0],"low":[99.0,null,101.0],
                "close":[100.5,null,102.5],"volume":[1000,null,null]
            }]}
        }],"error":null}}"#;
        let bars = parse_chart(body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(bars[1].close, 102.5);
        assert_eq!(bars[1].volume, 0);
    }

    #[tokio::test]
    async fn test_fetch_populates_snapshot() {
        let mut src = FakeSource::default().with("7203.T", 2850.0, vec![]);
        if let Some(q) = src.quotes.get_mut("7203.T") {
            q.price_to_book = Some(0.0);
            q.return_on_equity = Some(0.12);
        }
        let (_, f) = fetcher(src);
        let snap = f.fetch(&jp("7203")).await;
        assert!(snap.is_usable());
        assert_eq!(snap.ticker, "7203");
        assert_eq!(snap.company_name, "7203.T Corp");
        assert_eq!(snap.sector, "Unknown");
        assert_eq!(snap.pe_ratio, Some(12.5));
        // nol dari upstream -> None
        assert_eq!(snap.pb_ratio, None);
        assert!((snap.roe.unwrap() - 12.0).abs() < 1e-9);
        assert_eq!(snap.dividend_yield, None);
    }

    #[tokio::test]
    async fn test_history_failure_is_not_fatal() {
        let mut src = FakeSource::default().with("7203.T", 2850.0, vec![]);
        src.bars.clear();
        let (_, f) = fetcher(src);
        let snap = f.fetch(&jp("7203")).await;
        assert!(snap.is_usable());
        assert!(snap.price_history.is_empty());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let mut src = FakeSource::default().with("7203.T", 2850.0, vec![]);
        src.flaky.insert("7203.T".into(), 2);
        let (src, f) = fetcher(src);
        let snap = f.fetch(&jp("7203")).await;
        assert!(snap.is_usable());
        assert_eq!(src.calls_for("7203.T"), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_error() {
        let (src, f) = fetcher(FakeSource::default());
        let snap = f.fetch(&jp("9999")).await;
        assert!(!snap.is_usable());
        assert!(snap.error.as_deref().unwrap_or_default().contains("404"));
        assert_eq!(src.calls_for("9999.T"), 3);
    }

    #[tokio::test]
    async fn test_zero_price_is_decisive_failure() {
        let (_, f) = fetcher(FakeSource::default().with("AAPL", 0.0, vec![]));
        let inst = Instrument { id: "x".into(), ticker: "AAPL".into(), market: Market::Us, analysis_target: true };
        let snap = f.fetch(&inst).await;
        assert!(matches!(snap.error.as_deref(), Some(e) if e.contains("no current price")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_delay_applies_on_failure() {
        let f = Fetcher::new(Arc::new(FakeSource::default()), RetryPolicy::immediate(1), Duration::from_secs(2), "1mo");
        let start = Instant::now();
        let snap = f.fetch(&jp("1301")).await;
        assert!(snap.error.is_some());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
