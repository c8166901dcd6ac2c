// ===============================
// src/advisor.rs
// ===============================
//
// Recommendation generator (chat completion, JSON mode).
// - Prompt: identitas + rasio valuasi ("N/A" kalau kosong), opsional indikator + rubric.
// - Retry: RetryPolicy::model() -> 1s, 2s. Parse gagal = attempt gagal.
// - recommend() tidak pernah error: fallback Hold / 0 + pesan error terakhir.
//
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::domain::{Advice, Market, RawMarketSnapshot, Recommendation, TechnicalIndicators};
use crate::error::ModelError;
use crate::indicators::analyze_trend;
use crate::metrics::MODEL_FALLBACKS;
use crate::retry::RetryPolicy;
use crate::usage::UsageTracker;

pub const SYSTEM_PROMPT: &str = "あなたは初心者投資家向けのAI投資アドバイザーです。JSON形式で回答してください。";

/// Raw completion + (prompt_tokens, completion_tokens) when reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatCompletion {
    pub content: String,
    pub usage: Option<(u64, u64)>,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<ChatCompletion, ModelError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

pub struct OpenAiChat {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<ChatCompletion, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
        });

        let rsp = self.http.post(&self.endpoint).bearer_auth(&self.api_key).json(&body).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            let text = rsp.text().await.unwrap_or_default();
            return Err(ModelError::Status { status: status.as_u16(), body: text.chars().take(300).collect() });
        }

        let parsed: ChatResponse = rsp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        // konten kosong ditolak di parse_advice; usage tetap dilaporkan
        Ok(ChatCompletion { content, usage: parsed.usage.map(|u| (u.prompt_tokens, u.completion_tokens)) })
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Everything the prompt is built from
#[derive(Debug, Clone, Copy)]
pub struct AdviceRequest<'a> {
    pub snapshot: &'a RawMarketSnapshot,
    pub indicators: Option<&'a TechnicalIndicators>,
    /// Portfolio-advisory variant: average purchase price of a holding
    pub purchase_price: Option<f64>,
}

fn or_na(v: Option<f64>, suffix: &str) -> String {
    match v {
        Some(x) => format!("{x:.2}{suffix}"),
        None => "N/A".to_string(),
    }
}

pub fn build_prompt(req: &AdviceRequest<'_>) -> String {
    let s = req.snapshot;
    let market = s.market.unwrap_or(Market::Us);
    let (market_label, unit) = match market {
        Market::Jp => ("日本", "円"),
        Market::Us => ("米国", "ドル"),
    };

    let mut p = String::new();
    let _ = writeln!(p, "以下の銘柄データを分析し、投資推奨を提供してください。");
    let _ = writeln!(p);
    let _ = writeln!(p, "【銘柄情報】");
    let _ = writeln!(p, "- ティッカー: {}", s.ticker);
    let _ = writeln!(p, "- 企業名: {}", s.company_name);
    let _ = writeln!(p, "- 市場: {market_label} ({})", market.currency());
    let _ = writeln!(p, "- セクター: {}", s.sector);
    let _ = writeln!(p, "- 現在価格: {}", or_na(s.current_price, unit));
    let _ = writeln!(p, "- PER: {}", or_na(s.pe_ratio, ""));
    let _ = writeln!(p, "- PBR: {}", or_na(s.pb_ratio, ""));
    let _ = writeln!(p, "- ROE: {}", or_na(s.roe, "%"));
    let _ = writeln!(p, "- 配当利回り: {}", or_na(s.dividend_yield, "%"));

    if let (Some(buy), Some(now)) = (req.purchase_price.filter(|x| *x > 0.0), s.current_price) {
        let pct = (now - buy) / buy * 100.0;
        let _ = writeln!(p, "- 購入単価: {buy:.2}{unit}");
        let _ = writeln!(p, "- 損益: {pct:+.2}%");
    }

    if let Some(ind) = req.indicators {
        let r = analyze_trend(ind);
        let _ = writeln!(p);
        let _ = writeln!(p, "【テクニカル指標】");
        let _ = writeln!(p, "- 5日移動平均: {:.2}", r.sma_5);
        let _ = writeln!(p, "- 25日移動平均: {:.2}", r.sma_25);
        let _ = writeln!(p, "- RSI(14): {:.1} ({})", r.rsi, r.rsi_signal.as_str());
        let _ = writeln!(p, "- トレンド: {}", r.trend.as_str());
        let _ = writeln!(p, "- クロス: {}", r.cross.as_str());
        let _ = writeln!(p);
        let _ = writeln!(p, "【判断基準】");
        let _ = writeln!(p, "- 利益が+15%以上 → 利確を検討");
        let _ = writeln!(p, "- 損失が-10%以上 → 損切りを検討");
        let _ = writeln!(p, "- RSI 70以上 → 買われすぎ");
        let _ = writeln!(p, "- RSI 30以下 → 売られすぎ");
        let _ = writeln!(p, "- デッドクロス（MA5 < MA25）→ 売却検討");
    }

    let _ = writeln!(p);
    let _ = writeln!(p, "以下のJSON形式で回答してください：");
    let _ = writeln!(
        p,
        r#"{{"recommendation": "Buy" | "Sell" | "Hold", "confidence_score": 0-100の整数, "reason": "推奨理由を300文字程度で記述"}}"#
    );
    p
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawAdvice {
    recommendation: String,
    #[serde(default, alias = "confidence")]
    confidence_score: Option<serde_json::Value>,
    #[serde(default)]
    reason: String,
}

// field wajib; angka atau string angka ("80", "80%")
fn confidence(v: Option<&serde_json::Value>) -> Result<u8, ModelError> {
    let x = match v {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().trim_end_matches('%').trim().parse().ok(),
        Some(other) => return Err(ModelError::Confidence(other.to_string())),
        None => return Err(ModelError::Confidence("missing".into())),
    };
    match x {
        Some(x) if x.is_finite() => Ok(x.round().clamp(0.0, 100.0) as u8),
        _ => Err(ModelError::Confidence(format!("{v:?}"))),
    }
}

pub fn parse_advice(content: &str) -> Result<Advice, ModelError> {
    if content.trim().is_empty() {
        return Err(ModelError::Empty);
    }
    let raw: RawAdvice = serde_json::from_str(content)?;
    let recommendation =
        Recommendation::parse(&raw.recommendation).ok_or_else(|| ModelError::Recommendation(raw.recommendation.clone()))?;
    let confidence_score = confidence(raw.confidence_score.as_ref())?;
    Ok(Advice { recommendation, confidence_score, reason: raw.reason })
}

pub fn fallback(error: &str) -> Advice {
    Advice {
        recommendation: Recommendation::Hold,
        confidence_score: 0,
        reason: format!("AI分析中にエラーが発生しました: {error}"),
    }
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

pub struct Advisor {
    model: Arc<dyn ChatModel>,
    usage: Arc<UsageTracker>,
    retry: RetryPolicy,
}

impl Advisor {
    pub fn new(model: Arc<dyn ChatModel>, usage: Arc<UsageTracker>, retry: RetryPolicy) -> Self {
        Self { model, usage, retry }
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Always yields a well-formed [`Advice`].
    pub async fn recommend(&self, req: &AdviceRequest<'_>) -> Advice {
        let prompt = build_prompt(req);
        let prompt = prompt.as_str();
        let model = self.model.as_ref();
        let usage = self.usage.as_ref();

        let result = self
            .retry
            .run("model", move |attempt| async move {
                let c = model.complete(SYSTEM_PROMPT, prompt).await?;
                if let Some((input, output)) = c.usage {
                    usage.add_usage(input, output);
                }
                debug!(attempt = attempt + 1, len = c.content.len(), "completion received");
                parse_advice(&c.content)
            })
            .await;

        match result {
            Ok(advice) => advice,
            Err(e) => {
                MODEL_FALLBACKS.inc();
                warn!(ticker = %req.snapshot.ticker, error = %e, "model failed after retries, using fallback");
                fallback(&e.to_string())
            }
        }
    }
}
