// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Batch outcome metrics --------
pub static INSTRUMENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("instruments_total", "instruments handled (label: outcome = success|failed|skipped)"),
        &["outcome"],
    )
    .unwrap()
});

pub static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("retries_total", "retried upstream calls (label: op)"), &["op"]).unwrap()
});

pub static MODEL_FALLBACKS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("model_fallbacks_total", "recommendations replaced by the Hold/0 fallback").unwrap()
});

pub static MODEL_TOKENS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("model_tokens_total", "model tokens (label: kind = prompt|completion)"), &["kind"])
        .unwrap()
});

pub static PRICE_ROWS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("price_rows_written_total", "price history rows upserted").unwrap());

// Latency of one full fetch (incl. retries, excl. rate-limit sleep)
pub static FETCH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new("fetch_latency_ms", "market data fetch latency (ms)").buckets(vec![
        50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0, 30000.0,
    ]))
    .unwrap()
});

pub static PROPOSALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("action_proposals_total", "portfolio proposals written (label: action)"), &["action"])
        .unwrap()
});

pub static QUEUE_DEPTH: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("queue_depth", "instruments still waiting in the work queue").unwrap());

pub static LAST_RUN_DURATION_MS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("last_run_duration_ms", "duration of the last batch run (ms)").unwrap());

pub static LAST_RUN_COST_MICROUSD: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("last_run_cost_microusd", "estimated model spend of the last run (1e-6 USD)").unwrap());

// ---- Config visibility ----
pub static CONFIG_RUN_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_run_mode", "run mode (label: mode), value = workers"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(INSTRUMENTS.clone())),
        REGISTRY.register(Box::new(RETRIES.clone())),
        REGISTRY.register(Box::new(MODEL_FALLBACKS.clone())),
        REGISTRY.register(Box::new(MODEL_TOKENS.clone())),
        REGISTRY.register(Box::new(PRICE_ROWS.clone())),
        REGISTRY.register(Box::new(PROPOSALS.clone())),
        REGISTRY.register(Box::new(FETCH_LATENCY.clone())),
        REGISTRY.register(Box::new(QUEUE_DEPTH.clone())),
        REGISTRY.register(Box::new(LAST_RUN_DURATION_MS.clone())),
        REGISTRY.register(Box::new(LAST_RUN_COST_MICROUSD.clone())),
        REGISTRY.register(Box::new(CONFIG_RUN_MODE.clone())),
    ] {
        let _ = m;
    }
}

/// Snapshot registry dalam text exposition format
pub fn encode_metrics() -> Vec<u8> {
    let mut out = Vec::with_capacity(4096);
    match TextEncoder::new().encode(&REGISTRY.gather(), &mut out) {
        Ok(()) if !out.is_empty() => out,
        Ok(()) => b"# registry empty\n".to_vec(),
        Err(e) => {
            tracing::warn!(error = %e, "metrics encode failed");
            b"# encode error\n".to_vec()
        }
    }
}

// Routing dari request line saja: "GET /metrics HTTP/1.1"
fn respond(request_line: &str) -> Vec<u8> {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let (status, ctype, body) = match path.split('?').next().unwrap_or("/") {
        "/" | "/metrics" => ("200 OK", "text/plain; version=0.0.4; charset=utf-8", encode_metrics()),
        "/healthz" => ("200 OK", "text/plain", b"ok\n".to_vec()),
        _ => ("404 Not Found", "text/plain", b"not found\n".to_vec()),
    };
    let mut rsp = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {ctype}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    rsp.extend_from_slice(&body);
    rsp
}

fn handle_client(mut stream: TcpStream) {
    // batas baca 2s per klien
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 1024];
    let n = stream.read(&mut buf).unwrap_or(0);
    let head = String::from_utf8_lossy(&buf[..n]);
    let rsp = respond(head.lines().next().unwrap_or_default());
    if let Err(e) = stream.write_all(&rsp).and_then(|_| stream.flush()) {
        tracing::debug!(error = %e, "metrics client went away");
    }
}

/// Metrics endpoint selama batch berjalan, di OS thread sendiri.
/// Bind gagal hanya di-log: batch tetap jalan tanpa endpoint.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed");
                return;
            }
        };
        tracing::info!(%addr, "metrics endpoint up (/metrics, /healthz)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_family() {
        init();
        INSTRUMENTS.with_label_values(&["success"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("instruments_total"));
    }

    #[test]
    fn test_routes() {
        init();
        let ok = String::from_utf8(respond("GET /metrics HTTP/1.1")).unwrap();
        assert!(ok.starts_with("HTTP/1.1 200 OK"));
        assert!(ok.contains("version=0.0.4"));

        let health = String::from_utf8(respond("GET /healthz HTTP/1.1")).unwrap();
        assert!(health.ends_with("\r\n\r\nok\n"));

        let missing = String::from_utf8(respond("GET /nope HTTP/1.1")).unwrap();
        assert!(missing.starts_with("HTTP/1.1 404 Not Found"));
        // request kosong -> diperlakukan sebagai "/"
        assert!(String::from_utf8(respond("")).unwrap().starts_with("HTTP/1.1 200 OK"));
    }
}
