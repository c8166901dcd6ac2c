// ===============================
// src/indicators.rs
// ===============================
//
// Indikator teknikal (pure, tanpa I/O):
// - SMA 5 & SMA 25 (simple moving average, trailing window)
// - RSI 14 dari rata-rata gain/loss harian (simple mean, bukan Wilder)
// Baris awal yang belum punya window lengkap dibuang sebelum ambil nilai terakhir.
//
use crate::domain::{CrossSignal, PriceBar, RsiSignal, TechnicalIndicators, Trend, TrendReport};
use crate::error::IndicatorError;

pub const SHORT_WINDOW: usize = 5;
pub const LONG_WINDOW: usize = 25;
pub const RSI_WINDOW: usize = 14;
pub const MIN_OBSERVATIONS: usize = LONG_WINDOW;

const RSI_OVERBOUGHT: f64 = 70.0;
const RSI_OVERSOLD: f64 = 30.0;

fn sma_at(closes: &[f64], end: usize, w: usize) -> Option<f64> {
    if end + 1 < w {
        return None;
    }
    let window = &closes[end + 1 - w..=end];
    Some(window.iter().sum::<f64>() / w as f64)
}

fn rsi_at(closes: &[f64], end: usize, w: usize) -> Option<f64> {
    // butuh w delta -> w+1 harga
    if end < w {
        return None;
    }
    let (mut gain, mut loss) = (0.0_f64, 0.0_f64);
    for i in end + 1 - w..=end {
        let delta = closes[i] - closes[i - 1];
        gain += delta.max(0.0);
        loss += (-delta).max(0.0);
    }
    let (avg_gain, avg_loss) = (gain / w as f64, loss / w as f64);
    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Latest indicator values over chronologically ordered closes.
pub fn compute(closes: &[f64]) -> Result<TechnicalIndicators, IndicatorError> {
    let usable: Vec<f64> = closes.iter().copied().filter(|c| c.is_finite()).collect();
    if usable.len() < MIN_OBSERVATIONS {
        return Err(IndicatorError::Insufficient { have: usable.len(), need: MIN_OBSERVATIONS });
    }

    // (sma5, sma25, rsi) untuk setiap baris yang semua indikatornya terdefinisi
    let rows: Vec<(f64, f64, f64)> = (0..usable.len())
        .filter_map(|i| {
            let s5 = sma_at(&usable, i, SHORT_WINDOW)?;
            let s25 = sma_at(&usable, i, LONG_WINDOW)?;
            let rsi = rsi_at(&usable, i, RSI_WINDOW)?;
            Some((s5, s25, rsi))
        })
        .collect();

    if rows.len() < 2 {
        return Err(IndicatorError::TooFewRows(rows.len()));
    }

    let (sma_5, sma_25, rsi) = rows[rows.len() - 1];
    let (previous_sma_5, previous_sma_25, _) = rows[rows.len() - 2];
    Ok(TechnicalIndicators {
        sma_5,
        sma_25,
        rsi,
        current_price: usable[usable.len() - 1],
        previous_sma_5,
        previous_sma_25,
    })
}

/// Same as [`compute`] but sorts bars by date first.
pub fn compute_from_bars(bars: &[PriceBar]) -> Result<TechnicalIndicators, IndicatorError> {
    let mut sorted: Vec<&PriceBar> = bars.iter().collect();
    sorted.sort_by_key(|b| b.date);
    let closes: Vec<f64> = sorted.iter().map(|b| b.close).collect();
    compute(&closes)
}

pub fn classify_trend(sma_5: f64, sma_25: f64, price: f64) -> Trend {
    if sma_5 > sma_25 && price > sma_5 {
        Trend::Up
    } else if sma_5 < sma_25 && price < sma_5 {
        Trend::Down
    } else {
        Trend::Flat
    }
}

pub fn classify_rsi(rsi: f64) -> RsiSignal {
    if rsi > RSI_OVERBOUGHT {
        RsiSignal::Overbought
    } else if rsi < RSI_OVERSOLD {
        RsiSignal::Oversold
    } else {
        RsiSignal::Neutral
    }
}

/// Golden / dead cross antara kemarin dan hari ini. Keduanya tidak mungkin
/// terjadi bersamaan: golden butuh sma5 > sma25, dead butuh sma5 < sma25.
pub fn detect_cross(prev_short: f64, prev_long: f64, short: f64, long: f64) -> CrossSignal {
    if prev_short <= prev_long && short > long {
        CrossSignal::GoldenCross
    } else if prev_short >= prev_long && short < long {
        CrossSignal::DeadCross
    } else {
        CrossSignal::NoSignal
    }
}

pub fn analyze_trend(ind: &TechnicalIndicators) -> TrendReport {
    let round2 = |x: f64| (x * 100.0).round() / 100.0;
    TrendReport {
        trend: classify_trend(ind.sma_5, ind.sma_25, ind.current_price),
        sma_5: round2(ind.sma_5),
        sma_25: round2(ind.sma_25),
        rsi: round2(ind.rsi),
        rsi_signal: classify_rsi(ind.rsi),
        cross: detect_cross(ind.previous_sma_5, ind.previous_sma_25, ind.sma_5, ind.sma_25),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn uptrend_bars(days: usize) -> Vec<PriceBar> {
        let base = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        (0..days)
            .map(|i| {
                let c = 1000.0 + i as f64 * 10.0;
                PriceBar { date: base + Duration::days(i as i64), open: c - 10.0, high: c + 10.0, low: c - 20.0, close: c, volume: 1_000_000 }
            })
            .collect()
    }

    fn indicators(sma_5: f64, sma_25: f64, rsi: f64, price: f64, p5: f64, p25: f64) -> TechnicalIndicators {
        TechnicalIndicators { sma_5, sma_25, rsi, current_price: price, previous_sma_5: p5, previous_sma_25: p25 }
    }

    #[test]
    fn test_uptrend_90_days() {
        let ind = compute_from_bars(&uptrend_bars(90)).unwrap();
        assert_eq!(ind.current_price, 1890.0);
        assert!((ind.sma_5 - 1870.0).abs() < 1e-9);
        assert!((ind.sma_25 - 1770.0).abs() < 1e-9);
        assert!(ind.rsi >= 0.0 && ind.rsi <= 100.0);

        let report = analyze_trend(&ind);
        assert_eq!(report.trend, Trend::Up);
        assert_eq!(report.cross, CrossSignal::NoSignal);
    }

    #[test]
    fn test_bars_are_sorted_before_compute() {
        let mut bars = uptrend_bars(40);
        bars.reverse();
        let ind = compute_from_bars(&bars).unwrap();
        assert_eq!(ind.current_price, 1390.0);
    }

    #[test]
    fn test_insufficient_data() {
        assert_eq!(compute(&[]), Err(IndicatorError::Insufficient { have: 0, need: 25 }));
        let closes: Vec<f64> = (0..24).map(|i| 100.0 + i as f64).collect();
        assert_eq!(compute(&closes), Err(IndicatorError::Insufficient { have: 24, need: 25 }));
    }

    #[test]
    fn test_exactly_25_has_no_previous_row() {
        let closes: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        assert_eq!(compute(&closes), Err(IndicatorError::TooFewRows(1)));
        let closes: Vec<f64> = (0..26).map(|i| 100.0 + i as f64).collect();
        assert!(compute(&closes).is_ok());
    }

    #[test]
    fn test_non_finite_closes_do_not_count() {
        let mut closes: Vec<f64> = (0..26).map(|i| 100.0 + i as f64).collect();
        closes[3] = f64::NAN;
        assert_eq!(compute(&closes), Err(IndicatorError::TooFewRows(1)));
    }

    #[test]
    fn test_rsi_bounds_on_varied_series() {
        // zig-zag dengan amplitudo berubah-ubah
        for seed in 1..20u64 {
            let closes: Vec<f64> = (0..60)
                .map(|i| {
                    let x = (i as u64 * 7919 + seed * 104729) % 97;
                    500.0 + x as f64 * (1.0 + seed as f64 / 10.0)
                })
                .collect();
            let ind = compute(&closes).unwrap();
            assert!(ind.rsi >= 0.0 && ind.rsi <= 100.0, "rsi {} out of range", ind.rsi);
        }
    }

    #[test]
    fn test_rsi_edges() {
        let flat = vec![100.0; 30];
        assert_eq!(compute(&flat).unwrap().rsi, 50.0);
        let down: Vec<f64> = (0..30).map(|i| 500.0 - i as f64).collect();
        assert_eq!(compute(&down).unwrap().rsi, 0.0);
    }

    #[test]
    fn test_moderate_rsi_is_neutral() {
        // naik 2, turun 1 bergantian -> avg gain 1.0, avg loss 0.5 -> RSI 66.7
        let mut closes = vec![1000.0];
        for i in 1..60 {
            let step = if i % 2 == 1 { 2.0 } else { -1.0 };
            closes.push(closes[i - 1] + step);
        }
        let ind = compute(&closes).unwrap();
        assert!((ind.rsi - 200.0 / 3.0).abs() < 1.0);
        assert_eq!(analyze_trend(&ind).rsi_signal, RsiSignal::Neutral);
    }

    #[test]
    fn test_golden_cross() {
        let report = analyze_trend(&indicators(1510.0, 1500.0, 55.0, 1520.0, 1490.0, 1500.0));
        assert_eq!(report.cross, CrossSignal::GoldenCross);
    }

    #[test]
    fn test_dead_cross() {
        assert_eq!(detect_cross(1510.0, 1500.0, 1490.0, 1500.0), CrossSignal::DeadCross);
        assert_eq!(detect_cross(1500.0, 1500.0, 1490.0, 1500.0), CrossSignal::DeadCross);
        assert_eq!(detect_cross(1500.0, 1500.0, 1500.0, 1500.0), CrossSignal::NoSignal);
    }

    #[test]
    fn test_crosses_are_mutually_exclusive() {
        let vals = [1490.0, 1500.0, 1510.0];
        for &a in &vals {
            for &b in &vals {
                for &c in &vals {
                    for &d in &vals {
                        let golden = a <= b && c > d;
                        let dead = a >= b && c < d;
                        assert!(!(golden && dead));
                        let expected = if golden {
                            CrossSignal::GoldenCross
                        } else if dead {
                            CrossSignal::DeadCross
                        } else {
                            CrossSignal::NoSignal
                        };
                        assert_eq!(detect_cross(a, b, c, d), expected);
                    }
                }
            }
        }
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(classify_trend(1500.0, 1400.0, 1550.0), Trend::Up);
        assert_eq!(classify_trend(1400.0, 1500.0, 1350.0), Trend::Down);
        assert_eq!(classify_trend(1500.0, 1400.0, 1450.0), Trend::Flat);
        // pure: input sama -> label sama
        assert_eq!(classify_trend(1.0, 2.0, 0.5), classify_trend(1.0, 2.0, 0.5));
    }

    #[test]
    fn test_rsi_signal_thresholds() {
        assert_eq!(classify_rsi(70.1), RsiSignal::Overbought);
        assert_eq!(classify_rsi(70.0), RsiSignal::Neutral);
        assert_eq!(classify_rsi(30.0), RsiSignal::Neutral);
        assert_eq!(classify_rsi(29.9), RsiSignal::Oversold);
    }
}
