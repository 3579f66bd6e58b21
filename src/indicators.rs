use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::IndicatorError;
use crate::models::{Bar, TickKind, TickRecord};

fn check_window(name: &str, window: usize) -> Result<(), IndicatorError> {
    if window == 0 {
        return Err(IndicatorError::InvalidParameter(format!(
            "{name} window must be positive"
        )));
    }
    Ok(())
}

/// Rolling mean. Output has `len - window + 1` values (empty when too short).
pub fn sma(values: &[f64], window: usize) -> Result<Vec<f64>, IndicatorError> {
    check_window("sma", window)?;
    Ok(values
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect())
}

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded with the
/// first value. Same length as the input.
pub fn ema(values: &[f64], span: usize) -> Result<Vec<f64>, IndicatorError> {
    check_window("ema", span)?;
    let alpha = 2.0 / (span as f64 + 1.0);
    Ok(smooth(values, alpha))
}

fn smooth(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &x in values {
        let next = match prev {
            Some(p) => alpha * x + (1.0 - alpha) * p,
            None => x,
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Macd {
    pub dif: Vec<f64>,
    pub dea: Vec<f64>,
    pub bar: Vec<f64>,
}

/// MACD: `dif = ema(fast) - ema(slow)`, `dea = ema(dif, signal)`,
/// `bar = (dif - dea) * 2`.
pub fn macd(values: &[f64], fast: usize, slow: usize, signal: usize) -> Result<Macd, IndicatorError> {
    check_window("macd signal", signal)?;
    if fast >= slow {
        return Err(IndicatorError::InvalidParameter(format!(
            "macd fast period {fast} must be shorter than slow period {slow}"
        )));
    }
    let fast_ema = ema(values, fast)?;
    let slow_ema = ema(values, slow)?;
    let dif: Vec<f64> = fast_ema.iter().zip(&slow_ema).map(|(f, s)| f - s).collect();
    let dea = ema(&dif, signal)?;
    let bar = dif.iter().zip(&dea).map(|(d, e)| (d - e) * 2.0).collect();
    Ok(Macd { dif, dea, bar })
}

/// RSI from rolling means of gains and losses. Output has `len - period`
/// values. A window with no losses reads 100, a flat window reads 50.
pub fn rsi(values: &[f64], period: usize) -> Result<Vec<f64>, IndicatorError> {
    check_window("rsi", period)?;
    let deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

    Ok(deltas
        .windows(period)
        .map(|w| {
            let gain = w.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
            let loss = -w.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;
            if loss == 0.0 {
                if gain == 0.0 {
                    50.0
                } else {
                    100.0
                }
            } else {
                100.0 - 100.0 / (1.0 + gain / loss)
            }
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bollinger {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

/// Bollinger bands over sample standard deviation. Tail-trimmed like [`sma`].
pub fn bollinger(values: &[f64], window: usize, width: f64) -> Result<Bollinger, IndicatorError> {
    check_window("bollinger", window)?;
    if !(width.is_finite() && width > 0.0) {
        return Err(IndicatorError::InvalidParameter(format!(
            "bollinger width must be positive, got {width}"
        )));
    }

    let mut bands = Bollinger {
        upper: Vec::new(),
        middle: Vec::new(),
        lower: Vec::new(),
    };
    for w in values.windows(window) {
        let mean = w.iter().sum::<f64>() / window as f64;
        let std_dev = if window > 1 {
            (w.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (window - 1) as f64).sqrt()
        } else {
            0.0
        };
        bands.upper.push(mean + width * std_dev);
        bands.middle.push(mean);
        bands.lower.push(mean - width * std_dev);
    }
    Ok(bands)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Kdj {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
    pub j: Vec<f64>,
}

/// KDJ with an expanding window for the first `n - 1` bars. Same length as input.
pub fn kdj(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    n: usize,
    m1: usize,
    m2: usize,
) -> Result<Kdj, IndicatorError> {
    check_window("kdj n", n)?;
    check_window("kdj m1", m1)?;
    check_window("kdj m2", m2)?;
    if high.len() != close.len() || low.len() != close.len() {
        return Err(IndicatorError::InvalidParameter(
            "kdj inputs must have equal length".to_string(),
        ));
    }

    let rsv: Vec<f64> = (0..close.len())
        .map(|i| {
            let from = (i + 1).saturating_sub(n);
            let hh = high[from..=i].iter().cloned().fold(f64::MIN, f64::max);
            let ll = low[from..=i].iter().cloned().fold(f64::MAX, f64::min);
            if hh > ll {
                (close[i] - ll) / (hh - ll) * 100.0
            } else {
                50.0
            }
        })
        .collect();

    let k = smooth(&rsv, 1.0 / m1 as f64);
    let d = smooth(&k, 1.0 / m2 as f64);
    let j = k.iter().zip(&d).map(|(k, d)| 3.0 * k - 2.0 * d).collect();
    Ok(Kdj { k, d, j })
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KlineIndicators {
    pub ma5: Option<f64>,
    pub ma10: Option<f64>,
    pub ma20: Option<f64>,
    pub ma60: Option<f64>,
    pub ema5: Option<f64>,
    pub ema10: Option<f64>,
    pub ema20: Option<f64>,
    pub ema60: Option<f64>,
    pub macd_dif: Option<f64>,
    pub macd_dea: Option<f64>,
    pub macd_bar: Option<f64>,
    pub macd_bar_recent: Vec<f64>,
    pub rsi6: Option<f64>,
    pub rsi12: Option<f64>,
    pub rsi14: Option<f64>,
    pub kdj_k: Option<f64>,
    pub kdj_d: Option<f64>,
    pub kdj_j: Option<f64>,
    pub boll_upper: Option<f64>,
    pub boll_middle: Option<f64>,
    pub boll_lower: Option<f64>,
    pub volume_ma5: Option<f64>,
    pub volume_ma10: Option<f64>,
}

fn last(series: Result<Vec<f64>, IndicatorError>) -> Option<f64> {
    series.ok().and_then(|v| v.last().copied())
}

fn tail(values: &[f64], n: usize) -> Vec<f64> {
    values[values.len().saturating_sub(n)..].to_vec()
}

pub fn summarize_kline(bars: &[Bar]) -> KlineIndicators {
    if bars.is_empty() {
        return KlineIndicators::default();
    }

    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    let mut summary = KlineIndicators {
        ma5: last(sma(&closes, 5)),
        ma10: last(sma(&closes, 10)),
        ma20: last(sma(&closes, 20)),
        ma60: last(sma(&closes, 60)),
        ema5: (closes.len() >= 5).then(|| last(ema(&closes, 5))).flatten(),
        ema10: (closes.len() >= 10).then(|| last(ema(&closes, 10))).flatten(),
        ema20: (closes.len() >= 20).then(|| last(ema(&closes, 20))).flatten(),
        ema60: (closes.len() >= 60).then(|| last(ema(&closes, 60))).flatten(),
        rsi6: last(rsi(&closes, 6)),
        rsi12: last(rsi(&closes, 12)),
        rsi14: last(rsi(&closes, 14)),
        volume_ma5: last(sma(&volumes, 5)),
        volume_ma10: last(sma(&volumes, 10)),
        ..Default::default()
    };

    // MACD needs enough history for the slow EMA to settle
    if closes.len() >= 26 {
        if let Ok(m) = macd(&closes, 12, 26, 9) {
            summary.macd_dif = m.dif.last().copied();
            summary.macd_dea = m.dea.last().copied();
            summary.macd_bar = m.bar.last().copied();
            summary.macd_bar_recent = tail(&m.bar, 10);
        }
    }

    if let Ok(k) = kdj(&highs, &lows, &closes, 9, 3, 3) {
        summary.kdj_k = k.k.last().copied();
        summary.kdj_d = k.d.last().copied();
        summary.kdj_j = k.j.last().copied();
    }

    if let Ok(b) = bollinger(&closes, 20, 2.0) {
        summary.boll_upper = b.upper.last().copied();
        summary.boll_middle = b.middle.last().copied();
        summary.boll_lower = b.lower.last().copied();
    }

    summary
}

/// Fixed intraday volume sessions, half-open `[start, end)`.
pub const VOLUME_SESSIONS: [(&str, (u32, u32), (u32, u32)); 4] = [
    ("09:20-10:30", (9, 20), (10, 30)),
    ("10:30-11:30", (10, 30), (11, 30)),
    ("13:00-14:00", (13, 0), (14, 0)),
    ("14:00-15:00", (14, 0), (15, 0)),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionVolume {
    pub label: String,
    pub volume: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub neutral_volume: f64,
    pub share_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntradayIndicators {
    pub tick_count: usize,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub total_volume: f64,
    pub avg_volume: f64,
    pub vwap: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub neutral_volume: f64,
    pub ema5: Option<f64>,
    pub ema10: Option<f64>,
    pub ema20: Option<f64>,
    pub macd_dif: Option<f64>,
    pub macd_dea: Option<f64>,
    pub macd_bar: Option<f64>,
    pub recent_prices: Vec<f64>,
    pub recent_volumes: Vec<f64>,
    pub sessions: Vec<SessionVolume>,
}

fn session_of(time: NaiveTime) -> Option<usize> {
    let minutes = time.hour() * 60 + time.minute();
    VOLUME_SESSIONS.iter().position(|(_, (sh, sm), (eh, em))| {
        minutes >= sh * 60 + sm && minutes < eh * 60 + em
    })
}

/// Summary of one trading day's ticks. `None` for an empty day.
pub fn summarize_intraday(ticks: &[TickRecord]) -> Option<IntradayIndicators> {
    let first = ticks.first()?;
    let last_tick = ticks.last()?;

    let prices: Vec<f64> = ticks.iter().map(|t| t.price).collect();
    let volumes: Vec<f64> = ticks.iter().map(|t| t.volume).collect();
    let total_volume: f64 = volumes.iter().sum();
    let turnover: f64 = ticks.iter().map(|t| t.price * t.volume).sum();

    let mut summary = IntradayIndicators {
        tick_count: ticks.len(),
        open: first.price,
        close: last_tick.price,
        high: prices.iter().cloned().fold(f64::MIN, f64::max),
        low: prices.iter().cloned().fold(f64::MAX, f64::min),
        total_volume,
        avg_volume: total_volume / ticks.len() as f64,
        vwap: if total_volume > 0.0 {
            turnover / total_volume
        } else {
            last_tick.price
        },
        ema5: last(ema(&prices, 5)),
        ema10: last(ema(&prices, 10)),
        ema20: last(ema(&prices, 20)),
        recent_prices: tail(&prices, 10),
        recent_volumes: tail(&volumes, 10),
        sessions: VOLUME_SESSIONS
            .iter()
            .map(|(label, _, _)| SessionVolume {
                label: label.to_string(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    if prices.len() >= 26 {
        if let Ok(m) = macd(&prices, 12, 26, 9) {
            summary.macd_dif = m.dif.last().copied();
            summary.macd_dea = m.dea.last().copied();
            summary.macd_bar = m.bar.last().copied();
        }
    }

    for tick in ticks {
        match tick.kind {
            TickKind::Buy => summary.buy_volume += tick.volume,
            TickKind::Sell => summary.sell_volume += tick.volume,
            TickKind::Neutral => summary.neutral_volume += tick.volume,
        }
        if let Some(idx) = session_of(tick.timestamp.time()) {
            let session = &mut summary.sessions[idx];
            session.volume += tick.volume;
            match tick.kind {
                TickKind::Buy => session.buy_volume += tick.volume,
                TickKind::Sell => session.sell_volume += tick.volume,
                TickKind::Neutral => session.neutral_volume += tick.volume,
            }
        }
    }

    if total_volume > 0.0 {
        for session in &mut summary.sessions {
            session.share_pct = session.volume / total_volume * 100.0;
        }
    }

    Some(summary)
}
