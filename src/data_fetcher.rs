use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ErrorKind, UpstreamError};
use crate::models::*;

// Sliding one-second window over recent request start times
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    request_times: tokio::sync::Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize) -> Self {
        Self::with_window(max_requests, Duration::from_secs(1))
    }

    pub fn with_window(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            request_times: tokio::sync::Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut times = self.request_times.lock().await;
            let now = Instant::now();

            while let Some(&oldest) = times.front() {
                if now.duration_since(oldest) >= self.window {
                    times.pop_front();
                } else {
                    break;
                }
            }

            if times.len() < self.max_requests {
                times.push_back(now);
                return;
            }

            let wait = match times.front() {
                Some(&oldest) => self.window.saturating_sub(now.duration_since(oldest)),
                None => Duration::ZERO,
            };
            drop(times);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Source of raw market data. Implementations make exactly one upstream
/// call per invocation; retries live in the resilient fetcher.
#[async_trait::async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<SeriesData, UpstreamError>;
}

/// Client for an AKTools HTTP gateway (`/api/public/{function}`).
#[derive(Clone)]
pub struct AkshareProxy {
    client: Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl AkshareProxy {
    pub fn new(base_url: String, timeout_secs: u64, requests_per_second: usize) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::new(requests_per_second)),
        }
    }

    fn endpoint(request: &FetchRequest) -> Result<(&'static str, Vec<(&'static str, String)>), UpstreamError> {
        let range = request.range();
        let start = range.start.format("%Y%m%d").to_string();
        let end = range.end.format("%Y%m%d").to_string();
        let symbol = || {
            request.symbol().cloned().ok_or_else(|| {
                UpstreamError::with_kind(ErrorKind::InvalidSymbol, format!("{request}: missing symbol"))
            })
        };

        let endpoint = match request.kind() {
            DataKind::IntradayTicks => (
                "stock_intraday_sina",
                vec![("symbol", symbol()?.prefixed()), ("date", start)],
            ),
            DataKind::DailyKline => (
                "stock_zh_a_hist",
                vec![
                    ("symbol", symbol()?.code().to_string()),
                    ("period", "daily".to_string()),
                    ("start_date", start),
                    ("end_date", end),
                    ("adjust", String::new()),
                ],
            ),
            DataKind::IndexDaily { index_code } => (
                "index_zh_a_hist",
                vec![
                    ("symbol", index_code.clone()),
                    ("period", "daily".to_string()),
                    ("start_date", start),
                    ("end_date", end),
                ],
            ),
            DataKind::TradeCalendar => ("tool_trade_date_hist_sina", Vec::new()),
            DataKind::Universe => ("stock_zh_a_spot_em", Vec::new()),
            DataKind::IndustryInfo => (
                "stock_individual_info_em",
                vec![("symbol", symbol()?.code().to_string())],
            ),
            DataKind::IndustryDaily { industry } => (
                "stock_board_industry_hist_em",
                vec![
                    ("symbol", industry.clone()),
                    ("start_date", start),
                    ("end_date", end),
                    ("period", "日k".to_string()),
                    ("adjust", String::new()),
                ],
            ),
        };
        Ok(endpoint)
    }

    async fn make_request(
        &self,
        function: &str,
        query: &[(&str, String)],
    ) -> Result<Value, UpstreamError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/api/public/{}", self.base_url, function);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = (status == StatusCode::TOO_MANY_REQUESTS).then_some(ErrorKind::RateLimited);
            return Err(UpstreamError {
                message: format!("HTTP {}: {}", status, body),
                kind,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamError::new(format!("JSON parse failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl MarketDataSource for AkshareProxy {
    async fn fetch(&self, request: &FetchRequest) -> Result<SeriesData, UpstreamError> {
        let (function, query) = Self::endpoint(request)?;
        let payload = self.make_request(function, &query).await?;
        log::debug!("{} -> {} payload received", request, function);
        parse_payload(request, &payload)
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> UpstreamError {
    let kind = if e.is_timeout() {
        Some(ErrorKind::Timeout)
    } else if e.is_connect() {
        Some(ErrorKind::Connection)
    } else {
        None
    };
    UpstreamError {
        message: format!("Request failed: {}", e),
        kind,
    }
}

/// Turns an AKTools JSON array into typed series data.
pub fn parse_payload(request: &FetchRequest, payload: &Value) -> Result<SeriesData, UpstreamError> {
    let rows: &[Value] = match payload {
        Value::Array(rows) => rows.as_slice(),
        Value::Null => &[],
        other => {
            let detail = other
                .get("detail")
                .or_else(|| other.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("not a JSON array");
            return Err(UpstreamError::new(format!(
                "{}: unexpected payload: {}",
                request, detail
            )));
        }
    };

    let data = match request.kind() {
        DataKind::IntradayTicks => SeriesData::Ticks(parse_ticks(request.range().start, rows)),
        DataKind::DailyKline | DataKind::IndexDaily { .. } | DataKind::IndustryDaily { .. } => {
            SeriesData::Bars(parse_bars(rows))
        }
        DataKind::TradeCalendar => {
            let range = request.range();
            let mut dates: Vec<NaiveDate> = rows
                .iter()
                .filter_map(|row| parse_date(&row["trade_date"]))
                .filter(|d| range.contains(*d))
                .collect();
            dates.sort();
            dates.dedup();
            SeriesData::Dates(dates)
        }
        DataKind::Universe => SeriesData::Listings(
            rows.iter()
                .filter_map(|row| {
                    let symbol = Symbol::parse(row["代码"].as_str()?).ok()?;
                    let name = row["名称"].as_str().unwrap_or("").to_string();
                    Some(Listing { symbol, name })
                })
                .collect(),
        ),
        DataKind::IndustryInfo => SeriesData::Profile(
            rows.iter()
                .filter_map(|row| {
                    let item = row["item"].as_str()?.to_string();
                    let value = match &row["value"] {
                        Value::String(s) => s.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    Some((item, value))
                })
                .collect(),
        ),
    };
    Ok(data)
}

fn parse_ticks(date: NaiveDate, rows: &[Value]) -> Vec<TickRecord> {
    let mut ticks: Vec<TickRecord> = rows
        .iter()
        .filter_map(|row| {
            let time = NaiveTime::parse_from_str(row["ticktime"].as_str()?, "%H:%M:%S").ok()?;
            Some(TickRecord {
                timestamp: NaiveDateTime::new(date, time),
                price: as_number(&row["price"])?,
                volume: as_number(&row["volume"]).unwrap_or(0.0),
                kind: TickKind::from_code(row["kind"].as_str().unwrap_or("E")),
            })
        })
        .collect();

    if ticks.len() < rows.len() {
        log::debug!("dropped {} malformed tick rows for {}", rows.len() - ticks.len(), date);
    }
    ticks.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    ticks
}

fn parse_bars(rows: &[Value]) -> Vec<Bar> {
    let mut bars: Vec<Bar> = rows
        .iter()
        .filter_map(|row| {
            Some(Bar {
                date: parse_date(&row["日期"])?,
                open: as_number(&row["开盘"])?,
                close: as_number(&row["收盘"])?,
                high: as_number(&row["最高"])?,
                low: as_number(&row["最低"])?,
                volume: as_number(&row["成交量"]).unwrap_or(0.0),
                change_pct: 0.0,
            })
        })
        .collect();

    // Sort by date ascending
    bars.sort_by(|a, b| a.date.cmp(&b.date));

    for i in 1..bars.len() {
        let prev_close = bars[i - 1].close;
        if prev_close > 0.0 {
            bars[i].change_pct = (bars[i].close - prev_close) / prev_close * 100.0;
        }
    }
    bars
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?;
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}
