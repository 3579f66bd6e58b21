use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{FetchError, RunError};

/// A-share board, derived from the ticker prefix.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Board {
    ShanghaiMain, // 沪市主板
    Star,         // 科创板
    ShenzhenMain, // 深市主板
    ChiNext,      // 创业板
    Beijing,      // 北交所
}

/// Reference index quoted next to a stock in every prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkIndex {
    pub code: &'static str,
    pub name: &'static str,
}

const SSE_COMPOSITE: BenchmarkIndex = BenchmarkIndex {
    code: "000001",
    name: "上证指数",
};
const STAR_50: BenchmarkIndex = BenchmarkIndex {
    code: "000688",
    name: "科创50",
};
const SZSE_COMPONENT: BenchmarkIndex = BenchmarkIndex {
    code: "399001",
    name: "深证成指",
};
const CHINEXT_INDEX: BenchmarkIndex = BenchmarkIndex {
    code: "399006",
    name: "创业板指",
};
const BSE_50: BenchmarkIndex = BenchmarkIndex {
    code: "899050",
    name: "北证50",
};

impl Board {
    pub fn from_code(code: &str) -> Option<Self> {
        if code.starts_with("688") {
            Some(Board::Star)
        } else if code.starts_with("60") {
            Some(Board::ShanghaiMain)
        } else if code.starts_with("30") {
            Some(Board::ChiNext)
        } else if code.starts_with("00") {
            Some(Board::ShenzhenMain)
        } else if ["83", "43", "87", "920"].iter().any(|p| code.starts_with(p)) {
            Some(Board::Beijing)
        } else {
            None
        }
    }

    pub fn exchange_prefix(self) -> &'static str {
        match self {
            Board::ShanghaiMain | Board::Star => "sh",
            Board::ShenzhenMain | Board::ChiNext => "sz",
            Board::Beijing => "bj",
        }
    }

    /// Daily price-limit ratio relative to the previous close.
    pub fn limit_ratio(self) -> f64 {
        match self {
            Board::ShanghaiMain | Board::ShenzhenMain => 0.10,
            Board::Star | Board::ChiNext => 0.20,
            Board::Beijing => 0.30,
        }
    }

    pub fn benchmarks(self) -> &'static [BenchmarkIndex] {
        match self {
            Board::ShanghaiMain => &[SSE_COMPOSITE],
            Board::Star => &[SSE_COMPOSITE, STAR_50],
            Board::ShenzhenMain => &[SZSE_COMPONENT],
            Board::ChiNext => &[SZSE_COMPONENT, CHINEXT_INDEX],
            Board::Beijing => &[BSE_50],
        }
    }
}

impl std::fmt::Display for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Board::ShanghaiMain => write!(f, "沪市主板"),
            Board::Star => write!(f, "科创板"),
            Board::ShenzhenMain => write!(f, "深市主板"),
            Board::ChiNext => write!(f, "创业板"),
            Board::Beijing => write!(f, "北交所"),
        }
    }
}

/// Six-digit A-share ticker with a known board.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(code: &str) -> Result<Self, FetchError> {
        let code = code.trim();
        let well_formed = code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit());
        if !well_formed || Board::from_code(code).is_none() {
            return Err(FetchError::InvalidSymbol(code.to_string()));
        }
        Ok(Self(code.to_string()))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    pub fn board(&self) -> Board {
        // parse() guarantees a board; Shanghai main is unreachable here
        Board::from_code(&self.0).unwrap_or(Board::ShanghaiMain)
    }

    /// Ticker with exchange prefix, e.g. `sh600000`, as used by tick endpoints.
    pub fn prefixed(&self) -> String {
        format!("{}{}", self.board().exchange_prefix(), self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = FetchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Symbol::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sina tick direction: `U` buy, `D` sell, `E` neutral.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TickKind {
    Buy,
    Sell,
    Neutral,
}

impl TickKind {
    pub fn from_code(code: &str) -> Self {
        match code {
            "U" => TickKind::Buy,
            "D" => TickKind::Sell,
            _ => TickKind::Neutral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickRecord {
    pub timestamp: NaiveDateTime,
    pub price: f64,
    pub volume: f64,
    pub kind: TickKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub close: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    pub change_pct: f64,
}

/// Entry of the listed-stock universe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub symbol: Symbol,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, FetchError> {
        if start > end {
            return Err(FetchError::InvalidParameter(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Granularity requested from the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataKind {
    IntradayTicks,
    DailyKline,
    IndexDaily { index_code: String },
    TradeCalendar,
    Universe,
    /// Company profile rows; carries the industry the stock belongs to.
    IndustryInfo,
    IndustryDaily { industry: String },
}

/// One logical upstream call. Built per call and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    symbol: Option<Symbol>,
    range: DateRange,
    kind: DataKind,
}

impl FetchRequest {
    pub fn intraday(symbol: Symbol, date: NaiveDate) -> Self {
        Self {
            symbol: Some(symbol),
            range: DateRange::single(date),
            kind: DataKind::IntradayTicks,
        }
    }

    pub fn daily_kline(symbol: Symbol, range: DateRange) -> Self {
        Self {
            symbol: Some(symbol),
            range,
            kind: DataKind::DailyKline,
        }
    }

    pub fn index_daily(index_code: &str, range: DateRange) -> Self {
        Self {
            symbol: None,
            range,
            kind: DataKind::IndexDaily {
                index_code: index_code.to_string(),
            },
        }
    }

    pub fn industry_info(symbol: Symbol, as_of: NaiveDate) -> Self {
        Self {
            symbol: Some(symbol),
            range: DateRange::single(as_of),
            kind: DataKind::IndustryInfo,
        }
    }

    pub fn industry_daily(industry: &str, range: DateRange) -> Self {
        Self {
            symbol: None,
            range,
            kind: DataKind::IndustryDaily {
                industry: industry.to_string(),
            },
        }
    }

    pub fn trade_calendar(range: DateRange) -> Self {
        Self {
            symbol: None,
            range,
            kind: DataKind::TradeCalendar,
        }
    }

    pub fn universe(as_of: NaiveDate) -> Self {
        Self {
            symbol: None,
            range: DateRange::single(as_of),
            kind: DataKind::Universe,
        }
    }

    pub fn symbol(&self) -> Option<&Symbol> {
        self.symbol.as_ref()
    }

    pub fn range(&self) -> DateRange {
        self.range
    }

    pub fn kind(&self) -> &DataKind {
        &self.kind
    }
}

impl std::fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = self.symbol.as_ref().map(Symbol::code).unwrap_or("-");
        match &self.kind {
            DataKind::IntradayTicks => write!(f, "ticks {} {}", symbol, self.range.start),
            DataKind::DailyKline => write!(
                f,
                "kline {} {}..{}",
                symbol, self.range.start, self.range.end
            ),
            DataKind::IndexDaily { index_code } => write!(
                f,
                "index {} {}..{}",
                index_code, self.range.start, self.range.end
            ),
            DataKind::TradeCalendar => {
                write!(f, "calendar {}..{}", self.range.start, self.range.end)
            }
            DataKind::Universe => write!(f, "universe"),
            DataKind::IndustryInfo => write!(f, "profile {}", symbol),
            DataKind::IndustryDaily { industry } => write!(
                f,
                "industry {} {}..{}",
                industry, self.range.start, self.range.end
            ),
        }
    }
}

/// Parsed upstream payload. An empty vector is a valid result.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesData {
    Ticks(Vec<TickRecord>),
    Bars(Vec<Bar>),
    Dates(Vec<NaiveDate>),
    Listings(Vec<Listing>),
    /// `(item, value)` rows of a company profile.
    Profile(Vec<(String, String)>),
}

impl SeriesData {
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Ticks(v) => v.len(),
            SeriesData::Bars(v) => v.len(),
            SeriesData::Dates(v) => v.len(),
            SeriesData::Listings(v) => v.len(),
            SeriesData::Profile(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_ticks(self) -> Option<Vec<TickRecord>> {
        match self {
            SeriesData::Ticks(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_bars(self) -> Option<Vec<Bar>> {
        match self {
            SeriesData::Bars(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_dates(self) -> Option<Vec<NaiveDate>> {
        match self {
            SeriesData::Dates(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_listings(self) -> Option<Vec<Listing>> {
        match self {
            SeriesData::Listings(v) => Some(v),
            _ => None,
        }
    }

    /// Value of the profile row named `item`, if present and non-blank.
    pub fn profile_value(&self, item: &str) -> Option<&str> {
        match self {
            SeriesData::Profile(rows) => rows
                .iter()
                .find(|(k, _)| k == item)
                .map(|(_, v)| v.trim())
                .filter(|v| !v.is_empty()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success,
    Failed {
        kind: crate::error::ErrorKind,
        message: String,
    },
}

/// Trace of a single attempt inside one logical fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchAttempt {
    pub attempt: u32,
    pub elapsed: Duration,
    pub outcome: AttemptOutcome,
    pub backoff: Option<Duration>,
}

/// All ticks of one trading day, in chronological order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradingDaySegment {
    pub date: NaiveDate,
    pub ticks: Vec<TickRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexSeries {
    pub code: String,
    pub name: String,
    pub bars: Vec<Bar>,
}

/// Daily bars of the stock, its benchmark indices and its industry board,
/// sorted by date.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DailyContext {
    pub bars: Vec<Bar>,
    pub indices: Vec<IndexSeries>,
    #[serde(default)]
    pub sector: Option<IndexSeries>,
}

/// Borrowed slice of a [`DailyContext`] that ends at a given date.
#[derive(Debug, Clone, Copy)]
pub struct DailyView<'a> {
    pub bars: &'a [Bar],
    pub indices: &'a [IndexSeries],
    pub sector: Option<&'a IndexSeries>,
    pub as_of: Option<NaiveDate>,
}

impl DailyContext {
    /// Everything dated on or before `date`.
    pub fn as_of(&self, date: NaiveDate) -> DailyView<'_> {
        let end = self.bars.partition_point(|b| b.date <= date);
        DailyView {
            bars: &self.bars[..end],
            indices: &self.indices,
            sector: self.sector.as_ref(),
            as_of: Some(date),
        }
    }

    pub fn full(&self) -> DailyView<'_> {
        DailyView {
            bars: &self.bars,
            indices: &self.indices,
            sector: self.sector.as_ref(),
            as_of: None,
        }
    }
}

impl<'a> DailyView<'a> {
    pub fn index_bars(&self, series: &'a IndexSeries) -> &'a [Bar] {
        match self.as_of {
            Some(date) => {
                let end = series.bars.partition_point(|b| b.date <= date);
                &series.bars[..end]
            }
            None => &series.bars,
        }
    }

    /// Close of the last bar strictly before `date`.
    pub fn previous_close(&self, date: NaiveDate) -> Option<f64> {
        self.bars
            .iter()
            .rev()
            .find(|b| b.date < date)
            .map(|b| b.close)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Reflective { date: NaiveDate },
    FinalForecast { after: Option<NaiveDate> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: usize,
    pub kind: StepKind,
    pub prior_prediction: Option<String>,
    pub prompt: String,
    pub response: String,
    pub prediction: String,
}

/// Append-only history of one provider's step sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepContext {
    entries: Vec<StepRecord>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: StepRecord) {
        self.entries.push(record);
    }

    pub fn entries(&self) -> &[StepRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_prediction(&self) -> Option<&str> {
        self.entries.last().map(|r| r.prediction.as_str())
    }

    pub fn into_entries(self) -> Vec<StepRecord> {
        self.entries
    }
}

/// API key held in memory only. Never serialized, redacted in debug output.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Empty values and the `sk-请填入` template placeholder are not usable.
    pub fn is_usable(&self) -> bool {
        let value = self.0.trim();
        !value.is_empty() && !value.starts_with("sk-请填入")
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing)]
    pub api_key: Option<Credential>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub reasoning_mode: bool,
}

fn default_provider_timeout() -> u64 {
    300
}

impl ProviderConfig {
    pub fn new(id: &str, model: &str) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            base_url: None,
            timeout_secs: default_provider_timeout(),
            api_key: None,
            api_key_env: None,
            reasoning_mode: false,
        }
    }

    pub fn with_credential(mut self, key: &str) -> Self {
        self.api_key = Some(Credential::new(key));
        self
    }

    pub fn has_usable_credential(&self) -> bool {
        self.api_key.as_ref().is_some_and(Credential::is_usable)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Partial,
    Failed,
    MissingCredential,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::MissingCredential => write!(f, "missing-credential"),
        }
    }
}

/// Trading action and rating pulled from the final forecast.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForecastSummary {
    pub action: Option<String>,
    pub rating: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRunResult {
    pub run_id: Uuid,
    pub provider_id: String,
    pub model: String,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub error: Option<RunError>,
    pub summary: ForecastSummary,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl ProviderRunResult {
    pub fn skipped(provider: &ProviderConfig, error: RunError, status: RunStatus) -> Self {
        let now = Local::now();
        Self {
            run_id: Uuid::new_v4(),
            provider_id: provider.id.clone(),
            model: provider.model.clone(),
            status,
            steps: Vec::new(),
            error: Some(error),
            summary: ForecastSummary::default(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Index of the step that failed, if any.
    pub fn failed_step(&self) -> Option<usize> {
        match &self.error {
            Some(RunError::StepModel(e)) => Some(e.step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn bar(d: NaiveDate, close: f64) -> Bar {
        Bar {
            date: d,
            open: close,
            close,
            high: close,
            low: close,
            volume: 100.0,
            change_pct: 0.0,
        }
    }

    #[test]
    fn test_board_classification() {
        assert_eq!(Board::from_code("688981"), Some(Board::Star));
        assert_eq!(Board::from_code("600519"), Some(Board::ShanghaiMain));
        assert_eq!(Board::from_code("300750"), Some(Board::ChiNext));
        assert_eq!(Board::from_code("000001"), Some(Board::ShenzhenMain));
        assert_eq!(Board::from_code("830799"), Some(Board::Beijing));
        assert_eq!(Board::from_code("920001"), Some(Board::Beijing));
        assert_eq!(Board::from_code("123456"), None);

        assert_eq!(Board::Star.limit_ratio(), 0.20);
        assert_eq!(Board::Beijing.limit_ratio(), 0.30);
        assert_eq!(Board::ChiNext.benchmarks().len(), 2);
        assert_eq!(Board::ShanghaiMain.benchmarks()[0].code, "000001");
    }

    #[test]
    fn test_symbol_parse() {
        let symbol = Symbol::parse("600000").unwrap();
        assert_eq!(symbol.prefixed(), "sh600000");
        assert_eq!(Symbol::parse("300680").unwrap().prefixed(), "sz300680");
        assert_eq!(Symbol::parse("430047").unwrap().prefixed(), "bj430047");

        assert!(matches!(
            Symbol::parse("60000"),
            Err(FetchError::InvalidSymbol(_))
        ));
        assert!(Symbol::parse("60000a").is_err());
        assert!(Symbol::parse("999999").is_err());
    }

    #[test]
    fn test_symbol_serde_validates() {
        let symbol: Symbol = serde_json::from_str("\"000001\"").unwrap();
        assert_eq!(symbol.code(), "000001");
        assert!(serde_json::from_str::<Symbol>("\"abc\"").is_err());
    }

    #[test]
    fn test_date_range_rejects_inverted() {
        assert!(DateRange::new(date(2025, 3, 2), date(2025, 3, 1)).is_err());
        let range = DateRange::new(date(2025, 3, 1), date(2025, 3, 5)).unwrap();
        assert!(range.contains(date(2025, 3, 5)));
        assert!(!range.contains(date(2025, 3, 6)));
    }

    #[test]
    fn test_daily_context_as_of_hides_future_bars() {
        let ctx = DailyContext {
            bars: vec![
                bar(date(2025, 3, 3), 10.0),
                bar(date(2025, 3, 4), 11.0),
                bar(date(2025, 3, 5), 12.0),
            ],
            indices: vec![IndexSeries {
                code: "000001".to_string(),
                name: "上证指数".to_string(),
                bars: vec![bar(date(2025, 3, 4), 3300.0), bar(date(2025, 3, 5), 3310.0)],
            }],
            sector: Some(IndexSeries {
                code: "BK0473".to_string(),
                name: "证券".to_string(),
                bars: vec![bar(date(2025, 3, 3), 900.0), bar(date(2025, 3, 5), 910.0)],
            }),
        };

        let view = ctx.as_of(date(2025, 3, 4));
        assert_eq!(view.bars.len(), 2);
        assert_eq!(view.bars.last().unwrap().close, 11.0);
        assert_eq!(view.index_bars(&ctx.indices[0]).len(), 1);
        let sector = view.sector.unwrap();
        assert_eq!(view.index_bars(sector).len(), 1);
        assert_eq!(view.index_bars(sector)[0].close, 900.0);
        assert_eq!(view.previous_close(date(2025, 3, 4)), Some(10.0));
        assert_eq!(ctx.full().bars.len(), 3);
    }

    #[test]
    fn test_profile_value_lookup() {
        let profile = SeriesData::Profile(vec![
            ("股票代码".to_string(), "600030".to_string()),
            ("行业".to_string(), " 证券 ".to_string()),
            ("上市时间".to_string(), String::new()),
        ]);
        assert_eq!(profile.len(), 3);
        assert_eq!(profile.profile_value("行业"), Some("证券"));
        assert_eq!(profile.profile_value("上市时间"), None);
        assert_eq!(SeriesData::Bars(Vec::new()).profile_value("行业"), None);
    }

    #[test]
    fn test_credential_placeholder_and_redaction() {
        assert!(!Credential::new("sk-请填入您的密钥").is_usable());
        assert!(!Credential::new("  ").is_usable());
        let key = Credential::new("sk-live-123");
        assert!(key.is_usable());
        assert_eq!(format!("{:?}", key), "Credential(***)");

        let provider = ProviderConfig::new("qwen", "qwen-plus").with_credential("sk-live-123");
        let json = serde_json::to_string(&provider).unwrap();
        assert!(!json.contains("sk-live-123"));
        assert!(provider.has_usable_credential());
    }
}
