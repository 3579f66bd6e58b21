use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, SelectionMode};
use crate::error::{AnalysisError, ErrorKind, FetchError};
use crate::models::*;
use crate::orchestrator::ProviderOrchestrator;
use crate::prompt_builder::PromptBuilder;
use crate::resilient_fetcher::ResilientFetcher;
use crate::result_store::{ResultSink, RunContext};
use crate::sequencer::{segment_by_trading_day, SequenceInputs, StepSequencer};

/// A trading day whose ticks could not be fetched.
#[derive(Debug, Clone)]
pub struct DayGap {
    pub date: NaiveDate,
    pub error: String,
}

#[derive(Debug)]
pub struct SymbolReport {
    pub symbol: Symbol,
    pub name: String,
    pub trading_days: usize,
    pub segments: usize,
    pub gaps: Vec<DayGap>,
    pub results: BTreeMap<String, ProviderRunResult>,
    pub saved: Vec<PathBuf>,
    pub save_errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub reports: Vec<SymbolReport>,
    pub errors: Vec<(Symbol, String)>,
}

impl BatchSummary {
    fn record(&mut self, symbol: Symbol, outcome: Result<SymbolReport, AnalysisError>) {
        match outcome {
            Ok(report) => {
                self.completed += 1;
                self.reports.push(report);
            }
            Err(e) => {
                log::error!("{}: analysis failed: {}", symbol, e);
                self.failed += 1;
                self.errors.push((symbol, e.to_string()));
            }
        }
    }
}

/// Collects market data for a symbol, builds the step inputs and hands
/// them to the orchestrator, then persists every provider's result.
pub struct ReflectiveAnalyzer {
    fetcher: Arc<ResilientFetcher>,
    orchestrator: ProviderOrchestrator,
    sink: Arc<dyn ResultSink>,
    config: Arc<AppConfig>,
}

impl ReflectiveAnalyzer {
    pub fn new(
        fetcher: Arc<ResilientFetcher>,
        orchestrator: ProviderOrchestrator,
        sink: Arc<dyn ResultSink>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            fetcher,
            orchestrator,
            sink,
            config,
        }
    }

    async fn universe(&self, as_of: NaiveDate) -> Result<Vec<Listing>, AnalysisError> {
        let request = FetchRequest::universe(as_of);
        self.fetcher
            .fetch(&request)
            .await?
            .into_listings()
            .ok_or_else(|| AnalysisError::UnexpectedPayload(request.to_string()))
    }

    /// Symbols to analyze, with display names where the universe knows them.
    pub async fn resolve_targets(&self, as_of: NaiveDate) -> Result<Vec<Listing>, AnalysisError> {
        let selection = &self.config.selection;
        match selection.mode {
            SelectionMode::Random => {
                let universe = self.universe(as_of).await?;
                let picked: Vec<Listing> = universe
                    .choose_multiple(&mut rand::thread_rng(), selection.random_count)
                    .cloned()
                    .collect();
                log::info!(
                    "randomly selected {} of {} listed symbols",
                    picked.len(),
                    universe.len()
                );
                Ok(picked)
            }
            SelectionMode::Specified => {
                let symbols = selection.specified_symbols()?;

                let names: HashMap<Symbol, String> = match self.universe(as_of).await {
                    Ok(listings) => listings.into_iter().map(|l| (l.symbol, l.name)).collect(),
                    Err(e) => {
                        log::warn!("could not resolve stock names: {}", e);
                        HashMap::new()
                    }
                };

                Ok(symbols
                    .into_iter()
                    .map(|symbol| {
                        let name = names
                            .get(&symbol)
                            .cloned()
                            .unwrap_or_else(|| symbol.code().to_string());
                        Listing { symbol, name }
                    })
                    .collect())
            }
        }
    }

    async fn trading_calendar(&self, range: DateRange) -> Result<Vec<NaiveDate>, AnalysisError> {
        let request = FetchRequest::trade_calendar(range);
        self.fetcher
            .fetch(&request)
            .await?
            .into_dates()
            .ok_or_else(|| AnalysisError::UnexpectedPayload(request.to_string()))
    }

    async fn collect_ticks(
        &self,
        symbol: &Symbol,
        days: &[NaiveDate],
    ) -> Result<(Vec<TickRecord>, Vec<DayGap>), AnalysisError> {
        let mut ticks = Vec::new();
        let mut gaps = Vec::new();

        for &date in days {
            let request = FetchRequest::intraday(symbol.clone(), date);
            match self.fetcher.fetch(&request).await {
                Ok(data) => {
                    let day = data
                        .into_ticks()
                        .ok_or_else(|| AnalysisError::UnexpectedPayload(request.to_string()))?;
                    if day.is_empty() {
                        log::info!("{}: no ticks on {}", symbol, date);
                    }
                    ticks.extend(day);
                }
                // A bad symbol fails every day; anything else only loses this one
                Err(e @ FetchError::Fatal {
                    kind: ErrorKind::InvalidSymbol,
                    ..
                }) => return Err(e.into()),
                Err(e @ (FetchError::DataUnavailable { .. } | FetchError::Fatal { .. })) => {
                    log::warn!("{}: skipping {} ({})", symbol, date, e);
                    gaps.push(DayGap {
                        date,
                        error: e.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok((ticks, gaps))
    }

    async fn daily_context(
        &self,
        symbol: &Symbol,
        range: DateRange,
    ) -> Result<DailyContext, AnalysisError> {
        let request = FetchRequest::daily_kline(symbol.clone(), range);
        let bars = self
            .fetcher
            .fetch(&request)
            .await?
            .into_bars()
            .ok_or_else(|| AnalysisError::UnexpectedPayload(request.to_string()))?;

        let mut indices = Vec::new();
        for index in symbol.board().benchmarks() {
            let request = FetchRequest::index_daily(index.code, range);
            match self.fetcher.fetch(&request).await.map(SeriesData::into_bars) {
                Ok(Some(bars)) => indices.push(IndexSeries {
                    code: index.code.to_string(),
                    name: index.name.to_string(),
                    bars,
                }),
                Ok(None) => log::warn!("{}: unexpected payload", request),
                Err(e) => log::warn!("{}: index {} unavailable: {}", symbol, index.name, e),
            }
        }

        let sector = match self.industry_sector(symbol, range).await {
            Ok(sector) => sector,
            Err(e) => {
                log::warn!("{}: industry board unavailable: {}", symbol, e);
                None
            }
        };

        Ok(DailyContext {
            bars,
            indices,
            sector,
        })
    }

    /// Daily bars of the industry board the stock belongs to, if the
    /// profile names one.
    async fn industry_sector(
        &self,
        symbol: &Symbol,
        range: DateRange,
    ) -> Result<Option<IndexSeries>, AnalysisError> {
        let profile = self
            .fetcher
            .fetch(&FetchRequest::industry_info(symbol.clone(), range.end))
            .await?;
        let Some(industry) = profile.profile_value("行业") else {
            log::info!("{}: no industry in profile", symbol);
            return Ok(None);
        };

        let request = FetchRequest::industry_daily(industry, range);
        let bars = self
            .fetcher
            .fetch(&request)
            .await?
            .into_bars()
            .ok_or_else(|| AnalysisError::UnexpectedPayload(request.to_string()))?;
        Ok(Some(IndexSeries {
            code: industry.to_string(),
            name: industry.to_string(),
            bars,
        }))
    }

    pub async fn analyze_symbol(
        &self,
        symbol: &Symbol,
        name: &str,
        range: DateRange,
    ) -> Result<SymbolReport, AnalysisError> {
        let kline_days = self.config.data.kline_days;
        log::info!("{} {}: analyzing {}..{}", symbol, name, range.start, range.end);

        // Calendar days, not trading days; enough to cover kline_days sessions
        let lookback = ChronoDuration::days(kline_days as i64 * 2 + 10);
        let calendar = self
            .trading_calendar(DateRange::new(range.start - lookback, range.end)?)
            .await?;

        let days: Vec<NaiveDate> = calendar.iter().copied().filter(|d| range.contains(*d)).collect();
        let earlier: Vec<NaiveDate> = calendar.iter().copied().filter(|d| *d < range.start).collect();
        let kline_start = earlier
            .get(earlier.len().saturating_sub(kline_days))
            .copied()
            .unwrap_or(range.start);
        log::info!("{}: {} trading days in range", symbol, days.len());

        let (ticks, gaps) = self.collect_ticks(symbol, &days).await?;
        let daily = self
            .daily_context(symbol, DateRange::new(kline_start, range.end)?)
            .await?;
        let segments = segment_by_trading_day(ticks);

        let inputs = SequenceInputs {
            segments: Arc::new(segments),
            daily: Arc::new(daily),
            prompts: Arc::new(PromptBuilder::new(symbol.clone(), name)),
        };
        let segment_count = inputs.segments.len();

        let results = self
            .orchestrator
            .run_all(&self.config.providers, || StepSequencer::new(inputs.clone()))
            .await;

        let run = RunContext {
            symbol: symbol.clone(),
            name: name.to_string(),
            start_date: range.start,
            end_date: range.end,
        };
        let mut saved = Vec::new();
        let mut save_errors = Vec::new();
        for result in results.values() {
            match self.sink.write(&run, result).await {
                Ok(path) => saved.push(path),
                Err(e) => {
                    log::error!("{}: could not save {} result: {}", symbol, result.provider_id, e);
                    save_errors.push(e.to_string());
                }
            }
        }

        Ok(SymbolReport {
            symbol: symbol.clone(),
            name: name.to_string(),
            trading_days: days.len(),
            segments: segment_count,
            gaps,
            results,
            saved,
            save_errors,
        })
    }

    /// Analyzes every target. One symbol's failure never stops the others.
    pub async fn analyze_batch(&self, targets: Vec<Listing>, range: DateRange) -> BatchSummary {
        let total = targets.len();
        let concurrency = self.config.analysis.max_concurrent_symbols.max(1);
        let delay = Duration::from_secs(self.config.analysis.inter_symbol_delay_secs);
        let mut summary = BatchSummary::default();

        if concurrency == 1 {
            for (index, listing) in targets.iter().enumerate() {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                log::info!("processing {} ({}/{})", listing.symbol, index + 1, total);
                let outcome = self.analyze_symbol(&listing.symbol, &listing.name, range).await;
                summary.record(listing.symbol.clone(), outcome);
            }
        } else {
            let outcomes: Vec<_> = stream::iter(targets.iter())
                .map(|listing| async move {
                    let outcome = self.analyze_symbol(&listing.symbol, &listing.name, range).await;
                    (listing.symbol.clone(), outcome)
                })
                .buffered(concurrency)
                .collect()
                .await;
            for (symbol, outcome) in outcomes {
                summary.record(symbol, outcome);
            }
        }

        log::info!(
            "batch finished: {} completed, {} failed of {}",
            summary.completed,
            summary.failed,
            total
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_service::{BackendFactory, ModelBackend};
    use crate::data_fetcher::MarketDataSource;
    use crate::error::{RunError, UpstreamError};
    use crate::orchestrator::Schedule;
    use crate::resilient_fetcher::{Classifier, RetryPolicy};
    use crate::result_store::JsonFileStore;
    use crate::sequencer::tests::ScriptedBackend;

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, m, d).unwrap()
    }

    struct MockMarket {
        calendar: Vec<NaiveDate>,
        failing_day: Option<NaiveDate>,
        broken_day: Option<NaiveDate>,
        rejected: Option<&'static str>,
        industry: Option<&'static str>,
    }

    impl MockMarket {
        fn new() -> Self {
            let mut calendar = Vec::new();
            let mut d = date(1, 2);
            while d <= date(3, 7) {
                if !matches!(d.format("%a").to_string().as_str(), "Sat" | "Sun") {
                    calendar.push(d);
                }
                d += ChronoDuration::days(1);
            }
            Self {
                calendar,
                failing_day: None,
                broken_day: None,
                rejected: None,
                industry: Some("证券"),
            }
        }

        fn bars(&self, range: DateRange, base: f64) -> Vec<Bar> {
            self.calendar
                .iter()
                .filter(|d| range.contains(**d))
                .enumerate()
                .map(|(i, d)| Bar {
                    date: *d,
                    open: base,
                    close: base + i as f64 * 0.1,
                    high: base + 1.0,
                    low: base - 1.0,
                    volume: 10_000.0,
                    change_pct: 0.0,
                })
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl MarketDataSource for MockMarket {
        async fn fetch(&self, request: &FetchRequest) -> Result<SeriesData, UpstreamError> {
            let range = request.range();
            match request.kind() {
                DataKind::TradeCalendar => Ok(SeriesData::Dates(
                    self.calendar.iter().copied().filter(|d| range.contains(*d)).collect(),
                )),
                DataKind::IntradayTicks => {
                    let symbol = request.symbol().map(Symbol::code);
                    if symbol.is_some() && symbol == self.rejected {
                        return Err(UpstreamError::with_kind(
                            ErrorKind::InvalidSymbol,
                            "no such symbol",
                        ));
                    }
                    if Some(range.start) == self.failing_day {
                        return Err(UpstreamError::new("Connection reset by peer"));
                    }
                    if Some(range.start) == self.broken_day {
                        return Err(UpstreamError::new(
                            "HTTP 500 Internal Server Error: KeyError: 'ticktime'",
                        ));
                    }
                    let tick = |h, m, price| TickRecord {
                        timestamp: range.start.and_hms_opt(h, m, 0).unwrap(),
                        price,
                        volume: 500.0,
                        kind: TickKind::Buy,
                    };
                    Ok(SeriesData::Ticks(vec![tick(9, 30, 10.0), tick(14, 0, 10.3)]))
                }
                DataKind::DailyKline => Ok(SeriesData::Bars(self.bars(range, 10.0))),
                DataKind::IndexDaily { .. } => Ok(SeriesData::Bars(self.bars(range, 3300.0))),
                DataKind::IndustryInfo => match self.industry {
                    Some(industry) => Ok(SeriesData::Profile(vec![
                        ("股票代码".to_string(), "600030".to_string()),
                        ("行业".to_string(), industry.to_string()),
                    ])),
                    None => Err(UpstreamError::new("HTTP 500: KeyError: 'item'")),
                },
                DataKind::IndustryDaily { .. } => Ok(SeriesData::Bars(self.bars(range, 900.0))),
                DataKind::Universe => Ok(SeriesData::Listings(vec![
                    Listing {
                        symbol: Symbol::parse("600030").unwrap(),
                        name: "中信证券".to_string(),
                    },
                    Listing {
                        symbol: Symbol::parse("300680").unwrap(),
                        name: "隆盛科技".to_string(),
                    },
                    Listing {
                        symbol: Symbol::parse("000001").unwrap(),
                        name: "平安银行".to_string(),
                    },
                ])),
            }
        }
    }

    struct AlwaysScripted;

    impl BackendFactory for AlwaysScripted {
        fn backend_for(&self, _provider: &ProviderConfig) -> Result<Arc<dyn ModelBackend>, RunError> {
            Ok(Arc::new(ScriptedBackend::new(None)))
        }
    }

    fn analyzer(market: MockMarket, config: AppConfig, out: &std::path::Path) -> ReflectiveAnalyzer {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        };
        let fetcher = ResilientFetcher::new(Arc::new(market), policy, Classifier::default()).unwrap();
        let orchestrator = ProviderOrchestrator::new(
            Arc::new(AlwaysScripted),
            Schedule::Sequential,
            Duration::from_secs(2),
        );
        ReflectiveAnalyzer::new(
            Arc::new(fetcher),
            orchestrator,
            Arc::new(JsonFileStore::new(out, false)),
            Arc::new(config),
        )
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.data.kline_days = 20;
        config.providers = vec![ProviderConfig::new("qwen", "qwen-plus").with_credential("sk-test")];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_analyze_symbol_records_gaps_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = MockMarket::new();
        market.failing_day = Some(date(3, 4));
        let analyzer = analyzer(market, config(), dir.path());

        let range = DateRange::new(date(3, 3), date(3, 5)).unwrap();
        let symbol = Symbol::parse("600030").unwrap();
        let report = analyzer.analyze_symbol(&symbol, "中信证券", range).await.unwrap();

        assert_eq!(report.trading_days, 3);
        assert_eq!(report.segments, 2);
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].date, date(3, 4));

        let qwen = &report.results["qwen"];
        assert_eq!(qwen.status, RunStatus::Complete);
        assert_eq!(qwen.steps.len(), 3);
        assert_eq!(report.saved.len(), 1);
        assert!(report.saved[0].exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_prompts_do_not_see_later_bars() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = analyzer(MockMarket::new(), config(), dir.path());

        let range = DateRange::new(date(3, 3), date(3, 7)).unwrap();
        let symbol = Symbol::parse("600030").unwrap();
        let report = analyzer.analyze_symbol(&symbol, "中信证券", range).await.unwrap();

        let first = &report.results["qwen"].steps[0];
        assert!(first.prompt.contains("2025-03-03 |"));
        assert!(!first.prompt.contains("2025-03-04 |"));
        assert!(first.prompt.contains("上证指数"));
        assert!(first.prompt.contains("【行业板块】证券"));
        assert!(!first.prompt.contains("2025-03-04 收盘"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_day_failure_becomes_gap() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = MockMarket::new();
        market.broken_day = Some(date(3, 4));
        let analyzer = analyzer(market, config(), dir.path());

        let range = DateRange::new(date(3, 3), date(3, 7)).unwrap();
        let symbol = Symbol::parse("600030").unwrap();
        let report = analyzer.analyze_symbol(&symbol, "中信证券", range).await.unwrap();

        assert_eq!(report.trading_days, 5);
        assert_eq!(report.segments, 4);
        assert_eq!(report.gaps.len(), 1);
        assert_eq!(report.gaps[0].date, date(3, 4));
        assert!(report.gaps[0].error.contains("KeyError"));
        assert_eq!(report.results["qwen"].status, RunStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_industry_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = MockMarket::new();
        market.industry = None;
        let analyzer = analyzer(market, config(), dir.path());

        let range = DateRange::new(date(3, 3), date(3, 4)).unwrap();
        let symbol = Symbol::parse("600030").unwrap();
        let report = analyzer.analyze_symbol(&symbol, "中信证券", range).await.unwrap();

        let first = &report.results["qwen"].steps[0];
        assert!(!first.prompt.contains("【行业板块】"));
        assert!(first.prompt.contains("上证指数"));
        assert_eq!(report.segments, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_isolates_failed_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let mut market = MockMarket::new();
        market.rejected = Some("300680");
        let analyzer = analyzer(market, config(), dir.path());

        let targets = vec![
            Listing {
                symbol: Symbol::parse("300680").unwrap(),
                name: "隆盛科技".to_string(),
            },
            Listing {
                symbol: Symbol::parse("600030").unwrap(),
                name: "中信证券".to_string(),
            },
        ];
        let range = DateRange::new(date(3, 3), date(3, 4)).unwrap();
        let summary = analyzer.analyze_batch(targets, range).await;

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].0.code(), "300680");
        assert_eq!(summary.reports[0].symbol.code(), "600030");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mut specified = config();
        specified.selection.symbols = vec!["300680".to_string(), "688981".to_string()];
        let analyzer_specified = analyzer(MockMarket::new(), specified, dir.path());
        let targets = analyzer_specified.resolve_targets(date(3, 7)).await.unwrap();
        assert_eq!(targets[0].name, "隆盛科技");
        assert_eq!(targets[1].name, "688981");

        let mut random = config();
        random.selection.mode = SelectionMode::Random;
        random.selection.random_count = 2;
        let analyzer_random = analyzer(MockMarket::new(), random, dir.path());
        let picked = analyzer_random.resolve_targets(date(3, 7)).await.unwrap();
        assert_eq!(picked.len(), 2);
        assert_ne!(picked[0].symbol, picked[1].symbol);
    }
}
