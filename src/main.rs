use anyhow::{bail, Context};
use chrono::{Datelike, NaiveDateTime, NaiveTime, Utc, Weekday};
use clap::Parser;
use env_logger::Env;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod ai_service;
mod analyzer;
mod config;
mod data_fetcher;
mod error;
mod indicators;
mod models;
mod orchestrator;
mod prompt_builder;
mod resilient_fetcher;
mod result_store;
mod sequencer;

use crate::ai_service::HttpBackendFactory;
use crate::analyzer::ReflectiveAnalyzer;
use crate::config::{load_config, AppConfig, SelectionMode, DEFAULT_CONFIG_FILE};
use crate::data_fetcher::AkshareProxy;
use crate::orchestrator::ProviderOrchestrator;
use crate::resilient_fetcher::{Classifier, ResilientFetcher};
use crate::result_store::JsonFileStore;

/// Day-by-day reflective intraday analysis of A-share stocks with LLM providers.
#[derive(Parser, Debug)]
#[command(name = "stock-reflector", version)]
struct Cli {
    /// Six-digit stock codes; overrides the configured selection
    symbols: Vec<String>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First trading day, YYYYMMDD
    #[arg(long)]
    start: Option<String>,

    /// Last trading day, YYYYMMDD
    #[arg(long)]
    end: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Only run these provider ids (repeatable)
    #[arg(long = "provider")]
    providers: Vec<String>,

    /// Pick this many random listed stocks instead of named ones
    #[arg(long, conflicts_with = "symbols")]
    random: Option<usize>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) -> anyhow::Result<()> {
        if !self.symbols.is_empty() {
            config.selection.mode = SelectionMode::Specified;
            config.selection.symbols = self.symbols.clone();
        }
        if let Some(count) = self.random {
            config.selection.mode = SelectionMode::Random;
            config.selection.random_count = count;
        }
        if self.start.is_some() {
            config.selection.start_date = self.start.clone();
        }
        if self.end.is_some() {
            config.selection.end_date = self.end.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output.output_dir = dir.clone();
        }
        if !self.providers.is_empty() {
            config.providers.retain(|p| self.providers.contains(&p.id));
            if config.providers.is_empty() {
                bail!("none of the requested providers {:?} are configured", self.providers);
            }
        }
        config.validate()?;
        Ok(())
    }
}

/// Continuous auction sessions, Beijing time.
fn is_trading_hours(now: NaiveDateTime) -> bool {
    if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let t = now.time();
    let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or_default();
    (t >= at(9, 30) && t <= at(11, 30)) || (t >= at(13, 0) && t <= at(15, 0))
}

fn beijing_now() -> NaiveDateTime {
    Utc::now().naive_utc() + chrono::Duration::hours(8)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let (config_path, required) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut config = load_config(&config_path, required)
        .with_context(|| format!("loading {}", config_path.display()))?;
    cli.apply(&mut config)?;

    if is_trading_hours(beijing_now()) {
        log::warn!("market is open; today's intraday data is still incomplete");
    }

    let range = config.selection.date_range(chrono::Local::now().date_naive())?;
    info!("Upstream data service: {}", config.data.upstream_url);
    info!(
        "Providers: {}",
        config
            .providers
            .iter()
            .map(|p| format!("{}({})", p.id, p.model))
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("Date range: {} ~ {}", range.start, range.end);

    let source = AkshareProxy::new(
        config.data.upstream_url.clone(),
        config.data.api_timeout,
        config.data.requests_per_second,
    );
    let fetcher = ResilientFetcher::new(
        Arc::new(source),
        config.retry_policy(),
        Classifier::new(config.data.transient_signatures.clone()),
    )
    .context("invalid retry policy")?;
    let orchestrator = ProviderOrchestrator::new(
        Arc::new(HttpBackendFactory),
        config.orchestration.schedule,
        Duration::from_secs(config.orchestration.inter_provider_delay_secs),
    );
    let store = JsonFileStore::new(config.output.output_dir.clone(), config.output.save_prompts);

    let config = Arc::new(config);
    let analyzer = ReflectiveAnalyzer::new(
        Arc::new(fetcher),
        orchestrator,
        Arc::new(store),
        config.clone(),
    );

    let targets = analyzer
        .resolve_targets(range.end)
        .await
        .context("resolving symbols")?;
    if targets.is_empty() {
        bail!("no symbols to analyze");
    }
    info!("Analyzing {} symbols", targets.len());

    let summary = analyzer.analyze_batch(targets, range).await;
    for report in &summary.reports {
        for (provider, result) in &report.results {
            info!(
                "{} {} [{}] {} steps={} action={} rating={}",
                report.symbol,
                report.name,
                provider,
                result.status,
                result.steps.len(),
                result.summary.action.as_deref().unwrap_or("-"),
                result.summary.rating.as_deref().unwrap_or("-"),
            );
        }
        if !report.gaps.is_empty() {
            log::warn!("{}: {} trading days had no data", report.symbol, report.gaps.len());
        }
    }
    info!(
        "Done: {} completed, {} failed, results in {}",
        summary.completed,
        summary.failed,
        config.output.output_dir.display()
    );

    if summary.completed == 0 && summary.failed > 0 {
        bail!("every symbol failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_trading_hours() {
        // 2025-03-03 is a Monday
        assert!(is_trading_hours(at(3, 10, 0)));
        assert!(is_trading_hours(at(3, 14, 59)));
        assert!(!is_trading_hours(at(3, 12, 0)));
        assert!(!is_trading_hours(at(3, 9, 0)));
        assert!(!is_trading_hours(at(1, 10, 0)));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::try_parse_from([
            "stock-reflector",
            "600030",
            "300680",
            "--start",
            "20250303",
            "--end",
            "20250307",
            "--provider",
            "deepseek",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        config.selection.mode = SelectionMode::Random;
        cli.apply(&mut config).unwrap();

        assert_eq!(config.selection.mode, SelectionMode::Specified);
        assert_eq!(config.selection.symbols, vec!["600030", "300680"]);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].id, "deepseek");
        let range = config
            .selection
            .date_range(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())
            .unwrap();
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2025, 3, 3).unwrap());
    }

    #[test]
    fn test_cli_rejects_unknown_provider_filter() {
        let cli = Cli::try_parse_from(["stock-reflector", "600030", "--provider", "kimi"]).unwrap();
        let mut config = AppConfig::default();
        assert!(cli.apply(&mut config).is_err());
    }
}
