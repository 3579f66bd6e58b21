use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{Credential, DateRange, ProviderConfig, Symbol};
use crate::orchestrator::Schedule;
use crate::resilient_fetcher::{RetryPolicy, TransientSignatures, MAX_RETRIES};

pub const ENV_PREFIX: &str = "REFLECT";
pub const DEFAULT_CONFIG_FILE: &str = "intraday_trading_config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub upstream_url: String,
    /// Per-attempt deadline, seconds.
    pub api_timeout: u64,
    pub max_retries: u32,
    /// Base backoff, seconds. Retry k waits `retry_delay * k`.
    pub retry_delay: f64,
    pub kline_days: usize,
    pub requests_per_second: usize,
    pub transient_signatures: TransientSignatures,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://127.0.0.1:8080".to_string(),
            api_timeout: 30,
            max_retries: 3,
            retry_delay: 2.0,
            kline_days: 60,
            requests_per_second: 5,
            transient_signatures: TransientSignatures::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    #[default]
    Specified,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub mode: SelectionMode,
    pub symbols: Vec<String>,
    pub random_count: usize,
    /// `YYYYMMDD`; defaults to two weeks before `end_date`.
    pub start_date: Option<String>,
    /// `YYYYMMDD`; defaults to today.
    pub end_date: Option<String>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Specified,
            symbols: Vec::new(),
            random_count: 5,
            start_date: None,
            end_date: None,
        }
    }
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .map_err(|_| ConfigError::Invalid(format!("{field} '{value}' is not YYYYMMDD")))
}

impl SelectionConfig {
    pub fn date_range(&self, today: NaiveDate) -> Result<DateRange, ConfigError> {
        let end = match &self.end_date {
            Some(v) => parse_date("end_date", v)?,
            None => today,
        };
        let start = match &self.start_date {
            Some(v) => parse_date("start_date", v)?,
            None => end - ChronoDuration::days(14),
        };
        DateRange::new(start, end).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Parsed symbols in listed order; repeats are dropped.
    pub fn specified_symbols(&self) -> Result<Vec<Symbol>, ConfigError> {
        let mut seen = HashSet::new();
        let mut symbols = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let symbol = Symbol::parse(raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if seen.insert(symbol.clone()) {
                symbols.push(symbol);
            } else {
                log::warn!("symbol {} listed more than once", symbol);
            }
        }
        Ok(symbols)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub schedule: Schedule,
    pub inter_provider_delay_secs: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            schedule: Schedule::Sequential,
            inter_provider_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub max_concurrent_symbols: usize,
    pub inter_symbol_delay_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent_symbols: 1,
            inter_symbol_delay_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub save_prompts: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results"),
            save_prompts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataConfig,
    pub selection: SelectionConfig,
    pub providers: Vec<ProviderConfig>,
    pub orchestration: OrchestrationConfig,
    pub analysis: AnalysisConfig,
    pub output: OutputConfig,
    /// Optional JSON map of `{id}_api_key` entries.
    pub keys_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let qwen = ProviderConfig {
            base_url: Some("https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()),
            ..ProviderConfig::new("qwen", "qwen-plus")
        };
        let deepseek = ProviderConfig {
            base_url: Some("https://api.deepseek.com".to_string()),
            ..ProviderConfig::new("deepseek", "deepseek-chat")
        };
        Self {
            data: DataConfig::default(),
            selection: SelectionConfig::default(),
            providers: vec![qwen, deepseek],
            orchestration: OrchestrationConfig::default(),
            analysis: AnalysisConfig::default(),
            output: OutputConfig::default(),
            keys_file: None,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data.api_timeout == 0 {
            return Err(ConfigError::Invalid("data.api_timeout must be positive".into()));
        }
        if self.data.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "data.max_retries must be at most {MAX_RETRIES}"
            )));
        }
        if !(self.data.retry_delay.is_finite() && self.data.retry_delay > 0.0) {
            return Err(ConfigError::Invalid("data.retry_delay must be positive".into()));
        }
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("at least one provider is required".into()));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider '{}' timeout must be positive",
                    provider.id
                )));
            }
        }

        if self.selection.mode == SelectionMode::Specified {
            self.selection.specified_symbols()?;
        }
        self.selection.date_range(chrono::Local::now().date_naive())?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.data.max_retries,
            base_delay: Duration::try_from_secs_f64(self.data.retry_delay).unwrap_or_default(),
            timeout: Duration::from_secs(self.data.api_timeout),
        }
    }

    /// Fills each provider's credential from, in order: its inline key, the
    /// env var named by `api_key_env`, `{ID}_API_KEY`, then the keys file.
    pub fn resolve_credentials(&mut self, keys: &HashMap<String, String>) {
        for provider in &mut self.providers {
            if provider.has_usable_credential() {
                continue;
            }
            let default_env = format!("{}_API_KEY", provider.id.to_uppercase().replace('-', "_"));
            let found = provider
                .api_key_env
                .iter()
                .chain(std::iter::once(&default_env))
                .find_map(|name| std::env::var(name).ok())
                .or_else(|| keys.get(&format!("{}_api_key", provider.id)).cloned());

            if let Some(value) = found {
                provider.api_key = Some(Credential::new(value));
            }
            if !provider.has_usable_credential() {
                log::warn!("provider '{}' has no usable API key", provider.id);
            }
        }
    }
}

fn read_keys_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("cannot read {}: {}", path.display(), e)))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| ConfigError::Invalid(format!("{} is not valid JSON: {}", path.display(), e)))?;

    Ok(value
        .as_object()
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default())
}

/// Defaults, then the JSON file, then `REFLECT_*` environment variables
/// (`__` separates nested keys, e.g. `REFLECT_DATA__MAX_RETRIES=5`).
pub fn load_config(path: &Path, required: bool) -> Result<AppConfig, ConfigError> {
    let settings = config::Config::builder()
        .add_source(
            config::File::from(path)
                .format(config::FileFormat::Json)
                .required(required),
        )
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut app: AppConfig = settings.try_deserialize()?;

    let keys = match &app.keys_file {
        Some(keys_path) => read_keys_file(keys_path)?,
        None => HashMap::new(),
    };
    app.resolve_credentials(&keys);
    app.validate()?;
    Ok(app)
}
