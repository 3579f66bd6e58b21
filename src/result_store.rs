use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::models::{ProviderRunResult, Symbol};

/// Identifies the symbol run a result belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub symbol: Symbol,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Persists one provider's result; returns where it went.
    async fn write(&self, run: &RunContext, result: &ProviderRunResult) -> Result<PathBuf, StoreError>;
}

#[derive(Serialize)]
struct ResultDocument<'a> {
    symbol: &'a Symbol,
    name: &'a str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    generated_at: String,
    #[serde(flatten)]
    result: &'a ProviderRunResult,
}

/// One pretty-printed JSON file per provider per symbol:
/// `{code}_{name}_{provider}_result_{timestamp}_{run}.json`, where `run` is
/// the first eight hex digits of the run id.
pub struct JsonFileStore {
    output_dir: PathBuf,
    save_prompts: bool,
}

impl JsonFileStore {
    pub fn new(output_dir: impl Into<PathBuf>, save_prompts: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_prompts,
        }
    }

    fn file_name(run: &RunContext, result: &ProviderRunResult, timestamp: &str) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| match c {
                    '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => '_',
                    c => c,
                })
                .collect()
        };
        let run_id = result.run_id.simple().to_string();
        format!(
            "{}_{}_{}_result_{}_{}.json",
            run.symbol,
            sanitize(&run.name),
            sanitize(&result.provider_id),
            timestamp,
            &run_id[..8]
        )
    }
}

#[async_trait::async_trait]
impl ResultSink for JsonFileStore {
    async fn write(&self, run: &RunContext, result: &ProviderRunResult) -> Result<PathBuf, StoreError> {
        let io_err = |path: &Path, source: std::io::Error| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| io_err(&self.output_dir, e))?;

        let now = Local::now();
        let timestamp = now.format("%Y%m%d_%H%M%S").to_string();
        let path = self
            .output_dir
            .join(Self::file_name(run, result, &timestamp));

        let stripped;
        let result = if self.save_prompts {
            result
        } else {
            let mut copy = result.clone();
            for step in &mut copy.steps {
                step.prompt.clear();
            }
            stripped = copy;
            &stripped
        };

        let document = ResultDocument {
            symbol: &run.symbol,
            name: &run.name,
            start_date: run.start_date,
            end_date: run.end_date,
            generated_at: now.to_rfc3339(),
            result,
        };
        let json = serde_json::to_string_pretty(&document)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_err(&path, e))?;

        log::info!("saved {} result to {}", result.provider_id, path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RunError, StepModelError};
    use crate::models::{ForecastSummary, RunStatus, StepKind, StepRecord};
    use uuid::Uuid;

    fn run() -> RunContext {
        RunContext {
            symbol: Symbol::parse("600030").unwrap(),
            name: "中信 证券".to_string(),
            start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 7).unwrap(),
        }
    }

    fn result() -> ProviderRunResult {
        let now = Local::now();
        ProviderRunResult {
            run_id: Uuid::new_v4(),
            provider_id: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            status: RunStatus::Partial,
            steps: vec![StepRecord {
                step: 1,
                kind: StepKind::Reflective {
                    date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                },
                prior_prediction: None,
                prompt: "很长的提示词".to_string(),
                response: "回答".to_string(),
                prediction: "回答".to_string(),
            }],
            error: Some(RunError::from(StepModelError {
                step: 2,
                message: "HTTP 500".to_string(),
            })),
            summary: ForecastSummary::default(),
            started_at: now,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn test_writes_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("results"), false);

        let path = store.write(&run(), &result()).await.unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("600030_中信_证券_deepseek_result_"));
        assert!(file_name.ends_with(".json"));

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["symbol"], "600030");
        assert_eq!(json["status"], "partial");
        assert_eq!(json["error"]["step"], 2);
        assert_eq!(json["steps"][0]["prompt"], "");
        assert_eq!(json["steps"][0]["response"], "回答");
    }

    #[tokio::test]
    async fn test_keeps_prompts_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path(), true);

        let path = store.write(&run(), &result()).await.unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.contains("很长的提示词"));
    }

    #[tokio::test]
    async fn test_same_second_writes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path(), false);

        let first = result();
        let second = result();
        let a = store.write(&run(), &first).await.unwrap();
        let b = store.write(&run(), &second).await.unwrap();
        assert_ne!(a, b);

        let short = first.run_id.simple().to_string();
        assert!(a.to_string_lossy().ends_with(&format!("_{}.json", &short[..8])));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
