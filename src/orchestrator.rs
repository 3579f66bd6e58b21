use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ai_service::{BackendFactory, ModelBackend};
use crate::error::RunError;
use crate::models::{ForecastSummary, ProviderConfig, ProviderRunResult, RunStatus, StepKind};
use crate::prompt_builder::extract_summary;
use crate::sequencer::StepSequencer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    /// One provider at a time, with the inter-provider delay between them.
    #[default]
    Sequential,
    /// All providers at once, starts staggered by the inter-provider delay.
    Concurrent,
}

/// Fans one symbol's step sequence out to every configured provider. A
/// provider's failure only ever shows up in that provider's result.
pub struct ProviderOrchestrator {
    backends: Arc<dyn BackendFactory>,
    schedule: Schedule,
    inter_provider_delay: Duration,
}

impl ProviderOrchestrator {
    pub fn new(
        backends: Arc<dyn BackendFactory>,
        schedule: Schedule,
        inter_provider_delay: Duration,
    ) -> Self {
        Self {
            backends,
            schedule,
            inter_provider_delay,
        }
    }

    pub async fn run_all<F>(
        &self,
        providers: &[ProviderConfig],
        sequencer_factory: F,
    ) -> BTreeMap<String, ProviderRunResult>
    where
        F: Fn() -> StepSequencer,
    {
        let mut results = BTreeMap::new();
        let mut eligible: Vec<(ProviderConfig, Arc<dyn ModelBackend>)> = Vec::new();

        for provider in providers {
            if !provider.has_usable_credential() {
                log::warn!("[{}] no usable API key, skipping", provider.id);
                let error = RunError::MissingCredential {
                    provider: provider.id.clone(),
                };
                results.insert(
                    provider.id.clone(),
                    ProviderRunResult::skipped(provider, error, RunStatus::MissingCredential),
                );
                continue;
            }

            match self.backends.backend_for(provider) {
                Ok(backend) => eligible.push((provider.clone(), backend)),
                Err(error) => {
                    log::warn!("[{}] {}", provider.id, error);
                    results.insert(
                        provider.id.clone(),
                        ProviderRunResult::skipped(provider, error, RunStatus::Failed),
                    );
                }
            }
        }

        if eligible.is_empty() {
            log::warn!("no provider has a usable credential; nothing to run");
            return results;
        }

        match self.schedule {
            Schedule::Sequential => {
                for (i, (provider, backend)) in eligible.into_iter().enumerate() {
                    if i > 0 && !self.inter_provider_delay.is_zero() {
                        tokio::time::sleep(self.inter_provider_delay).await;
                    }
                    let handle = tokio::spawn(run_provider(provider.clone(), backend, sequencer_factory()));
                    let result = join_result(handle.await, &provider);
                    results.insert(provider.id.clone(), result);
                }
            }
            Schedule::Concurrent => {
                let mut handles = Vec::with_capacity(eligible.len());
                for (i, (provider, backend)) in eligible.into_iter().enumerate() {
                    let stagger = self.inter_provider_delay.saturating_mul(i as u32);
                    let sequencer = sequencer_factory();
                    let task_provider = provider.clone();
                    let handle = tokio::spawn(async move {
                        if !stagger.is_zero() {
                            tokio::time::sleep(stagger).await;
                        }
                        run_provider(task_provider, backend, sequencer).await
                    });
                    handles.push((provider, handle));
                }
                for (provider, handle) in handles {
                    let result = join_result(handle.await, &provider);
                    results.insert(provider.id.clone(), result);
                }
            }
        }

        results
    }
}

fn join_result(
    joined: Result<ProviderRunResult, tokio::task::JoinError>,
    provider: &ProviderConfig,
) -> ProviderRunResult {
    match joined {
        Ok(result) => result,
        Err(e) => {
            log::error!("[{}] provider task aborted: {}", provider.id, e);
            let error = RunError::TaskAborted {
                reason: e.to_string(),
            };
            ProviderRunResult::skipped(provider, error, RunStatus::Failed)
        }
    }
}

async fn run_provider(
    provider: ProviderConfig,
    backend: Arc<dyn ModelBackend>,
    sequencer: StepSequencer,
) -> ProviderRunResult {
    let started_at = Local::now();
    log::info!(
        "[{}] starting {} steps on {}",
        provider.id,
        sequencer.total_steps(),
        provider.model
    );

    let outcome = sequencer.run(backend.as_ref(), &provider).await;
    let steps = outcome.context.into_entries();

    let status = match (&outcome.error, steps.is_empty()) {
        (None, _) => RunStatus::Complete,
        (Some(_), true) => RunStatus::Failed,
        (Some(_), false) => RunStatus::Partial,
    };

    let summary = steps
        .last()
        .filter(|s| matches!(s.kind, StepKind::FinalForecast { .. }))
        .map(|s| extract_summary(&s.response))
        .unwrap_or_else(ForecastSummary::default);

    log::info!(
        "[{}] finished: {} ({} steps)",
        provider.id,
        status,
        steps.len()
    );

    ProviderRunResult {
        run_id: Uuid::new_v4(),
        provider_id: provider.id.clone(),
        model: provider.model.clone(),
        status,
        steps,
        error: outcome.error.map(RunError::from),
        summary,
        started_at,
        finished_at: Local::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::sequencer::tests::{inputs, ScriptedBackend};
    use std::collections::HashMap;
    use tokio::time::Instant;

    struct PanickingBackend;

    #[async_trait::async_trait]
    impl ModelBackend for PanickingBackend {
        async fn invoke(&self, _prompt: &str, _provider: &ProviderConfig) -> Result<String, ModelError> {
            panic!("backend exploded");
        }
    }

    /// Maps provider id to the call number that fails (None = never).
    struct ScriptedFactory {
        fail_at: HashMap<String, Option<usize>>,
    }

    impl BackendFactory for ScriptedFactory {
        fn backend_for(&self, provider: &ProviderConfig) -> Result<Arc<dyn ModelBackend>, RunError> {
            if provider.id == "panicky" {
                return Ok(Arc::new(PanickingBackend));
            }
            match self.fail_at.get(&provider.id) {
                Some(fail_at) => Ok(Arc::new(ScriptedBackend::new(*fail_at))),
                None => Err(RunError::UnsupportedProvider {
                    provider: provider.id.clone(),
                }),
            }
        }
    }

    fn orchestrator(fail_at: &[(&str, Option<usize>)], schedule: Schedule) -> ProviderOrchestrator {
        let factory = ScriptedFactory {
            fail_at: fail_at
                .iter()
                .map(|(id, at)| (id.to_string(), *at))
                .collect(),
        };
        ProviderOrchestrator::new(Arc::new(factory), schedule, Duration::from_secs(2))
    }

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig::new(id, "test-model").with_credential("sk-test")
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failing_provider_does_not_affect_others() {
        let orch = orchestrator(
            &[("qwen", None), ("deepseek", Some(2)), ("qwen-max", None)],
            Schedule::Sequential,
        );
        let providers = vec![provider("qwen"), provider("deepseek"), provider("qwen-max")];

        let results = orch.run_all(&providers, || StepSequencer::new(inputs(&[3, 4, 5]))).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results["qwen"].status, RunStatus::Complete);
        assert_eq!(results["qwen"].steps.len(), 4);
        assert_eq!(results["qwen-max"].status, RunStatus::Complete);

        let failed = &results["deepseek"];
        assert_eq!(failed.status, RunStatus::Partial);
        assert_eq!(failed.steps.len(), 1);
        assert_eq!(failed.failed_step(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_excluded_before_dispatch() {
        let orch = orchestrator(&[("qwen", None), ("deepseek", None)], Schedule::Sequential);
        let providers = vec![
            provider("qwen"),
            ProviderConfig::new("deepseek", "deepseek-chat").with_credential("sk-请填入"),
        ];

        let results = orch.run_all(&providers, || StepSequencer::new(inputs(&[3]))).await;
        assert_eq!(results["deepseek"].status, RunStatus::MissingCredential);
        assert!(results["deepseek"].steps.is_empty());
        assert_eq!(results["qwen"].status, RunStatus::Complete);
        assert_eq!(results["qwen"].summary.action.as_deref(), Some("观望"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_step_failure_is_failed_status() {
        let orch = orchestrator(&[("qwen", Some(1))], Schedule::Sequential);
        let results = orch
            .run_all(&[provider("qwen")], || StepSequencer::new(inputs(&[3, 4])))
            .await;
        assert_eq!(results["qwen"].status, RunStatus::Failed);
        assert_eq!(results["qwen"].failed_step(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_and_panicking_providers_are_isolated() {
        let orch = orchestrator(&[("qwen", None)], Schedule::Concurrent);
        let providers = vec![provider("qwen"), provider("kimi"), provider("panicky")];

        let results = orch.run_all(&providers, || StepSequencer::new(inputs(&[3]))).await;
        assert_eq!(results["qwen"].status, RunStatus::Complete);
        assert!(matches!(
            results["kimi"].error,
            Some(RunError::UnsupportedProvider { .. })
        ));
        assert_eq!(results["panicky"].status, RunStatus::Failed);
        assert!(matches!(
            results["panicky"].error,
            Some(RunError::TaskAborted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_schedule_waits_between_providers() {
        let orch = orchestrator(&[("qwen", None), ("deepseek", None)], Schedule::Sequential);
        let providers = vec![provider("qwen"), provider("deepseek")];

        let start = Instant::now();
        let results = orch.run_all(&providers, || StepSequencer::new(inputs(&[3]))).await;
        assert_eq!(results.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
