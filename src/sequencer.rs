use std::sync::Arc;

use crate::ai_service::ModelBackend;
use crate::error::StepModelError;
use crate::models::{
    DailyContext, ProviderConfig, StepContext, StepKind, StepRecord, TickRecord, TradingDaySegment,
};
use crate::prompt_builder::{extract_prediction, PromptBuilder};

/// Splits ticks into per-day segments. Ticks are stably sorted by timestamp,
/// so equal timestamps keep their input order.
pub fn segment_by_trading_day(mut ticks: Vec<TickRecord>) -> Vec<TradingDaySegment> {
    ticks.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut segments: Vec<TradingDaySegment> = Vec::new();
    for tick in ticks {
        let date = tick.timestamp.date();
        match segments.last_mut() {
            Some(segment) if segment.date == date => segment.ticks.push(tick),
            _ => segments.push(TradingDaySegment {
                date,
                ticks: vec![tick],
            }),
        }
    }
    segments
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    AwaitingFirstSegment,
    ReflectingStep(usize),
    FinalForecast,
    Done,
    Failed { step: usize },
}

impl SequencerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SequencerState::Done | SequencerState::Failed { .. })
    }
}

/// Inputs shared read-only by every provider's sequencer for one symbol.
#[derive(Debug, Clone)]
pub struct SequenceInputs {
    pub segments: Arc<Vec<TradingDaySegment>>,
    pub daily: Arc<DailyContext>,
    pub prompts: Arc<PromptBuilder>,
}

/// What a finished (or failed) sequence leaves behind.
#[derive(Debug, Clone)]
pub struct SequenceOutcome {
    pub context: StepContext,
    pub error: Option<StepModelError>,
}

struct PendingStep {
    step: usize,
    kind: StepKind,
    prior_prediction: Option<String>,
    prompt: String,
}

/// Walks the trading days of one symbol for one provider. Step `i` quotes
/// step `i - 1`'s prediction; a final step forecasts the next unseen day.
pub struct StepSequencer {
    inputs: SequenceInputs,
    context: StepContext,
    state: SequencerState,
    error: Option<StepModelError>,
}

impl StepSequencer {
    pub fn new(inputs: SequenceInputs) -> Self {
        Self {
            inputs,
            context: StepContext::new(),
            state: SequencerState::AwaitingFirstSegment,
            error: None,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn context(&self) -> &StepContext {
        &self.context
    }

    pub fn total_steps(&self) -> usize {
        self.inputs.segments.len() + 1
    }

    fn pending_step(&self) -> Option<PendingStep> {
        let segments = &self.inputs.segments;
        let prior = self.context.last_prediction().map(str::to_string);

        match self.state {
            SequencerState::ReflectingStep(i) => {
                let segment = segments.get(i - 1)?;
                let prompt = self.inputs.prompts.reflective_step(
                    i,
                    segments.len(),
                    segment,
                    self.inputs.daily.as_of(segment.date),
                    prior.as_deref(),
                    self.context.entries(),
                );
                Some(PendingStep {
                    step: i,
                    kind: StepKind::Reflective { date: segment.date },
                    prior_prediction: prior,
                    prompt,
                })
            }
            SequencerState::FinalForecast => {
                let last_date = segments.last().map(|s| s.date);
                let daily = match last_date {
                    Some(date) => self.inputs.daily.as_of(date),
                    None => self.inputs.daily.full(),
                };
                let prompt = self.inputs.prompts.final_forecast(
                    daily,
                    last_date,
                    prior.as_deref(),
                    self.context.entries(),
                );
                Some(PendingStep {
                    step: segments.len() + 1,
                    kind: StepKind::FinalForecast { after: last_date },
                    prior_prediction: prior,
                    prompt,
                })
            }
            _ => None,
        }
    }

    fn next_state(&self, completed_step: usize) -> SequencerState {
        match self.state {
            SequencerState::ReflectingStep(_) if completed_step < self.inputs.segments.len() => {
                SequencerState::ReflectingStep(completed_step + 1)
            }
            SequencerState::ReflectingStep(_) => SequencerState::FinalForecast,
            _ => SequencerState::Done,
        }
    }

    /// Runs one model call and moves to the next state. Terminal states are
    /// left untouched.
    pub async fn advance(
        &mut self,
        backend: &dyn ModelBackend,
        provider: &ProviderConfig,
    ) -> Result<SequencerState, StepModelError> {
        if self.state == SequencerState::AwaitingFirstSegment {
            self.state = if self.inputs.segments.is_empty() {
                SequencerState::FinalForecast
            } else {
                SequencerState::ReflectingStep(1)
            };
        }

        let Some(pending) = self.pending_step() else {
            return Ok(self.state);
        };

        log::info!(
            "[{}] step {}/{} ({:?})",
            provider.id,
            pending.step,
            self.total_steps(),
            pending.kind
        );
        log::debug!("[{}] prompt:\n{}", provider.id, pending.prompt);

        match backend.invoke(&pending.prompt, provider).await {
            Ok(response) => {
                let prediction = extract_prediction(&response);
                self.state = self.next_state(pending.step);
                self.context.push(StepRecord {
                    step: pending.step,
                    kind: pending.kind,
                    prior_prediction: pending.prior_prediction,
                    prompt: pending.prompt,
                    response,
                    prediction,
                });
                Ok(self.state)
            }
            Err(e) => {
                let error = StepModelError {
                    step: pending.step,
                    message: e.to_string(),
                };
                log::warn!("[{}] {}", provider.id, error);
                self.state = SequencerState::Failed { step: pending.step };
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    pub async fn run(mut self, backend: &dyn ModelBackend, provider: &ProviderConfig) -> SequenceOutcome {
        while !self.state.is_terminal() {
            if self.advance(backend, provider).await.is_err() {
                break;
            }
        }
        SequenceOutcome {
            context: self.context,
            error: self.error,
        }
    }
}
