use std::time::Duration;

use async_trait::async_trait;
use layerfit_contracts::models::ModelSpec;

use crate::provider::{GenerationRequest, GenerationResponse, ProviderRegistry};

/// What an interpreter made of one candidate's response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<T> {
    /// Terminal: stop and return this value.
    Accept(T),
    /// Not usable; try the next candidate.
    Advance(String),
}

/// Task-specific reading of a successful provider response.
#[async_trait]
pub trait ResponseInterpreter: Send + Sync {
    type Output: Send;

    async fn interpret(&self, response: GenerationResponse) -> Verdict<Self::Output>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub model: String,
    pub provider: String,
    pub accepted: bool,
    pub detail: String,
}

#[derive(Debug)]
pub enum FallbackOutcome<T> {
    Accepted {
        value: T,
        model: String,
        attempts: Vec<Attempt>,
    },
    Exhausted {
        last_reason: String,
        attempts: Vec<Attempt>,
    },
}

impl<T> FallbackOutcome<T> {
    pub fn attempts(&self) -> &[Attempt] {
        match self {
            FallbackOutcome::Accepted { attempts, .. } => attempts,
            FallbackOutcome::Exhausted { attempts, .. } => attempts,
        }
    }
}

/// Tries candidates strictly in order. Each call is bounded by `timeout`;
/// provider errors, timeouts and `Advance` verdicts move on to the next
/// candidate. The first `Accept` ends the run.
pub async fn run_candidates<I: ResponseInterpreter>(
    providers: &ProviderRegistry,
    candidates: &[ModelSpec],
    request: &GenerationRequest,
    timeout: Duration,
    interpreter: &I,
) -> FallbackOutcome<I::Output> {
    let mut attempts = Vec::new();
    let mut last_reason = "no candidate models configured".to_string();

    for candidate in candidates {
        let reason = match providers.get(&candidate.provider) {
            None => format!("provider '{}' is not registered", candidate.provider),
            Some(service) => {
                match tokio::time::timeout(timeout, service.generate(&candidate.name, request))
                    .await
                {
                    Err(_) => format!("timed out after {}s", timeout.as_secs_f32()),
                    Ok(Err(err)) => err.to_string(),
                    Ok(Ok(response)) => match interpreter.interpret(response).await {
                        Verdict::Accept(value) => {
                            attempts.push(Attempt {
                                model: candidate.name.clone(),
                                provider: candidate.provider.clone(),
                                accepted: true,
                                detail: "accepted".to_string(),
                            });
                            return FallbackOutcome::Accepted {
                                value,
                                model: candidate.name.clone(),
                                attempts,
                            };
                        }
                        Verdict::Advance(reason) => reason,
                    },
                }
            }
        };

        tracing::debug!(model = %candidate.name, provider = %candidate.provider, %reason, "candidate skipped");
        attempts.push(Attempt {
            model: candidate.name.clone(),
            provider: candidate.provider.clone(),
            accepted: false,
            detail: reason.clone(),
        });
        last_reason = format!("{}: {reason}", candidate.name);
    }

    FallbackOutcome::Exhausted {
        last_reason,
        attempts,
    }
}
