//! One provider attempt: admission, tool-chain repair, the call, classification.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_core::{FailureClass, ModelRef, RelayError};
use relay_llm::tool_chain::{self, ToolChainPayload};
use relay_llm::{AdmissionGate, LlmProvider, LlmRequest, LlmResponse, classify};

/// Everything one attempt needs. The payload is borrowed mutably because a
/// repaired tool chain must stay repaired for the attempts that follow.
pub struct AttemptContext<'a> {
    pub provider: Arc<dyn LlmProvider>,
    pub target: &'a ModelRef,
    pub profile_id: &'a str,
    /// Request template; `input` and `previous_response_id` come from `payload`.
    pub request: LlmRequest,
    pub payload: &'a mut ToolChainPayload,
    pub cancel: &'a CancellationToken,
    /// Budget for the provider call itself, excluding time queued for admission.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Success(LlmResponse),
    Failed { class: FailureClass, error: RelayError },
    Cancelled,
}

#[derive(Debug)]
pub struct Attempt {
    pub profile_id: String,
    pub target: ModelRef,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Runs single attempts behind the admission gate.
#[derive(Clone)]
pub struct RunAttemptExecutor {
    gate: Arc<AdmissionGate>,
}

impl RunAttemptExecutor {
    pub fn new(gate: Arc<AdmissionGate>) -> Self {
        Self { gate }
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub async fn attempt(&self, ctx: AttemptContext<'_>) -> Attempt {
        let started = Instant::now();
        let outcome = self
            .run(ctx.provider, ctx.target, ctx.request, ctx.payload, ctx.cancel, ctx.timeout)
            .await;
        Attempt {
            profile_id: ctx.profile_id.to_string(),
            target: ctx.target.clone(),
            outcome,
            elapsed: started.elapsed(),
        }
    }

    async fn run(
        &self,
        provider: Arc<dyn LlmProvider>,
        target: &ModelRef,
        mut request: LlmRequest,
        payload: &mut ToolChainPayload,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> AttemptOutcome {
        let permit = match self.gate.acquire_cancellable(&target.provider, cancel).await {
            Ok(permit) => permit,
            Err(RelayError::Cancelled) => return AttemptOutcome::Cancelled,
            Err(error) => {
                return AttemptOutcome::Failed {
                    class: classify(&error),
                    error,
                };
            }
        };

        // A broken chain is repaired here but still fails the attempt, so the
        // orchestrator can count the retry against its corruption budget.
        if let Err(violation) = tool_chain::sanitize(payload) {
            permit.release();
            return AttemptOutcome::Failed {
                class: FailureClass::ToolChainCorruption,
                error: violation.into(),
            };
        }

        request.model = target.model.clone();
        request.input = payload.items.clone();
        request.previous_response_id = payload.previous_response_id.clone();

        debug!(
            provider = %target.provider,
            model = %target.model,
            items = request.input.len(),
            history_limit = ?request.limit_history_turns,
            "calling provider"
        );

        let call = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, provider.complete(&request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(RelayError::Timeout(format!(
                            "{target} did not answer within {}s",
                            limit.as_secs()
                        )))
                    }),
                None => provider.complete(&request).await,
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = call => Some(result),
        };
        permit.release();

        match result {
            None => AttemptOutcome::Cancelled,
            Some(Ok(response)) => AttemptOutcome::Success(response),
            Some(Err(error)) => {
                let class = classify(&error);
                if class == FailureClass::ToolChainCorruption {
                    tool_chain::drop_tail_turn(payload);
                }
                warn!(
                    provider = %target.provider,
                    model = %target.model,
                    class = %class,
                    error = %error,
                    "provider attempt failed"
                );
                AttemptOutcome::Failed { class, error }
            }
        }
    }
}
