//! Session usage bookkeeping after a completed run.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use relay_core::Result;
use relay_llm::Usage;

use crate::session_store::{SessionEntry, SessionStore};

/// What a finished run reports back to the session store.
#[derive(Debug, Clone, Default)]
pub struct PersistUsage {
    pub session_key: String,
    /// Usage accumulated over the whole run.
    pub usage: Option<Usage>,
    /// Usage of the final provider call alone.
    pub last_call_usage: Option<Usage>,
    pub model_used: Option<String>,
    pub provider_used: Option<String>,
    /// Context window of the model that answered.
    pub context_tokens_used: Option<u64>,
    /// Set for runs under a temporary model override (heartbeats and the like),
    /// so the session keeps reporting its configured model and window.
    pub skip_model_and_context_update: bool,
}

/// Prompt-side tokens currently in the context window, capped at the window size.
///
/// The last call's usage is preferred: accumulated usage over a multi-call run
/// counts the same history several times over.
pub fn derive_context_total(
    usage: &Usage,
    last_call_usage: Option<&Usage>,
    context_tokens: Option<u64>,
) -> u64 {
    let prompt = last_call_usage
        .filter(|u| !u.is_zero())
        .unwrap_or(usage)
        .prompt_tokens();
    match context_tokens {
        Some(limit) if limit > 0 => prompt.min(limit),
        _ => prompt,
    }
}

/// Apply one run's usage to a session entry. Returns false when there is
/// nothing to record.
pub fn apply_usage(entry: &mut SessionEntry, params: &PersistUsage, now: DateTime<Utc>) -> bool {
    let Some(usage) = params.usage.filter(|u| !u.is_zero()) else {
        return false;
    };

    entry.input_tokens = Some(usage.input_tokens);
    entry.output_tokens = Some(usage.output_tokens);
    entry.cache_read = Some(usage.cache_read_tokens);
    entry.cache_write = Some(usage.cache_write_tokens);
    entry.updated_at = Some(now);

    if params.skip_model_and_context_update {
        return true;
    }

    let context_tokens = params.context_tokens_used.or(entry.context_tokens);
    entry.total_tokens = Some(derive_context_total(
        &usage,
        params.last_call_usage.as_ref(),
        context_tokens,
    ));
    entry.total_tokens_fresh = Some(true);
    if let Some(model) = &params.model_used {
        entry.model = Some(model.clone());
    }
    if let Some(provider) = &params.provider_used {
        entry.model_provider = Some(provider.clone());
    }
    if let Some(context) = params.context_tokens_used {
        entry.context_tokens = Some(context);
    }
    true
}

/// Writes run usage into the session store.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn SessionStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Record usage for a run. Returns the updated entry, or `None` when the
    /// run reported no usage and nothing was written.
    pub async fn persist(&self, params: PersistUsage) -> Result<Option<SessionEntry>> {
        if !params.usage.is_some_and(|u| !u.is_zero()) {
            debug!(session_key = %params.session_key, "no usage reported; session entry left as is");
            return Ok(None);
        }

        let key = params.session_key.clone();
        let skip = params.skip_model_and_context_update;
        let entry = self
            .store
            .update(
                &key,
                Box::new(move |entry| {
                    apply_usage(entry, &params, Utc::now());
                }),
            )
            .await?;
        debug!(
            session_key = %key,
            total_tokens = ?entry.total_tokens,
            skip_model_and_context_update = skip,
            "session usage recorded"
        );
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> Usage {
        Usage::new(input, output)
    }

    #[test]
    fn test_last_call_usage_wins_and_is_capped() {
        let total = derive_context_total(&usage(900_000, 10), Some(&usage(150_000, 5)), Some(128_000));
        assert_eq!(total, 128_000);

        let total = derive_context_total(&usage(900, 10), Some(&usage(300, 5)), Some(128_000));
        assert_eq!(total, 300);
    }

    #[test]
    fn test_zero_last_call_usage_falls_back() {
        let total = derive_context_total(&usage(900, 10), Some(&Usage::default()), None);
        assert_eq!(total, 900);
    }

    #[test]
    fn test_zero_usage_records_nothing() {
        let mut entry = SessionEntry::default();
        let params = PersistUsage {
            session_key: "s".into(),
            usage: Some(Usage::default()),
            ..Default::default()
        };
        assert!(!apply_usage(&mut entry, &params, Utc::now()));
        assert_eq!(entry, SessionEntry::default());
    }
}
