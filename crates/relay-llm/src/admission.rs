//! Per-provider admission control.
//!
//! Every upstream call holds an [`AdmissionPermit`] for its provider. Waiters
//! are served in arrival order (tokio's semaphore is fair). A permit is handed
//! back exactly once: on explicit [`AdmissionPermit::release`], on drop, or by
//! the safety timer if the holder never settles.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::{EventBus, RelayError, Result, RunEvent};

/// How long a permit may be held before the gate takes it back.
pub const DEFAULT_SAFETY_TIMEOUT: Duration = Duration::from_secs(600);

static SHARED: Lazy<Arc<AdmissionGate>> = Lazy::new(|| Arc::new(AdmissionGate::new()));

struct ProviderAdmission {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

/// Concurrency limits keyed by provider id. Providers without a limit are unbounded.
pub struct AdmissionGate {
    providers: RwLock<HashMap<String, Arc<ProviderAdmission>>>,
    safety_timeout: Duration,
    events: Option<EventBus>,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::with_safety_timeout(DEFAULT_SAFETY_TIMEOUT)
    }

    pub fn with_safety_timeout(safety_timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            safety_timeout,
            events: None,
        }
    }

    /// Publish auto-release events on this bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Process-wide default gate for callers that are not handed one explicitly.
    pub fn shared() -> Arc<AdmissionGate> {
        Arc::clone(&SHARED)
    }

    // ── Configuration ──────────────────────────────────────────

    /// Set the concurrency limit for a provider.
    ///
    /// A changed limit installs a fresh semaphore for future acquisitions.
    /// Waiters already queued on the old one still resolve as its holders release.
    pub fn configure(&self, provider: &str, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(RelayError::Config(format!(
                "providers.{provider}.max_concurrent must be at least 1"
            )));
        }
        let mut providers = self.providers.write();
        if providers.get(provider).is_some_and(|p| p.limit == limit) {
            return Ok(());
        }
        let previous = providers.insert(
            provider.to_string(),
            Arc::new(ProviderAdmission {
                limit,
                semaphore: Arc::new(Semaphore::new(limit)),
            }),
        );
        info!(
            provider = %provider,
            limit,
            previous = previous.map(|p| p.limit),
            "configured provider admission limit"
        );
        Ok(())
    }

    /// Drop the limit for a provider, making it unbounded.
    pub fn remove(&self, provider: &str) -> bool {
        self.providers.write().remove(provider).is_some()
    }

    /// Apply a full set of limits: listed providers are configured, the rest removed.
    pub fn apply_limits(&self, limits: &HashMap<String, usize>) -> Result<()> {
        if let Some((provider, _)) = limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(RelayError::Config(format!(
                "providers.{provider}.max_concurrent must be at least 1"
            )));
        }
        for (provider, limit) in limits {
            self.configure(provider, *limit)?;
        }
        let stale: Vec<String> = self
            .providers
            .read()
            .keys()
            .filter(|p| !limits.contains_key(*p))
            .cloned()
            .collect();
        for provider in stale {
            self.remove(&provider);
            debug!(provider = %provider, "removed provider admission limit");
        }
        Ok(())
    }

    // ── Introspection ──────────────────────────────────────────

    pub fn limit(&self, provider: &str) -> Option<usize> {
        self.providers.read().get(provider).map(|p| p.limit)
    }

    /// Free permits on the current semaphore.
    pub fn available(&self, provider: &str) -> Option<usize> {
        self.providers
            .read()
            .get(provider)
            .map(|p| p.semaphore.available_permits())
    }

    /// Permits held on the current semaphore.
    pub fn active(&self, provider: &str) -> Option<usize> {
        self.providers
            .read()
            .get(provider)
            .map(|p| p.limit - p.semaphore.available_permits())
    }

    // ── Acquisition ────────────────────────────────────────────

    /// Wait for a permit. Unbounded providers get one immediately.
    pub async fn acquire(&self, provider: &str) -> Result<AdmissionPermit> {
        let admission = self.providers.read().get(provider).cloned();
        let Some(admission) = admission else {
            return Ok(AdmissionPermit::unbounded(provider));
        };

        let permit = Arc::clone(&admission.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RelayError::Config(format!("admission for {provider} was closed")))?;
        Ok(self.arm(provider, permit))
    }

    /// Like [`acquire`](Self::acquire), but gives up when `cancel` fires.
    /// A cancelled waiter leaves the queue without taking a permit.
    pub async fn acquire_cancellable(
        &self,
        provider: &str,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            permit = self.acquire(provider) => permit,
        }
    }

    /// Wrap a raw permit and start its safety timer.
    fn arm(&self, provider: &str, permit: OwnedSemaphorePermit) -> AdmissionPermit {
        let slot = Arc::new(PermitSlot {
            provider: provider.to_string(),
            permit: Mutex::new(Some(permit)),
            acquired_at: Utc::now(),
        });

        let timer_slot = Arc::clone(&slot);
        let timeout = self.safety_timeout;
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer_slot.release() {
                warn!(
                    provider = %timer_slot.provider,
                    held_secs = timeout.as_secs(),
                    "admission permit was never released; auto-releasing"
                );
                if let Some(events) = events {
                    events.publish(RunEvent::PermitAutoReleased {
                        provider: timer_slot.provider.clone(),
                        held_since: timer_slot.acquired_at,
                    });
                }
            }
        });

        AdmissionPermit {
            provider: provider.to_string(),
            slot: Some(slot),
            timer: Mutex::new(Some(timer)),
        }
    }
}

struct PermitSlot {
    provider: String,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    acquired_at: DateTime<Utc>,
}

impl PermitSlot {
    /// Returns true only for the call that actually gave the permit back.
    fn release(&self) -> bool {
        self.permit.lock().take().is_some()
    }
}

/// A held admission slot. Dropping it releases the slot.
pub struct AdmissionPermit {
    provider: String,
    /// `None` for unbounded providers.
    slot: Option<Arc<PermitSlot>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionPermit {
    fn unbounded(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            slot: None,
            timer: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether this permit still occupies a slot.
    pub fn is_held(&self) -> bool {
        self.slot
            .as_ref()
            .is_some_and(|slot| slot.permit.lock().is_some())
    }

    /// Give the slot back. Safe to call any number of times; returns true once.
    pub fn release(&self) -> bool {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.slot.as_ref().is_some_and(|slot| slot.release())
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("provider", &self.provider)
            .field("held", &self.is_held())
            .finish()
    }
}
