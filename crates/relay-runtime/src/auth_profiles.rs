//! Credential profile selection, cooldowns and rotation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use relay_config::AuthConfig;
use relay_core::{FailureClass, RelayError, Result};
use relay_llm::ProviderAuth;

use crate::profile_store::{
    AuthProfile, AuthProfileStoreData, ModelCooldown, ProfileStore, ProfileUpdater,
    ProfileUsageStats, SecretResolver, merge_for_persist,
};

/// Profile id used when a provider has no configured profiles.
pub fn implicit_profile_id(provider: &str) -> String {
    format!("{provider}:default")
}

// ── Cooldown policy ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub base: ChronoDuration,
    pub max: ChronoDuration,
    /// Errors older than this no longer count toward backoff.
    pub failure_window: ChronoDuration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base: ChronoDuration::seconds(60),
            max: ChronoDuration::hours(1),
            failure_window: ChronoDuration::hours(24),
        }
    }
}

impl CooldownPolicy {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            max: ChronoDuration::seconds(config.max_cooldown_secs as i64),
            failure_window: ChronoDuration::hours(config.failure_window_hours as i64),
            ..Self::default()
        }
    }

    /// 1m, 5m, 25m, then capped.
    pub fn cooldown_for(&self, error_count: u32) -> ChronoDuration {
        let exponent = error_count.saturating_sub(1).min(3);
        let cooldown = self.base * 5i32.pow(exponent);
        cooldown.min(self.max)
    }
}

/// Record a transient failure on `stats`. Returns the cooldown deadline that
/// was set, or `None` when the class does not cool a profile down.
pub fn apply_failure(
    stats: &mut ProfileUsageStats,
    class: FailureClass,
    model: Option<&str>,
    now: DateTime<Utc>,
    policy: &CooldownPolicy,
) -> Option<DateTime<Utc>> {
    if !class.triggers_rotation() {
        // Diagnostics only; no cooldown and no effect on backoff.
        *stats
            .failure_counts
            .entry(class.as_str().to_string())
            .or_insert(0) += 1;
        return None;
    }

    let window_expired = stats
        .last_failure_at
        .is_none_or(|at| now - at > policy.failure_window);
    if window_expired {
        stats.error_count = 0;
        stats.failure_counts.clear();
    }
    stats.error_count += 1;
    stats.last_failure_at = Some(now);
    *stats
        .failure_counts
        .entry(class.as_str().to_string())
        .or_insert(0) += 1;

    // Rate limits are usually per model; keep the rest of the profile usable.
    if class == FailureClass::RateLimit
        && let Some(model) = model
    {
        let entry = stats.model_cooldowns.entry(model.to_string()).or_default();
        if entry.last_failure_at.is_none_or(|at| now - at > policy.failure_window) {
            entry.error_count = 0;
        }
        entry.error_count += 1;
        entry.last_failure_at = Some(now);
        let until = now + policy.cooldown_for(entry.error_count);
        entry.until = Some(until);
        return Some(until);
    }

    let until = now + policy.cooldown_for(stats.error_count);
    stats.cooldown_until = Some(until);
    Some(until)
}

/// Clear failure state after a successful call.
pub fn apply_success(stats: &mut ProfileUsageStats, model: Option<&str>, now: DateTime<Utc>) {
    stats.last_used = Some(now);
    stats.last_good_at = Some(now);
    stats.error_count = 0;
    stats.cooldown_until = None;
    stats.failure_counts.clear();
    match model {
        Some(model) => {
            stats.model_cooldowns.remove(model);
        }
        None => stats.model_cooldowns.clear(),
    }
}

/// Remaining cooldown for a profile (and model), if any.
pub fn cooldown_remaining(
    stats: &ProfileUsageStats,
    model: Option<&str>,
    now: DateTime<Utc>,
) -> Option<ChronoDuration> {
    let profile_until = stats.cooldown_until.filter(|until| *until > now);
    let model_until = model
        .and_then(|m| stats.model_cooldowns.get(m))
        .and_then(|c: &ModelCooldown| c.until)
        .filter(|until| *until > now);
    profile_until.max(model_until).map(|until| until - now)
}

// ── Rotator ────────────────────────────────────────────────────

/// Picks the credential profile for each attempt and tracks per-profile health.
///
/// The store is the source of truth; every mutation goes through its locked
/// update and the returned contents replace the in-memory snapshot. Store
/// writes and snapshot installs happen under `writes`, so snapshots land in
/// the order the store produced them.
pub struct CredentialRotator {
    store: Arc<dyn ProfileStore>,
    secrets: Arc<dyn SecretResolver>,
    order: RwLock<HashMap<String, Vec<String>>>,
    policy: RwLock<CooldownPolicy>,
    snapshot: RwLock<AuthProfileStoreData>,
    writes: TokioMutex<()>,
}

impl CredentialRotator {
    pub async fn load(
        store: Arc<dyn ProfileStore>,
        secrets: Arc<dyn SecretResolver>,
        config: &AuthConfig,
    ) -> Result<Self> {
        let snapshot = store.load().await?;
        info!(profiles = snapshot.profiles.len(), "auth profiles loaded");
        Ok(Self {
            store,
            secrets,
            order: RwLock::new(config.order.clone()),
            policy: RwLock::new(CooldownPolicy::from_config(config)),
            snapshot: RwLock::new(snapshot),
            writes: TokioMutex::new(()),
        })
    }

    /// Replace ordering and cooldown policy after a config reload.
    pub fn apply_config(&self, config: &AuthConfig) {
        *self.order.write() = config.order.clone();
        *self.policy.write() = CooldownPolicy::from_config(config);
    }

    /// Re-read the store, picking up edits made outside this process.
    pub async fn refresh(&self) -> Result<()> {
        let _writes = self.writes.lock().await;
        let data = self.store.load().await?;
        *self.snapshot.write() = data;
        Ok(())
    }

    /// Run one store update and install its result as the snapshot.
    async fn write_through(&self, updater: ProfileUpdater) -> Result<()> {
        let _writes = self.writes.lock().await;
        let data = self.store.update(updater).await?;
        *self.snapshot.write() = data;
        Ok(())
    }

    pub fn profile(&self, profile_id: &str) -> Option<AuthProfile> {
        self.snapshot.read().profiles.get(profile_id).cloned()
    }

    pub fn stats(&self, profile_id: &str) -> Option<ProfileUsageStats> {
        self.snapshot.read().usage_stats.get(profile_id).cloned()
    }

    /// Candidate profiles for a provider, in the order they should be tried.
    ///
    /// An explicit configured order wins (restricted to known profiles). Without
    /// one, stored profiles go least recently good first. A provider with no
    /// profiles gets a single implicit one.
    pub fn profile_order(&self, provider: &str) -> Vec<String> {
        let snapshot = self.snapshot.read();
        let known: Vec<&AuthProfile> = snapshot.profiles_for(provider);

        if let Some(explicit) = self.order.read().get(provider) {
            let mut seen = HashSet::new();
            let ordered: Vec<String> = explicit
                .iter()
                .filter(|id| known.iter().any(|p| &p.profile_id == *id))
                .filter(|id| seen.insert(id.as_str()))
                .cloned()
                .collect();
            if !ordered.is_empty() {
                return ordered;
            }
            if !explicit.is_empty() {
                warn!(provider, "configured auth order names no stored profile; ignoring it");
            }
        }

        if known.is_empty() {
            return vec![implicit_profile_id(provider)];
        }

        let mut ids: Vec<(Option<DateTime<Utc>>, String)> = known
            .iter()
            .map(|p| {
                let last_good = snapshot
                    .usage_stats
                    .get(&p.profile_id)
                    .and_then(|s| s.last_good_at);
                (last_good, p.profile_id.clone())
            })
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn cooldown_remaining(&self, profile_id: &str, model: Option<&str>) -> Option<ChronoDuration> {
        let snapshot = self.snapshot.read();
        snapshot
            .usage_stats
            .get(profile_id)
            .and_then(|stats| cooldown_remaining(stats, model, Utc::now()))
    }

    pub fn is_in_cooldown(&self, profile_id: &str, model: Option<&str>) -> bool {
        self.cooldown_remaining(profile_id, model).is_some()
    }

    /// First profile in `order` that is neither in `skip` nor cooling down.
    pub fn resolve_profile(
        &self,
        order: &[String],
        skip: &HashSet<String>,
        model: Option<&str>,
    ) -> Option<String> {
        order
            .iter()
            .filter(|id| !skip.contains(*id))
            .find(|id| {
                let cooling = self.is_in_cooldown(id, model);
                if cooling {
                    debug!(profile_id = %id, model = ?model, "skipping profile in cooldown");
                }
                !cooling
            })
            .cloned()
    }

    /// Record a failure. Only transient classes put the profile in cooldown;
    /// returns whether one was set.
    pub async fn mark_failure(
        &self,
        profile_id: &str,
        class: FailureClass,
        model: Option<&str>,
    ) -> Result<bool> {
        let policy = *self.policy.read();
        let id = profile_id.to_string();
        let model = model.map(str::to_string);
        let set = Arc::new(parking_lot::Mutex::new(None));
        let set_inner = Arc::clone(&set);

        self.write_through(Box::new(move |data| {
            let stats = data.usage_stats.entry(id).or_default();
            *set_inner.lock() = apply_failure(stats, class, model.as_deref(), Utc::now(), &policy);
        }))
        .await?;

        let until = *set.lock();
        if let Some(until) = until {
            warn!(profile_id, class = %class, until = %until, "auth profile cooling down");
        }
        Ok(until.is_some())
    }

    pub async fn mark_success(&self, profile_id: &str, model: Option<&str>) -> Result<()> {
        let id = profile_id.to_string();
        let model = model.map(str::to_string);
        self.write_through(Box::new(move |data| {
            let stats = data.usage_stats.entry(id).or_default();
            apply_success(stats, model.as_deref(), Utc::now());
        }))
        .await
    }

    /// Credential to send for `profile_id`. Implicit profiles carry no key and
    /// leave the provider on its own default.
    pub async fn resolve_auth(&self, profile_id: &str) -> Result<ProviderAuth> {
        let Some(profile) = self.profile(profile_id) else {
            return Ok(ProviderAuth {
                profile_id: profile_id.to_string(),
                api_key: None,
            });
        };

        let api_key = match (&profile.credential.value, &profile.credential.secret_ref) {
            (Some(value), _) => value.clone(),
            (None, Some(secret_ref)) => self.secrets.resolve(secret_ref).await?,
            (None, None) => {
                return Err(RelayError::Secret(format!(
                    "profile {profile_id} has neither a value nor a secret reference"
                )));
            }
        };
        Ok(ProviderAuth {
            profile_id: profile_id.to_string(),
            api_key: Some(api_key),
        })
    }

    /// Insert or replace a profile. A stored secret reference survives an
    /// incoming literal-only credential.
    pub async fn upsert_profile(&self, profile: AuthProfile) -> Result<()> {
        let id = profile.profile_id.clone();
        self.write_through(Box::new(move |data| {
            let merged = merge_for_persist(data.profiles.get(&profile.profile_id), profile);
            data.profiles.insert(merged.profile_id.clone(), merged);
        }))
        .await?;
        info!(profile_id = %id, "auth profile saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_backoff_schedule() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.cooldown_for(1), ChronoDuration::minutes(1));
        assert_eq!(policy.cooldown_for(2), ChronoDuration::minutes(5));
        assert_eq!(policy.cooldown_for(3), ChronoDuration::minutes(25));
        assert_eq!(policy.cooldown_for(4), ChronoDuration::hours(1));
        assert_eq!(policy.cooldown_for(40), ChronoDuration::hours(1));
    }

    #[test]
    fn test_fatal_classes_do_not_cool_down() {
        let mut stats = ProfileUsageStats::default();
        let policy = CooldownPolicy::default();
        for class in [
            FailureClass::Billing,
            FailureClass::Auth { recoverable: false },
            FailureClass::Timeout,
            FailureClass::Unknown,
        ] {
            assert!(apply_failure(&mut stats, class, None, Utc::now(), &policy).is_none());
        }
        assert_eq!(stats.error_count, 0);
        assert!(stats.cooldown_until.is_none());
        assert_eq!(stats.failure_counts.get("billing"), Some(&1));
        assert_eq!(stats.failure_counts.len(), 4);
    }

    #[test]
    fn test_rate_limit_with_model_scopes_cooldown() {
        let mut stats = ProfileUsageStats::default();
        let now = Utc::now();
        apply_failure(
            &mut stats,
            FailureClass::RateLimit,
            Some("gpt-4o"),
            now,
            &CooldownPolicy::default(),
        );
        assert!(stats.cooldown_until.is_none());
        assert!(cooldown_remaining(&stats, Some("gpt-4o"), now).is_some());
        assert!(cooldown_remaining(&stats, Some("gpt-4o-mini"), now).is_none());
    }

    #[test]
    fn test_failure_window_resets_count() {
        let mut stats = ProfileUsageStats::default();
        let policy = CooldownPolicy::default();
        let start = Utc::now() - ChronoDuration::hours(30);
        let auth = FailureClass::Auth { recoverable: true };
        apply_failure(&mut stats, auth, None, start, &policy);
        apply_failure(&mut stats, auth, None, start, &policy);
        assert_eq!(stats.error_count, 2);

        let now = Utc::now();
        let until = apply_failure(&mut stats, auth, None, now, &policy);
        assert_eq!(stats.error_count, 1);
        assert_eq!(until, Some(now + ChronoDuration::minutes(1)));
    }

    #[test]
    fn test_success_clears_state() {
        let mut stats = ProfileUsageStats::default();
        let now = Utc::now();
        apply_failure(
            &mut stats,
            FailureClass::Auth { recoverable: true },
            None,
            now,
            &CooldownPolicy::default(),
        );
        apply_failure(
            &mut stats,
            FailureClass::RateLimit,
            Some("gpt-4o"),
            now,
            &CooldownPolicy::default(),
        );
        apply_success(&mut stats, None, now);
        assert_eq!(stats.error_count, 0);
        assert!(stats.model_cooldowns.is_empty());
        assert!(cooldown_remaining(&stats, None, now).is_none());
        assert_eq!(stats.last_good_at, Some(now));
    }
}
