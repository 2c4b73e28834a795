//! Persisted credential profiles and their usage statistics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use relay_core::{RelayError, Result};

use crate::persist::{read_json_or_default, write_json_atomic};

pub const PROFILE_STORE_VERSION: u32 = 1;

// ── Credentials ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    Token,
    #[serde(rename = "oauth")]
    OAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    Env,
    File,
    Vault,
}

/// Indirect reference to a secret held outside the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub source: SecretSource,
    pub id: String,
}

impl SecretRef {
    pub fn env(var: impl Into<String>) -> Self {
        Self {
            source: SecretSource::Env,
            id: var.into(),
        }
    }
}

/// A stored credential: a literal value, a reference, or both while a
/// resolved value is in memory. Only the reference is ever written to disk.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub kind: CredentialKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

impl Credential {
    pub fn api_key(value: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::ApiKey,
            value: Some(value.into()),
            secret_ref: None,
        }
    }

    pub fn from_ref(kind: CredentialKind, secret_ref: SecretRef) -> Self {
        Self {
            kind,
            value: None,
            secret_ref: Some(secret_ref),
        }
    }

    /// The form written to disk: a referenced secret drops its literal value.
    pub fn for_persist(&self) -> Self {
        let mut out = self.clone();
        if out.secret_ref.is_some() {
            out.value = None;
        }
        out
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("value", &self.value.as_ref().map(|_| "<redacted>"))
            .field("secret_ref", &self.secret_ref)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProfile {
    pub profile_id: String,
    pub provider: String,
    pub credential: Credential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl AuthProfile {
    pub fn new(profile_id: impl Into<String>, provider: impl Into<String>, credential: Credential) -> Self {
        Self {
            profile_id: profile_id.into(),
            provider: provider.into(),
            credential,
            label: None,
        }
    }
}

/// Merge an incoming profile over the stored one before persisting.
///
/// A caller that only holds the resolved literal (the runtime snapshot) must
/// not erase the reference the stored profile was configured with.
pub fn merge_for_persist(stored: Option<&AuthProfile>, mut incoming: AuthProfile) -> AuthProfile {
    if incoming.credential.secret_ref.is_none()
        && let Some(stored) = stored
        && let Some(secret_ref) = &stored.credential.secret_ref
    {
        incoming.credential.secret_ref = Some(secret_ref.clone());
    }
    incoming.credential = incoming.credential.for_persist();
    incoming
}

// ── Usage stats ────────────────────────────────────────────────

/// A cooldown scoped to one model of a profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCooldown {
    pub until: Option<DateTime<Utc>>,
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileUsageStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_good_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Failures per class name within the current window.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub failure_counts: HashMap<String, u32>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub model_cooldowns: HashMap<String, ModelCooldown>,
}

/// On-disk layout of the profile store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthProfileStoreData {
    pub version: u32,
    pub profiles: BTreeMap<String, AuthProfile>,
    pub usage_stats: BTreeMap<String, ProfileUsageStats>,
}

impl Default for AuthProfileStoreData {
    fn default() -> Self {
        Self {
            version: PROFILE_STORE_VERSION,
            profiles: BTreeMap::new(),
            usage_stats: BTreeMap::new(),
        }
    }
}

impl AuthProfileStoreData {
    /// Copy with every referenced secret stripped of its literal value.
    pub fn for_persist(&self) -> Self {
        let mut out = self.clone();
        for profile in out.profiles.values_mut() {
            profile.credential = profile.credential.for_persist();
        }
        out
    }

    pub fn profiles_for(&self, provider: &str) -> Vec<&AuthProfile> {
        self.profiles
            .values()
            .filter(|p| p.provider == provider)
            .collect()
    }
}

// ── Store trait ────────────────────────────────────────────────

pub type ProfileUpdater = Box<dyn FnOnce(&mut AuthProfileStoreData) + Send>;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self) -> Result<AuthProfileStoreData>;

    /// Locked read-modify-write of the whole store; returns the new contents.
    async fn update(&self, updater: ProfileUpdater) -> Result<AuthProfileStoreData>;
}

#[derive(Default)]
pub struct MemoryProfileStore {
    data: TokioMutex<AuthProfileStoreData>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles(profiles: impl IntoIterator<Item = AuthProfile>) -> Self {
        let mut data = AuthProfileStoreData::default();
        for profile in profiles {
            data.profiles.insert(profile.profile_id.clone(), profile);
        }
        Self {
            data: TokioMutex::new(data),
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn load(&self) -> Result<AuthProfileStoreData> {
        Ok(self.data.lock().await.clone())
    }

    async fn update(&self, updater: ProfileUpdater) -> Result<AuthProfileStoreData> {
        let mut data = self.data.lock().await;
        updater(&mut data);
        Ok(data.clone())
    }
}

/// `auth-profiles.json`, rewritten atomically on every update.
pub struct JsonFileProfileStore {
    path: PathBuf,
    lock: TokioMutex<()>,
}

impl JsonFileProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: TokioMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<AuthProfileStoreData> {
        let data: AuthProfileStoreData = read_json_or_default(&self.path)?;
        if data.version > PROFILE_STORE_VERSION {
            return Err(RelayError::ProfileStore(format!(
                "{} has version {}, newer than supported {}",
                self.path.display(),
                data.version,
                PROFILE_STORE_VERSION
            )));
        }
        Ok(data)
    }
}

#[async_trait]
impl ProfileStore for JsonFileProfileStore {
    async fn load(&self) -> Result<AuthProfileStoreData> {
        let _guard = self.lock.lock().await;
        self.read()
    }

    async fn update(&self, updater: ProfileUpdater) -> Result<AuthProfileStoreData> {
        let _guard = self.lock.lock().await;
        let mut data = self.read()?;
        updater(&mut data);
        data.version = PROFILE_STORE_VERSION;
        let persisted = data.for_persist();
        write_json_atomic(&self.path, &persisted)?;
        debug!(path = ?self.path, profiles = persisted.profiles.len(), "auth profile store written");
        Ok(persisted)
    }
}

// ── Secret resolution ──────────────────────────────────────────

#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, secret: &SecretRef) -> Result<String>;
}

/// Resolves `env` refs from the process environment and `file` refs from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretResolver;

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, secret: &SecretRef) -> Result<String> {
        match secret.source {
            SecretSource::Env => std::env::var(&secret.id)
                .map_err(|_| RelayError::Secret(format!("environment variable {} is not set", secret.id))),
            SecretSource::File => {
                let raw = tokio::fs::read_to_string(&secret.id)
                    .await
                    .map_err(|e| RelayError::Secret(format!("cannot read {}: {e}", secret.id)))?;
                Ok(raw.trim().to_string())
            }
            SecretSource::Vault => Err(RelayError::Secret(format!(
                "no vault backend configured for {}",
                secret.id
            ))),
        }
    }
}

/// Fixed id → value table.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretResolver {
    values: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(id.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, secret: &SecretRef) -> Result<String> {
        self.values
            .get(&secret.id)
            .cloned()
            .ok_or_else(|| RelayError::Secret(format!("unknown secret {}", secret.id)))
    }
}
