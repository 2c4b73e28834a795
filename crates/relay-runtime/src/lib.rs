//! # relay-runtime
//!
//! Executes agent runs against upstream providers: picks candidates and
//! credential profiles, runs attempts behind the admission gate, records
//! session usage, and reports finished subagent runs back to their parents.

pub mod announce;
pub mod auth_profiles;
pub mod executor;
pub mod gateway;
pub mod orchestrator;
mod persist;
pub mod profile_store;
pub mod runtime;
pub mod session_store;
pub mod subagent;
pub mod telemetry;
pub mod usage;

pub use announce::{ANNOUNCE_SKIP, AnnounceFlow, AnnounceOutcome};
pub use auth_profiles::{CooldownPolicy, CredentialRotator, implicit_profile_id};
pub use executor::{Attempt, AttemptContext, AttemptOutcome, RunAttemptExecutor};
pub use gateway::{GatewayClient, RecordingGateway};
pub use orchestrator::{OrchestratorConfig, RunOrchestrator, RunOutcome, RunRequest};
pub use profile_store::{
    AuthProfile, Credential, EnvSecretResolver, JsonFileProfileStore, MemoryProfileStore,
    ProfileStore, SecretRef, SecretResolver, StaticSecretResolver,
};
pub use runtime::{RunCore, RunCoreParts};
pub use session_store::{JsonFileSessionStore, MemorySessionStore, SessionEntry, SessionStore};
pub use subagent::{SpawnParams, SubagentRegistry, SubagentRunRecord, SubagentSpawner};
pub use usage::{PersistUsage, UsageRecorder};
