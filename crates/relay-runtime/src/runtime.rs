//! `RunCore`: wires the gate, rotator, stores, orchestrator and subagent flow together.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use relay_config::{ReloadHook, RelayConfig};
use relay_core::{EventBus, Result};
use relay_llm::{AdmissionGate, ProviderRegistry};

use crate::announce::{AnnounceFlow, AnnounceOutcome};
use crate::auth_profiles::CredentialRotator;
use crate::executor::RunAttemptExecutor;
use crate::gateway::GatewayClient;
use crate::orchestrator::{OrchestratorConfig, RunOrchestrator, RunOutcome, RunRequest};
use crate::profile_store::{EnvSecretResolver, JsonFileProfileStore, ProfileStore, SecretResolver};
use crate::session_store::{JsonFileSessionStore, SessionStore};
use crate::subagent::{SpawnParams, SpawnResult, SubagentRegistry, SubagentSettings, SubagentSpawner};
use crate::usage::UsageRecorder;

/// Pluggable parts of a [`RunCore`].
pub struct RunCoreParts {
    pub providers: ProviderRegistry,
    pub gateway: Arc<dyn GatewayClient>,
    pub sessions: Arc<dyn SessionStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub secrets: Arc<dyn SecretResolver>,
}

pub struct RunCore {
    pub events: EventBus,
    pub gate: Arc<AdmissionGate>,
    pub rotator: Arc<CredentialRotator>,
    pub sessions: Arc<dyn SessionStore>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub subagents: Arc<SubagentRegistry>,
    pub spawner: SubagentSpawner,
    pub announcer: Arc<AnnounceFlow>,
}

impl RunCore {
    pub async fn new(config: &RelayConfig, parts: RunCoreParts) -> Result<Self> {
        let events = EventBus::default();

        let gate = Arc::new(
            AdmissionGate::with_safety_timeout(Duration::from_secs(config.admission.safety_timeout_secs))
                .with_events(events.clone()),
        );
        gate.apply_limits(&config.admission_limits())?;

        let rotator = Arc::new(CredentialRotator::load(parts.profiles, parts.secrets, &config.auth).await?);
        let orchestrator = Arc::new(RunOrchestrator::new(
            parts.providers,
            Arc::clone(&rotator),
            RunAttemptExecutor::new(Arc::clone(&gate)),
            UsageRecorder::new(Arc::clone(&parts.sessions)),
            events.clone(),
            OrchestratorConfig::from_config(config),
        ));

        let subagents = Arc::new(SubagentRegistry::new(SubagentSettings::from_config(&config.subagents)));
        let spawner = SubagentSpawner::new(Arc::clone(&parts.gateway), Arc::clone(&subagents))
            .with_events(events.clone());
        let announcer = Arc::new(
            AnnounceFlow::new(parts.gateway, Arc::clone(&subagents))
                .with_sessions(Arc::clone(&parts.sessions))
                .with_events(events.clone()),
        );

        info!(
            providers = config.providers.len(),
            model = %config.agent.model,
            "run core ready"
        );
        Ok(Self {
            events,
            gate,
            rotator,
            sessions: parts.sessions,
            orchestrator,
            subagents,
            spawner,
            announcer,
        })
    }

    /// Build with the file-backed stores at their configured paths and
    /// environment-based secret resolution.
    pub async fn from_config(
        config: &RelayConfig,
        providers: ProviderRegistry,
        gateway: Arc<dyn GatewayClient>,
    ) -> Result<Self> {
        let parts = RunCoreParts {
            providers,
            gateway,
            sessions: Arc::new(JsonFileSessionStore::new(config.session_store_path())),
            profiles: Arc::new(JsonFileProfileStore::new(config.auth_store_path())),
            secrets: Arc::new(EnvSecretResolver),
        };
        Self::new(config, parts).await
    }

    /// Re-apply a changed config to the live components.
    pub fn apply_config(&self, config: &RelayConfig) -> Result<()> {
        self.gate.apply_limits(&config.admission_limits())?;
        self.rotator.apply_config(&config.auth);
        self.orchestrator.set_config(OrchestratorConfig::from_config(config));
        self.subagents.apply_config(&config.subagents);
        info!("run core configuration applied");
        Ok(())
    }

    /// Hook for `ConfigLoader::on_reload`.
    pub fn reload_hook(self: &Arc<Self>) -> ReloadHook {
        let core = Arc::clone(self);
        Arc::new(move |config: &RelayConfig| {
            if let Err(e) = core.apply_config(config) {
                warn!(error = %e, "failed to apply reloaded configuration");
            }
        })
    }

    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        self.orchestrator.run(request).await
    }

    /// Spawn a child run and announce its result in the background.
    pub async fn spawn_subagent(
        &self,
        params: SpawnParams,
    ) -> Result<(SpawnResult, JoinHandle<Result<AnnounceOutcome>>)> {
        let spawned = self.spawner.spawn(params).await?;
        let watcher = self.announcer.watch(&spawned.run_id);
        Ok((spawned, watcher))
    }

    /// Periodically drop archived subagent records.
    pub fn start_sweeper(&self, every: Duration) -> JoinHandle<()> {
        self.subagents.start_sweeper(every)
    }
}
