use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PlacementStrategy, ProjectConfig, ServiceSpec};
use crate::crypto::ProjectKey;
use crate::docker::{ContainerControl, SwarmServiceRequest};
use crate::error::TakoError;
use crate::output;
use crate::secrets;
use crate::ssh::SshPool;

use super::context::DeployContext;

const SWARM_PORT: u16 = 2377;
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(300);
const CONVERGE_POLL: Duration = Duration::from_secs(3);

/// Cluster membership and join tokens, persisted key-file encrypted on the
/// operator workstation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmState {
    pub initialized: bool,
    pub manager_host: String,
    pub worker_join_token: String,
    pub manager_join_token: String,
    /// host -> role
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SwarmState {
    fn state_path(tako_dir: &Path, project: &str) -> std::path::PathBuf {
        tako_dir.join(project).join("swarm.enc")
    }

    pub fn load(tako_dir: &Path, project: &str) -> Result<Option<Self>> {
        let path = Self::state_path(tako_dir, project);
        if !path.exists() {
            return Ok(None);
        }
        let key = ProjectKey::load_or_generate(tako_dir)?;
        let sealed = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let json = key.open(&sealed)?;
        Ok(Some(
            serde_json::from_slice(&json).context("Malformed swarm state")?,
        ))
    }

    pub fn save(&self, tako_dir: &Path, project: &str) -> Result<()> {
        let path = Self::state_path(tako_dir, project);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = ProjectKey::load_or_generate(tako_dir)?;
        let sealed = key.seal(&serde_json::to_vec(self)?)?;
        std::fs::write(&path, sealed)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn destroy(tako_dir: &Path, project: &str) -> Result<()> {
        let path = Self::state_path(tako_dir, project);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

/// Bring the Swarm cluster to the configured membership: init the manager
/// if needed, join every worker that is not yet part of it. Returns the
/// refreshed state.
pub async fn setup_swarm_cluster(
    pool: &SshPool,
    config: &ProjectConfig,
    env: &crate::config::Environment,
    tako_dir: &Path,
) -> Result<SwarmState> {
    let manager_spec = config.manager(env)?;
    let manager = pool.get_or_create(manager_spec).await?;

    let node_state = manager
        .execute("docker info --format '{{.Swarm.LocalNodeState}}'")
        .await?
        .trim()
        .to_string();

    if node_state != "active" {
        output::info(&format!("Initializing swarm on {}", manager_spec.host));
        manager
            .execute(&format!(
                "docker swarm init --advertise-addr {}",
                manager_spec.host
            ))
            .await
            .context("Failed to initialize swarm")?;
    }

    let worker_token = manager
        .execute("docker swarm join-token -q worker")
        .await?
        .trim()
        .to_string();
    let manager_token = manager
        .execute("docker swarm join-token -q manager")
        .await?
        .trim()
        .to_string();

    let mut state = SwarmState {
        initialized: true,
        manager_host: manager_spec.host.clone(),
        worker_join_token: worker_token.clone(),
        manager_join_token: manager_token,
        nodes: BTreeMap::new(),
        last_updated: Some(Utc::now()),
    };
    state
        .nodes
        .insert(manager_spec.host.clone(), "manager".to_string());

    for worker_spec in config.workers(env)? {
        let worker = pool.get_or_create(worker_spec).await?;
        let member_state = worker
            .execute("docker info --format '{{.Swarm.LocalNodeState}}'")
            .await?
            .trim()
            .to_string();

        if member_state != "active" {
            output::info(&format!("Joining {} to the swarm", worker_spec.host));
            worker
                .execute(&format!(
                    "docker swarm join --token {} {}:{}",
                    worker_token, manager_spec.host, SWARM_PORT
                ))
                .await
                .with_context(|| format!("Failed to join {} to the swarm", worker_spec.host))?;
        }
        state
            .nodes
            .insert(worker_spec.host.clone(), "worker".to_string());
    }

    state.save(tako_dir, &config.name)?;
    Ok(state)
}

/// Translate a service spec into Swarm placement flags.
pub fn placement_flags(spec: &ServiceSpec) -> (Vec<String>, Vec<String>) {
    let Some(placement) = &spec.placement else {
        return (Vec::new(), Vec::new());
    };
    match placement.strategy {
        PlacementStrategy::Spread => (
            Vec::new(),
            vec!["spread=node.labels.role".to_string()],
        ),
        PlacementStrategy::Pinned => (
            placement
                .servers
                .iter()
                .map(|server| format!("node.hostname=={}", server))
                .collect(),
            Vec::new(),
        ),
        PlacementStrategy::Any => (Vec::new(), Vec::new()),
    }
}

/// Swarm-mode rollout of one service: create or rolling-update, then wait
/// for replica convergence. A timeout triggers the Swarm-native rollback
/// and surfaces the error.
pub struct SwarmDeployer<'a, C: ContainerControl> {
    control: &'a C,
    ctx: &'a DeployContext,
    cancel: CancellationToken,
    converge_timeout: Duration,
    converge_poll: Duration,
}

impl<'a, C: ContainerControl> SwarmDeployer<'a, C> {
    pub fn new(control: &'a C, ctx: &'a DeployContext, cancel: CancellationToken) -> Self {
        Self {
            control,
            ctx,
            cancel,
            converge_timeout: CONVERGE_TIMEOUT,
            converge_poll: CONVERGE_POLL,
        }
    }

    #[cfg(test)]
    pub fn with_timeouts(mut self, timeout: Duration, poll: Duration) -> Self {
        self.converge_timeout = timeout;
        self.converge_poll = poll;
        self
    }

    pub async fn deploy_service(
        &self,
        name: &str,
        spec: &ServiceSpec,
        image: &str,
    ) -> Result<()> {
        let service_name = self.ctx.swarm_service_name(name);
        let (constraints, placement_prefs) = placement_flags(spec);

        let request = SwarmServiceRequest {
            name: service_name.clone(),
            image: image.to_string(),
            network: Some(self.ctx.network_name()),
            env: secrets::compose_environment(spec, &self.ctx.secrets)?,
            labels: self.ctx.labels_for(name, spec, 1),
            replicas: spec.replicas,
            constraints,
            placement_prefs,
            port: spec.port,
        };

        let exists = self
            .control
            .service_replicas(&service_name)
            .await
            .map(|(_, desired)| desired > 0)
            .unwrap_or(false);

        if exists {
            debug!("rolling update of {}", service_name);
            self.control.update_service(&request).await?;
        } else {
            debug!("creating swarm service {}", service_name);
            self.control.create_service(&request).await?;
        }

        if let Err(err) = self.wait_converged(&service_name, spec.replicas).await {
            warn!("{} did not converge, rolling back", service_name);
            if let Err(rollback_err) = self.control.rollback_service(&service_name).await {
                warn!("swarm rollback of {} failed: {:#}", service_name, rollback_err);
            }
            return Err(err);
        }

        output::success(&format!("{} converged at {} replica(s)", name, spec.replicas));
        Ok(())
    }

    async fn wait_converged(&self, service_name: &str, desired: u32) -> Result<()> {
        let started = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(TakoError::Cancelled.into());
            }

            let last = self.control.service_replicas(service_name).await?;
            if last.0 == desired && last.1 == desired {
                return Ok(());
            }

            if started.elapsed() > self.converge_timeout {
                return Err(TakoError::HealthCheckFailed {
                    service: service_name.to_string(),
                    last_status: format!("{}/{} replicas running", last.0, last.1),
                }
                .into());
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TakoError::Cancelled.into()),
                _ = tokio::time::sleep(self.converge_poll) => {}
            }
        }
    }

    pub async fn scale(&self, name: &str, replicas: u32) -> Result<()> {
        self.control
            .scale_service(&self.ctx.swarm_service_name(name), replicas)
            .await
    }

    /// Swarm `stop` semantics: scale to zero, keep the service definition.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.scale(name, 0).await
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        self.control
            .remove_service(&self.ctx.swarm_service_name(name))
            .await
    }
}

/// Leave Swarm mode: back up the swarm directory, remove this project's
/// services, detach every node and drop the overlay network. Services come
/// back as plain containers on the next single-host deploy.
pub async fn downgrade_to_single_server(
    pool: &SshPool,
    config: &ProjectConfig,
    env: &crate::config::Environment,
    env_name: &str,
    tako_dir: &Path,
) -> Result<()> {
    let manager_spec = config.manager(env)?;
    let manager = pool.get_or_create(manager_spec).await?;

    let backup = format!(
        "/var/lib/tako/{}/backups/swarm-{}.tar.gz",
        config.name,
        Utc::now().format("%Y%m%d-%H%M%S")
    );
    manager
        .execute(&format!(
            "mkdir -p /var/lib/tako/{}/backups && \
             tar -czf {} -C /var/lib/docker swarm 2>/dev/null || true",
            config.name, backup
        ))
        .await?;
    output::info(&format!("Swarm config backed up to {}", backup));

    let listing = manager
        .execute(&format!(
            "docker service ls --filter label={}={} --format '{{{{.Name}}}}'",
            crate::docker::LABEL_PROJECT,
            config.name
        ))
        .await?;
    for service in listing.lines().map(str::trim).filter(|s| !s.is_empty()) {
        manager
            .execute(&format!("docker service rm {}", service))
            .await?;
    }

    for worker_spec in config.workers(env)? {
        let worker = pool.get_or_create(worker_spec).await?;
        let _ = worker.execute("docker swarm leave --force").await;
    }
    manager.execute("docker swarm leave --force").await?;

    let network = format!("tako_{}_{}", config.name, env_name);
    let _ = manager
        .execute(&format!("docker network rm {} 2>/dev/null || true", network))
        .await;

    SwarmState::destroy(tako_dir, &config.name)?;
    output::success("Swarm dismantled; next deploy runs in single-host mode");
    Ok(())
}
