use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ServiceSpec;
use crate::docker::{ContainerControl, ContainerRequest};
use crate::output;
use crate::secrets;
use crate::state::{HealthSnapshot, ServiceSnapshot};

use super::context::DeployContext;
use super::health::{self, HealthTarget};
use super::hooks;

const DRAIN_DELAY: Duration = Duration::from_secs(10);

/// Single-host rollout: the new revision runs alongside the old one, takes
/// traffic once healthy, and only then is the old revision drained and
/// removed. Any failure before that point removes the new revision and
/// leaves the old one serving.
pub struct BlueGreenDeployer<'a, C: ContainerControl> {
    control: &'a C,
    ctx: &'a DeployContext,
    cancel: CancellationToken,
    drain_delay: Duration,
}

impl<'a, C: ContainerControl> BlueGreenDeployer<'a, C> {
    pub fn new(control: &'a C, ctx: &'a DeployContext, cancel: CancellationToken) -> Self {
        Self {
            control,
            ctx,
            cancel,
            drain_delay: DRAIN_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    /// Deploy one service to its next revision. Returns the snapshot that
    /// goes into the deployment record.
    pub async fn deploy_service(
        &self,
        name: &str,
        spec: &ServiceSpec,
        image: &str,
    ) -> Result<ServiceSnapshot> {
        let observed = self
            .control
            .list_services(self.ctx.project(), &self.ctx.env_name)
            .await?;
        let old_containers: Vec<String> = observed
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.container_names.clone())
            .unwrap_or_default();
        let revision = next_revision(&old_containers);

        hooks::run_host_hooks(self.control, &spec.hooks.pre_deploy, "pre-deploy").await?;

        self.control
            .ensure_network(&self.ctx.network_name())
            .await?;

        let env = secrets::compose_environment(spec, &self.ctx.secrets)?;
        let labels = self.ctx.labels_for(name, spec, revision);

        let mut created: Vec<String> = Vec::new();
        let rollout = async {
            for replica in 1..=spec.replicas {
                let container = self.ctx.container_name(name, revision, replica);
                let request = ContainerRequest {
                    name: container.clone(),
                    image: image.to_string(),
                    network: Some(self.ctx.network_name()),
                    env: env.clone(),
                    labels: labels.clone(),
                    volumes: spec.volumes.clone(),
                    port: spec.port,
                    health_cmd: health_command(spec),
                    health_interval: spec
                        .health_check
                        .as_ref()
                        .map(|h| h.interval)
                        .unwrap_or(5),
                    health_retries: spec
                        .health_check
                        .as_ref()
                        .map(|h| h.retries)
                        .unwrap_or(3),
                };
                self.control
                    .create_container(&request)
                    .await
                    .with_context(|| format!("Failed to start {}", container))?;
                created.push(container);
            }

            if let Some(target) = self.health_target(name, spec, &created) {
                health::wait_healthy(self.control, &target, &self.cancel).await?;
            }
            Ok::<(), anyhow::Error>(())
        };

        if let Err(err) = rollout.await {
            warn!("rollout of {} failed, removing new revision", name);
            self.remove_containers(&created).await;
            return Err(err).with_context(|| format!("Deploy of {} failed", name));
        }

        // Flip: the new revision is healthy and outranks the old one; let
        // in-flight requests drain, then retire the old containers.
        if !old_containers.is_empty() {
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(self.drain_delay) => {}
            }
            for old in &old_containers {
                if let Err(err) = self.control.stop_container(old).await {
                    warn!("failed to stop previous container {}: {:#}", old, err);
                }
                if let Err(err) = self.control.remove_container(old).await {
                    warn!("failed to remove previous container {}: {:#}", old, err);
                }
            }
        }

        hooks::run_host_hooks(self.control, &spec.hooks.post_deploy, "post-deploy").await?;
        if let Some(first) = created.first() {
            hooks::run_container_hooks(self.control, first, &spec.hooks.post_start).await?;
        }

        output::success(&format!("{} is live at revision {}", name, revision));

        Ok(ServiceSnapshot {
            name: name.to_string(),
            image: image.to_string(),
            image_id: String::new(),
            container_id: created.first().cloned(),
            port: spec.port,
            replicas: spec.replicas,
            env: spec.env.clone(),
            health_check: HealthSnapshot {
                enabled: spec.health_check.is_some() || spec.is_public(),
                path: spec.health_check.as_ref().map(|h| h.path.clone()),
                healthy: true,
                last_check: Some(chrono::Utc::now()),
            },
        })
    }

    /// Adjust the replica count of the current revision without a new
    /// rollout.
    pub async fn scale_service(&self, name: &str, spec: &ServiceSpec, replicas: u32) -> Result<()> {
        let observed = self
            .control
            .list_services(self.ctx.project(), &self.ctx.env_name)
            .await?;
        let Some(service) = observed.iter().find(|s| s.name == name) else {
            return Err(crate::error::TakoError::Config(format!(
                "service '{}' is not running, deploy it first",
                name
            ))
            .into());
        };

        let revision = current_revision(&service.container_names).unwrap_or(1);
        let current = service.container_names.len() as u32;

        if replicas > current {
            let env = secrets::compose_environment(spec, &self.ctx.secrets)?;
            let labels = self.ctx.labels_for(name, spec, revision);
            for replica in (current + 1)..=replicas {
                let request = ContainerRequest {
                    name: self.ctx.container_name(name, revision, replica),
                    image: service.image.clone(),
                    network: Some(self.ctx.network_name()),
                    env: env.clone(),
                    labels: labels.clone(),
                    volumes: spec.volumes.clone(),
                    port: spec.port,
                    health_cmd: health_command(spec),
                    health_interval: 5,
                    health_retries: 3,
                };
                self.control.create_container(&request).await?;
            }
        } else {
            // Retire the highest replica indexes first.
            let mut names = service.container_names.clone();
            names.sort();
            for doomed in names.iter().skip(replicas as usize) {
                self.control.stop_container(doomed).await?;
                self.control.remove_container(doomed).await?;
            }
        }
        Ok(())
    }

    /// Stop a service's containers, keeping them (and their config) around
    /// so `start` is the exact inverse.
    pub async fn stop_service(&self, name: &str) -> Result<()> {
        for container in self.containers_of(name).await? {
            self.control.stop_container(&container).await?;
        }
        Ok(())
    }

    pub async fn start_service(&self, name: &str) -> Result<()> {
        for container in self.containers_of(name).await? {
            self.control.start_container(&container).await?;
        }
        Ok(())
    }

    /// Remove a service entirely (plan `remove` items, destroy).
    pub async fn remove_service(&self, name: &str) -> Result<()> {
        let containers = self.containers_of(name).await?;
        self.remove_containers(&containers).await;
        Ok(())
    }

    async fn containers_of(&self, name: &str) -> Result<Vec<String>> {
        let observed = self
            .control
            .list_services(self.ctx.project(), &self.ctx.env_name)
            .await?;
        Ok(observed
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.container_names.clone())
            .unwrap_or_default())
    }

    async fn remove_containers(&self, containers: &[String]) {
        for container in containers {
            if let Err(err) = self.control.remove_container(container).await {
                warn!("cleanup of {} failed: {:#}", container, err);
            }
        }
    }

    fn health_target(
        &self,
        name: &str,
        spec: &ServiceSpec,
        created: &[String],
    ) -> Option<HealthTarget> {
        let container = created.first()?.clone();
        if spec.health_check.is_none() && !spec.is_public() {
            return None;
        }

        let check = spec.health_check.clone().unwrap_or_default();
        let http_url = spec.proxy.as_ref().and_then(|proxy| {
            proxy
                .domains
                .first()
                .map(|domain| format!("http://{}{}", domain, check.path))
        });

        Some(HealthTarget {
            service: name.to_string(),
            container,
            http_url,
            interval: Duration::from_secs(check.interval),
            retries: check.retries,
        })
    }
}

/// Next revision number from the observed container names of a service.
pub fn next_revision(containers: &[String]) -> u32 {
    current_revision(containers).map(|r| r + 1).unwrap_or(1)
}

/// Highest revision currently present, parsed from `..._<rev>[_rN]` names.
pub fn current_revision(containers: &[String]) -> Option<u32> {
    containers
        .iter()
        .filter_map(|name| parse_revision(name))
        .max()
}

fn parse_revision(name: &str) -> Option<u32> {
    let mut tail = name;
    // Drop a replica suffix (`_rN`) if present.
    if let Some((rest, last)) = tail.rsplit_once('_') {
        if last.len() > 1 && last.starts_with('r') && last[1..].chars().all(|c| c.is_ascii_digit())
        {
            tail = rest;
        }
    }
    let (_, rev) = tail.rsplit_once('_')?;
    rev.parse().ok()
}

fn health_command(spec: &ServiceSpec) -> Option<String> {
    let check = spec.health_check.as_ref()?;
    let port = spec.port?;
    Some(format!(
        "curl -fsS --max-time {} http://localhost:{}{} > /dev/null || exit 1",
        check.timeout, port, check.path
    ))
}
