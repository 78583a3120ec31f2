use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::TakoError;
use crate::ssh::SshClient;

use super::{
    parse_container_listing, parse_service_listing, run_command, service_command, sh_quote,
    ActualService, ContainerControl, ContainerRequest, HealthState, SwarmServiceRequest,
    LABEL_ENVIRONMENT, LABEL_PORT, LABEL_PROJECT, LABEL_REPLICAS, LABEL_SERVICE,
};

/// `ContainerControl` over an SSH shell: every operation is a `docker` CLI
/// invocation on the remote host.
pub struct ShellDocker {
    client: Arc<SshClient>,
}

impl ShellDocker {
    pub fn new(client: Arc<SshClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<SshClient> {
        &self.client
    }
}

impl ContainerControl for ShellDocker {
    async fn host_command(&self, cmd: &str) -> Result<String> {
        self.client.execute(cmd).await
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!(
                "docker network inspect {} >/dev/null 2>&1 || docker network create {}",
                name, name
            ))
            .await
            .with_context(|| format!("Failed to ensure network {}", name))?;
        Ok(())
    }

    async fn create_container(&self, req: &ContainerRequest) -> Result<String> {
        let id = self
            .client
            .execute(&run_command(req))
            .await
            .with_context(|| format!("Failed to create container {}", req.name))?;
        Ok(id.trim().to_string())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("docker start {}", name))
            .await
            .with_context(|| format!("Failed to start container {}", name))?;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("docker stop {}", name))
            .await
            .with_context(|| format!("Failed to stop container {}", name))?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("docker rm -f {} 2>/dev/null || true", name))
            .await
            .with_context(|| format!("Failed to remove container {}", name))?;
        Ok(())
    }

    async fn exec(&self, container: &str, cmd: &str) -> Result<String> {
        self.client
            .execute(&format!("docker exec {} sh -c {}", container, sh_quote(cmd)))
            .await
            .with_context(|| format!("Failed to exec in container {}", container))
    }

    async fn container_health(&self, name: &str) -> Result<HealthState> {
        let raw = self
            .client
            .execute(&format!(
                "docker inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{end}}}}' {}",
                name
            ))
            .await
            .with_context(|| format!("Failed to inspect container {}", name))?;
        Ok(HealthState::parse(&raw))
    }

    async fn http_probe(&self, url: &str) -> Result<bool> {
        let code = self
            .client
            .execute(&format!(
                "curl -s -o /dev/null -w '%{{http_code}}' --max-time 5 {} || true",
                sh_quote(url)
            ))
            .await?;
        let code: u16 = code.trim().parse().unwrap_or(0);
        Ok((200..400).contains(&code))
    }

    async fn list_services(&self, project: &str, env: &str) -> Result<Vec<ActualService>> {
        let format = format!(
            "{{{{.Names}}}}\t{{{{.Image}}}}\t{{{{.ID}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.Label \"{}\"}}}}\t{{{{.State}}}}",
            LABEL_SERVICE, LABEL_REPLICAS, LABEL_PORT
        );
        let listing = self
            .client
            .execute(&format!(
                "docker ps -a --filter label={}={} --filter label={}={} --format {}",
                LABEL_PROJECT,
                project,
                LABEL_ENVIRONMENT,
                env,
                sh_quote(&format)
            ))
            .await
            .context("Failed to list containers")?;
        Ok(parse_container_listing(&listing))
    }

    async fn create_service(&self, req: &SwarmServiceRequest) -> Result<()> {
        self.client
            .execute(&service_command(req, false))
            .await
            .with_context(|| format!("Failed to create service {}", req.name))?;
        Ok(())
    }

    async fn update_service(&self, req: &SwarmServiceRequest) -> Result<()> {
        self.client
            .execute(&service_command(req, true))
            .await
            .with_context(|| format!("Failed to update service {}", req.name))?;
        Ok(())
    }

    async fn scale_service(&self, name: &str, replicas: u32) -> Result<()> {
        self.client
            .execute(&format!("docker service scale {}={}", name, replicas))
            .await
            .with_context(|| format!("Failed to scale service {}", name))?;
        Ok(())
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("docker service rm {} 2>/dev/null || true", name))
            .await
            .with_context(|| format!("Failed to remove service {}", name))?;
        Ok(())
    }

    async fn rollback_service(&self, name: &str) -> Result<()> {
        self.client
            .execute(&format!("docker service rollback {}", name))
            .await
            .with_context(|| format!("Failed to roll back service {}", name))?;
        Ok(())
    }

    async fn service_replicas(&self, name: &str) -> Result<(u32, u32)> {
        let raw = self
            .client
            .execute(&format!(
                "docker service ls --filter name={} --format '{{{{.Replicas}}}}'",
                name
            ))
            .await
            .with_context(|| format!("Failed to read replicas of {}", name))?;

        let line = raw.lines().next().unwrap_or("").trim();
        let (running, desired) = line.split_once('/').ok_or_else(|| {
            TakoError::RemoteExec {
                exit_code: 0,
                stderr: format!("unexpected replica report '{}' for {}", line, name),
            }
        })?;
        Ok((
            running.trim().parse().unwrap_or(0),
            desired.trim().parse().unwrap_or(0),
        ))
    }
}

/// Swarm service listing on the manager, shared by the reconciler and the
/// drift detector in multi-host mode.
pub async fn list_swarm_services(
    client: &SshClient,
    project: &str,
    env: &str,
) -> Result<Vec<ActualService>> {
    let listing = client
        .execute(&format!(
            "docker service ls --filter label={}={} --format '{{{{.Name}}}}\t{{{{.Image}}}}\t{{{{.Replicas}}}}'",
            LABEL_PROJECT, project
        ))
        .await
        .context("Failed to list swarm services")?;
    Ok(parse_service_listing(project, env, &listing))
}
