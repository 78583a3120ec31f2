use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::ProjectConfig;
use crate::deploy::single::BlueGreenDeployer;
use crate::deploy::swarm::SwarmDeployer;
use crate::deploy::DeployContext;
use crate::docker::ShellDocker;
use crate::error::TakoError;
use crate::output;
use crate::runtime::Runtime;
use crate::secrets;
use crate::ssh::SshPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Stop,
    Start,
}

/// Stop or start services without touching their configuration. Stop keeps
/// everything in place: single-host containers are stopped (not removed),
/// Swarm services scale to zero. Start is the exact inverse.
pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: PathBuf,
    service: Option<&str>,
    action: Action,
) -> Result<()> {
    let tako_dir = project_root.join(".tako");
    let store_secrets = secrets::load(&tako_dir, env_name)?;
    let ctx = DeployContext::new(config, env_name, project_root, store_secrets)?;

    let targets: Vec<String> = match service {
        Some(name) => {
            if !ctx.environment.services.contains_key(name) {
                return Err(TakoError::Config(format!(
                    "service '{}' is not configured in {}",
                    name, env_name
                ))
                .into());
            }
            vec![name.to_string()]
        }
        None => ctx.environment.services.keys().cloned().collect(),
    };

    let pool = SshPool::new(runtime.clone());
    let manager = pool.get_or_create(ctx.config.manager(&ctx.environment)?).await?;
    let control = ShellDocker::new(manager.clone());
    let multi_host = ctx.config.is_multi_host(&ctx.environment);

    for name in &targets {
        match action {
            Action::Stop => {
                output::info(&format!("Stopping {}", name));
                if multi_host {
                    SwarmDeployer::new(&control, &ctx, runtime.cancel.clone())
                        .stop(name)
                        .await?;
                } else {
                    BlueGreenDeployer::new(&control, &ctx, runtime.cancel.clone())
                        .stop_service(name)
                        .await?;
                }
            }
            Action::Start => {
                output::info(&format!("Starting {}", name));
                if multi_host {
                    let spec = &ctx.environment.services[name];
                    SwarmDeployer::new(&control, &ctx, runtime.cancel.clone())
                        .scale(name, spec.replicas)
                        .await?;
                } else {
                    BlueGreenDeployer::new(&control, &ctx, runtime.cancel.clone())
                        .start_service(name)
                        .await?;
                }
            }
        }
    }

    let verb = match action {
        Action::Stop => "stopped",
        Action::Start => "started",
    };
    output::success(&format!("{} service(s) {}", targets.len(), verb));

    pool.close_all().await;
    Ok(())
}
