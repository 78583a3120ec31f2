use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::config::ProjectConfig;
use crate::deploy::single::BlueGreenDeployer;
use crate::deploy::swarm::{self, SwarmDeployer};
use crate::deploy::DeployContext;
use crate::docker::ShellDocker;
use crate::error::TakoError;
use crate::output;
use crate::registry::Registry;
use crate::runtime::Runtime;
use crate::secrets;
use crate::ssh::SshPool;
use crate::state::{LockOperation, StateLock, REMOTE_STATE_ROOT};

/// `tako destroy [--purge-all]`: remove every deployed service of the
/// environment. With `--purge-all`, named volumes are archived to the
/// manager's backup directory first, then volumes and remote state go too.
pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: PathBuf,
    purge_all: bool,
    yes: bool,
) -> Result<()> {
    let tako_dir = project_root.join(".tako");
    let _lock = StateLock::acquire(&tako_dir, LockOperation::Destroy)?;

    if !yes {
        if crate::runtime::non_interactive() {
            return Err(TakoError::PlanRefused.into());
        }
        let prompt = if purge_all {
            format!(
                "Destroy {} on {} INCLUDING volumes and remote state?",
                config.name, env_name
            )
        } else {
            format!("Destroy all services of {} on {}?", config.name, env_name)
        };
        let accepted = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);
        if !accepted {
            return Err(TakoError::PlanRefused.into());
        }
    }

    let store_secrets = secrets::load(&tako_dir, env_name)?;
    let ctx = DeployContext::new(config, env_name, project_root, store_secrets)?;

    let pool = SshPool::new(runtime.clone());
    let manager = pool.get_or_create(ctx.config.manager(&ctx.environment)?).await?;
    let control = ShellDocker::new(manager.clone());
    let multi_host = ctx.config.is_multi_host(&ctx.environment);

    output::header(&format!("Destroying {} on {}", ctx.project(), env_name));

    for name in ctx.environment.services.keys() {
        output::info(&format!("Removing {}", name));
        if multi_host {
            SwarmDeployer::new(&control, &ctx, runtime.cancel.clone())
                .remove(name)
                .await?;
        } else {
            BlueGreenDeployer::new(&control, &ctx, runtime.cancel.clone())
                .remove_service(name)
                .await?;
        }
    }

    if multi_host {
        swarm::downgrade_to_single_server(&pool, &ctx.config, &ctx.environment, env_name, &tako_dir)
            .await?;
    } else {
        let _ = manager
            .execute(&format!(
                "docker network rm {} 2>/dev/null || true",
                ctx.network_name()
            ))
            .await;
    }

    if purge_all {
        backup_and_purge_volumes(&manager, &ctx).await?;

        output::info("Removing remote state");
        manager
            .execute(&format!("rm -rf {}/{}", REMOTE_STATE_ROOT, ctx.project()))
            .await?;

        let registry = Registry::new(manager.clone());
        registry.remove_project(ctx.project()).await?;
    }

    output::success(&format!("{} destroyed on {}", ctx.project(), env_name));
    pool.close_all().await;
    Ok(())
}

/// Archive every named volume labelled for this project before removing it.
async fn backup_and_purge_volumes(
    manager: &crate::ssh::SshClient,
    ctx: &DeployContext,
) -> Result<()> {
    let listing = manager
        .execute(&format!(
            "docker volume ls --filter label={}={} --format '{{{{.Name}}}}'",
            crate::docker::LABEL_PROJECT,
            ctx.project()
        ))
        .await?;

    let volumes: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if volumes.is_empty() {
        return Ok(());
    }

    let backup_dir = format!("{}/{}/backups", REMOTE_STATE_ROOT, ctx.project());
    manager.execute(&format!("mkdir -p {}", backup_dir)).await?;
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");

    for volume in &volumes {
        let archive = format!("{}/{}-{}.tar.gz", backup_dir, volume, stamp);
        output::info(&format!("Backing up volume {} to {}", volume, archive));
        manager
            .execute(&format!(
                "docker run --rm -v {}:/data:ro -v {}:/backup alpine \
                 tar -czf /backup/{} -C /data .",
                volume,
                backup_dir,
                archive.rsplit('/').next().unwrap_or("backup.tar.gz")
            ))
            .await?;
        manager
            .execute(&format!("docker volume rm {}", volume))
            .await?;
    }

    output::success(&format!("{} volume(s) backed up and removed", volumes.len()));
    Ok(())
}
