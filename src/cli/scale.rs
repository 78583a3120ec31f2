use std::collections::BTreeMap;
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
use crate::state::{History, LocalStateStore, LockOperation, StateLock};

/// Parse `SERVICE=N` arguments.
pub fn parse_targets(targets: &[String]) -> Result<BTreeMap<String, u32>> {
    let mut parsed = BTreeMap::new();
    for target in targets {
        let (service, count) = target.split_once('=').ok_or_else(|| {
            TakoError::Config(format!("'{}' is not of the form SERVICE=N", target))
        })?;
        let count: u32 = count.parse().map_err(|_| {
            TakoError::Config(format!("'{}' is not a valid replica count", count))
        })?;
        parsed.insert(service.to_string(), count);
    }
    Ok(parsed)
}

pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: PathBuf,
    targets: &[String],
) -> Result<()> {
    let targets = parse_targets(targets)?;
    let tako_dir = project_root.join(".tako");
    let _lock = StateLock::acquire(&tako_dir, LockOperation::Deploy)?;

    let store_secrets = secrets::load(&tako_dir, env_name)?;
    let ctx = DeployContext::new(config, env_name, project_root.clone(), store_secrets)?;

    for service in targets.keys() {
        if !ctx.environment.services.contains_key(service) {
            return Err(TakoError::Config(format!(
                "service '{}' is not configured in {}",
                service, env_name
            ))
            .into());
        }
    }

    let pool = SshPool::new(runtime.clone());
    let manager = pool.get_or_create(ctx.config.manager(&ctx.environment)?).await?;
    let control = ShellDocker::new(manager.clone());
    let multi_host = ctx.config.is_multi_host(&ctx.environment);

    for (service, replicas) in &targets {
        output::info(&format!("Scaling {} to {}", service, replicas));
        if multi_host {
            SwarmDeployer::new(&control, &ctx, runtime.cancel.clone())
                .scale(service, *replicas)
                .await?;
        } else {
            let spec = &ctx.environment.services[service];
            BlueGreenDeployer::new(&control, &ctx, runtime.cancel.clone())
                .scale_service(service, spec, *replicas)
                .await?;
        }
        output::success(&format!("{} scaled to {}", service, replicas));
    }

    let store = LocalStateStore::open(&tako_dir, ctx.project(), env_name)?;
    let summary = targets
        .iter()
        .map(|(s, n)| format!("{}={}", s, n))
        .collect::<Vec<_>>()
        .join(" ");
    store.log_deployment(&format!("scaled {}", summary)).await?;

    pool.close_all().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_pairs() {
        let parsed = parse_targets(&["web=3".to_string(), "api=1".to_string()]).unwrap();
        assert_eq!(parsed["web"], 3);
        assert_eq!(parsed["api"], 1);
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(parse_targets(&["web".to_string()]).is_err());
        assert!(parse_targets(&["web=lots".to_string()]).is_err());
    }

    #[test]
    fn zero_replicas_is_valid() {
        assert_eq!(parse_targets(&["web=0".to_string()]).unwrap()["web"], 0);
    }
}
