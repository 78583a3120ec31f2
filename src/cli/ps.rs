use std::sync::Arc;

use anyhow::Result;
use console::style;

use crate::config::ProjectConfig;
use crate::docker::shell::list_swarm_services;
use crate::docker::{ContainerControl, ShellDocker};
use crate::output;
use crate::runtime::Runtime;
use crate::ssh::SshPool;

pub async fn run(runtime: Arc<Runtime>, config: ProjectConfig, env_name: &str) -> Result<()> {
    let env = config.environment(env_name)?;
    let pool = SshPool::new(runtime);
    let manager = pool.get_or_create(config.manager(env)?).await?;

    let observed = if config.is_multi_host(env) {
        list_swarm_services(&manager, &config.name, env_name).await?
    } else {
        ShellDocker::new(manager.clone())
            .list_services(&config.name, env_name)
            .await?
    };

    output::header(&format!("{} on {}", config.name, env_name));

    if observed.is_empty() {
        output::warning("No services running");
        pool.close_all().await;
        return Ok(());
    }

    println!(
        "  {:<16} {:<32} {:>9}  {}",
        style("SERVICE").bold(),
        style("IMAGE").bold(),
        style("REPLICAS").bold(),
        style("STATE").bold()
    );
    for service in &observed {
        let state = if service.running_replicas >= service.desired_replicas {
            style("running").green()
        } else if service.running_replicas == 0 {
            style("stopped").red()
        } else {
            style("degraded").yellow()
        };
        println!(
            "  {:<16} {:<32} {:>5}/{:<3}  {}",
            service.name, service.image, service.running_replicas, service.desired_replicas, state
        );
    }

    pool.close_all().await;
    Ok(())
}
