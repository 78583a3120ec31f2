use std::path::Path;

use anyhow::Result;
use console::style;

use crate::config::ProjectConfig;
use crate::error::TakoError;
use crate::output;
use crate::state::{DeploymentStatus, History, ListOptions, LocalStateStore};

fn parse_status(raw: &str) -> Result<DeploymentStatus> {
    match raw {
        "success" => Ok(DeploymentStatus::Success),
        "failed" => Ok(DeploymentStatus::Failed),
        "rolled_back" => Ok(DeploymentStatus::RolledBack),
        "in_progress" => Ok(DeploymentStatus::InProgress),
        "recovered" => Ok(DeploymentStatus::Recovered),
        other => Err(TakoError::Config(format!("unknown status filter '{}'", other)).into()),
    }
}

pub async fn run(
    config: ProjectConfig,
    env: &str,
    project_root: &Path,
    limit: usize,
    status: Option<&str>,
) -> Result<()> {
    let store = LocalStateStore::open(&project_root.join(".tako"), &config.name, env)?;
    let opts = ListOptions {
        limit: Some(limit),
        status: status.map(parse_status).transpose()?,
    };
    let records = store.list(&opts).await?;

    output::header(&format!("Deployments of {} on {}", config.name, env));

    if records.is_empty() {
        output::warning("No local history. Run `tako state pull` to fetch it from the manager.");
        return Ok(());
    }

    for record in &records {
        let status = match record.status {
            DeploymentStatus::Success => style("success").green(),
            DeploymentStatus::Failed => style("failed").red(),
            DeploymentStatus::RolledBack => style("rolled_back").yellow(),
            DeploymentStatus::InProgress => style("in_progress").cyan(),
            DeploymentStatus::Recovered => style("recovered").magenta(),
        };
        let version = record
            .git
            .as_ref()
            .map(|g| g.short_hash.clone())
            .unwrap_or_else(|| record.version.clone());
        println!(
            "  {}  {:<12} {:<8} {:>6.1}s  {}",
            record.id,
            status,
            version,
            record.duration,
            record.services.keys().cloned().collect::<Vec<_>>().join(",")
        );
        if let Some(error) = &record.error {
            output::detail(&format!("    {}", error.lines().next().unwrap_or(error)));
        }
    }

    Ok(())
}
