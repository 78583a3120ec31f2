use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::ProjectConfig;
use crate::crypto::{self, EncryptedBundle};
use crate::output;
use crate::runtime::Runtime;
use crate::ssh::SshPool;
use crate::state::{
    History, ListOptions, LocalStateStore, RemoteStateStore,
};

/// `state pull`: fetch the manager's history into the local store. A manager
/// with no history is repaired from the workers; failing that, a `recovered`
/// record is synthesized from whatever is still running.
pub async fn pull(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: &Path,
) -> Result<()> {
    let env = config.environment(env_name)?;
    let pool = SshPool::new(runtime);
    let manager = pool.get_or_create(config.manager(env)?).await?;

    let mut workers = Vec::new();
    for spec in config.workers(env)? {
        workers.push(pool.get_or_create(spec).await?);
    }

    let remote = RemoteStateStore::new(manager, workers, &config.name, env_name);
    let local = LocalStateStore::open(&project_root.join(".tako"), &config.name, env_name)?;

    let mut records = remote.list(&ListOptions::default()).await?;

    if records.is_empty() {
        output::warning("Manager has no history, trying the workers");
        if let Some(recovered) = remote.recover_from_workers().await? {
            output::success(&format!("Recovered {} from a worker", recovered.id));
            records.push(recovered);
        }
    }

    if records.is_empty() {
        output::warning("No history anywhere, scanning running containers");
        if let Some(reconstructed) = remote.reconcile_from_running().await? {
            output::success(&format!(
                "Reconstructed {} from running services",
                reconstructed.id
            ));
            records.push(reconstructed);
        }
    }

    if records.is_empty() {
        output::warning("Nothing to pull");
        pool.close_all().await;
        return Ok(());
    }

    let count = records.len();
    for record in records {
        local.save(&record).await?;
    }
    output::success(&format!("Pulled {} record(s)", count));

    pool.close_all().await;
    Ok(())
}

/// `state status`: how local and remote history compare.
pub async fn status(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: &Path,
) -> Result<()> {
    let env = config.environment(env_name)?;
    let local = LocalStateStore::open(&project_root.join(".tako"), &config.name, env_name)?;
    let local_records = local.list(&ListOptions::default()).await?;

    output::header(&format!("State of {} on {}", config.name, env_name));
    output::item(&format!("local records:  {}", local_records.len()));

    let pool = SshPool::new(runtime);
    match pool.get_or_create(config.manager(env)?).await {
        Ok(manager) => {
            let remote = RemoteStateStore::new(manager, Vec::new(), &config.name, env_name);
            let remote_records = remote.list(&ListOptions::default()).await?;
            output::item(&format!("remote records: {}", remote_records.len()));

            match remote.current().await? {
                Some(current) => output::item(&format!(
                    "current: {} ({})",
                    current.id,
                    current.status.as_str()
                )),
                None => output::item("current: none"),
            }
        }
        Err(err) => output::warning(&format!("manager unreachable: {:#}", err)),
    }

    pool.close_all().await;
    Ok(())
}

/// `state export`: seal the local state directory into one passphrase-
/// protected file.
pub async fn export(config: ProjectConfig, project_root: &Path, output_path: &Path) -> Result<()> {
    let tako_dir = project_root.join(".tako");
    let mut bundle = EncryptedBundle::default();

    collect_files(&tako_dir, &tako_dir, &mut bundle)?;
    if bundle.files.is_empty() {
        output::warning("No local state to export");
        return Ok(());
    }

    let passphrase = crypto::obtain_passphrase(true)?;
    let sealed = bundle.seal(&passphrase)?;
    std::fs::write(output_path, sealed)
        .with_context(|| format!("Failed to write {}", output_path.display()))?;

    output::success(&format!(
        "Exported {} file(s) of {} to {}",
        bundle.files.len(),
        config.name,
        output_path.display()
    ));
    Ok(())
}

/// `state import`: restore a previously exported state file.
pub async fn import(project_root: &Path, input: &Path) -> Result<()> {
    let sealed = std::fs::read(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let passphrase = crypto::obtain_passphrase(false)?;
    let bundle = EncryptedBundle::unseal(&sealed, &passphrase)?;

    let tako_dir = project_root.join(".tako");
    for path in bundle.files.keys() {
        let content = bundle.get(path)?;
        let dest = tako_dir.join(path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, content)
            .with_context(|| format!("Failed to write {}", dest.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o600))?;
        }
    }

    output::success(&format!("Imported {} file(s)", bundle.files.len()));
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, bundle: &mut EncryptedBundle) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        // The lock is transient; the key file must never leave the machine
        // inside a bundle whose protection it backs.
        if name == ".lock" || name == ".key" {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, bundle)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            let content = std::fs::read(&path)?;
            bundle.insert(&rel, &content);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_skips_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let tako = dir.path().join(".tako");
        std::fs::create_dir_all(tako.join("blog/production/history")).unwrap();
        std::fs::write(tako.join(".lock"), "{}").unwrap();
        std::fs::write(tako.join("secrets"), "API_KEY=x\n").unwrap();
        std::fs::write(
            tako.join("blog/production/history/dep-20240101-000000.json"),
            "{}",
        )
        .unwrap();

        let mut bundle = EncryptedBundle::default();
        collect_files(&tako, &tako, &mut bundle).unwrap();

        assert!(bundle.files.contains_key("secrets"));
        assert!(bundle
            .files
            .contains_key("blog/production/history/dep-20240101-000000.json"));
        assert!(!bundle.files.contains_key(".lock"));
    }
}
