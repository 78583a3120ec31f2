use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::ProjectConfig;
use crate::crypto::{self, EncryptedBundle};
use crate::output;
use crate::runtime::Runtime;
use crate::ssh::{transfer, SshPool};
use crate::state::REMOTE_STATE_ROOT;

fn bundle_path(project: &str) -> String {
    format!("{}/{}/env.enc", REMOTE_STATE_ROOT, project)
}

/// Files that make up the environment bundle, relative to the project root.
fn bundle_candidates(env_name: &str) -> Vec<String> {
    vec![
        ".env".to_string(),
        format!(".env.{}", env_name),
        ".tako/secrets".to_string(),
        format!(".tako/secrets.{}", env_name),
    ]
}

/// `env push`: seal the local env files and store the bundle on the
/// manager.
pub async fn push(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: &Path,
) -> Result<()> {
    let mut bundle = EncryptedBundle::default();
    for candidate in bundle_candidates(env_name) {
        let path = project_root.join(&candidate);
        if path.exists() {
            let content = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            bundle.insert(&candidate, &content);
        }
    }

    if bundle.files.is_empty() {
        output::warning("No env files found to push");
        return Ok(());
    }

    let passphrase = crypto::obtain_passphrase(true)?;
    let sealed = bundle.seal(&passphrase)?;

    let env = config.environment(env_name)?;
    let pool = SshPool::new(runtime);
    let manager = pool.get_or_create(config.manager(env)?).await?;

    transfer::upload(&manager, &bundle_path(&config.name), &sealed).await?;
    output::success(&format!(
        "Pushed {} file(s) to {}",
        bundle.files.len(),
        bundle_path(&config.name)
    ));

    pool.close_all().await;
    Ok(())
}

/// `env pull`: fetch and decrypt the bundle, restoring the files locally
/// with 0600 permissions.
pub async fn pull(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: &Path,
) -> Result<()> {
    let env = config.environment(env_name)?;
    let pool = SshPool::new(runtime);
    let manager = pool.get_or_create(config.manager(env)?).await?;

    let remote_path = bundle_path(&config.name);
    if !manager.path_exists(&remote_path).await? {
        output::warning(&format!("No bundle at {} on the manager", remote_path));
        pool.close_all().await;
        return Ok(());
    }

    let sealed = transfer::download(&manager, &remote_path).await?;
    pool.close_all().await;

    let passphrase = crypto::obtain_passphrase(false)?;
    let bundle = EncryptedBundle::unseal(&sealed, &passphrase)?;

    for path in bundle.files.keys() {
        let content = bundle.get(path)?;
        let dest = project_root.join(path);
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
        output::success(&format!("Restored {}", path));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_covers_project_and_env_scoped_files() {
        let candidates = bundle_candidates("staging");
        assert!(candidates.contains(&".env".to_string()));
        assert!(candidates.contains(&".env.staging".to_string()));
        assert!(candidates.contains(&".tako/secrets".to_string()));
        assert!(candidates.contains(&".tako/secrets.staging".to_string()));
    }

    #[test]
    fn bundle_path_is_under_the_project_state_root() {
        assert_eq!(bundle_path("blog"), "/var/lib/tako/blog/env.enc");
    }
}
