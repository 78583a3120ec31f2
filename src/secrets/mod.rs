use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{parse_dotenv, serialize_dotenv, ServiceSpec};
use crate::error::TakoError;

/// Project-wide secrets file: `.tako/secrets`.
pub fn secrets_path(tako_dir: &Path) -> PathBuf {
    tako_dir.join("secrets")
}

/// Environment-scoped overrides: `.tako/secrets.<env>`.
pub fn env_secrets_path(tako_dir: &Path, env: &str) -> PathBuf {
    tako_dir.join(format!("secrets.{}", env))
}

fn read_kv(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read secrets file: {}", path.display()))?;
    Ok(parse_dotenv(&content))
}

/// Load the secret store for an environment: project-wide values overlaid
/// with environment-scoped ones.
pub fn load(tako_dir: &Path, env: &str) -> Result<BTreeMap<String, String>> {
    let mut secrets = read_kv(&secrets_path(tako_dir))?;
    secrets.extend(read_kv(&env_secrets_path(tako_dir, env))?);
    Ok(secrets)
}

/// Write a secrets file with 0600 permissions.
pub fn write(path: &Path, secrets: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, serialize_dotenv(secrets))
        .with_context(|| format!("Failed to write secrets file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set secrets file permissions")?;
    }
    Ok(())
}

/// Compose the container environment for a service: config `env`, then the
/// requested secrets. `KEY` pulls the secret verbatim; `KEY:SOURCE` exposes
/// the value of secret `SOURCE` under the name `KEY`. Secrets never touch
/// remote disk; the composed map flows through the create command.
pub fn compose_environment(
    spec: &ServiceSpec,
    store: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut env = spec.env.clone();

    for entry in &spec.secrets {
        let (name, source) = match entry.split_once(':') {
            Some((name, source)) => (name, source),
            None => (entry.as_str(), entry.as_str()),
        };
        let value = store.get(source).ok_or_else(|| {
            TakoError::Config(format!(
                "secret '{}' not found in the secret store",
                source
            ))
        })?;
        env.insert(name.to_string(), value.clone());
    }

    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(env: &[(&str, &str)], secrets: &[&str]) -> ServiceSpec {
        ServiceSpec {
            image: Some("nginx:1".into()),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            secrets: secrets.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn env_overlay_order_is_project_then_environment() {
        let dir = tempfile::tempdir().unwrap();
        let base: BTreeMap<String, String> = [
            ("SHARED".to_string(), "base".to_string()),
            ("ONLY_BASE".to_string(), "1".to_string()),
        ]
        .into_iter()
        .collect();
        let prod: BTreeMap<String, String> =
            [("SHARED".to_string(), "prod".to_string())].into_iter().collect();

        write(&secrets_path(dir.path()), &base).unwrap();
        write(&env_secrets_path(dir.path(), "production"), &prod).unwrap();

        let merged = load(dir.path(), "production").unwrap();
        assert_eq!(merged["SHARED"], "prod");
        assert_eq!(merged["ONLY_BASE"], "1");
    }

    #[test]
    fn plain_secret_keeps_its_name() {
        let store: BTreeMap<String, String> =
            [("API_KEY".to_string(), "hunter2".to_string())].into_iter().collect();
        let env = compose_environment(&spec_with(&[], &["API_KEY"]), &store).unwrap();
        assert_eq!(env["API_KEY"], "hunter2");
    }

    #[test]
    fn alias_maps_source_to_new_name() {
        let store: BTreeMap<String, String> =
            [("STRIPE_KEY".to_string(), "sk_live".to_string())].into_iter().collect();
        let env = compose_environment(&spec_with(&[], &["API_KEY:STRIPE_KEY"]), &store).unwrap();
        assert_eq!(env["API_KEY"], "sk_live");
        assert!(!env.contains_key("STRIPE_KEY"));
    }

    #[test]
    fn secrets_override_config_env() {
        let store: BTreeMap<String, String> =
            [("PORT".to_string(), "9000".to_string())].into_iter().collect();
        let env =
            compose_environment(&spec_with(&[("PORT", "8080")], &["PORT"]), &store).unwrap();
        assert_eq!(env["PORT"], "9000");
    }

    #[test]
    fn missing_secret_fails() {
        let err =
            compose_environment(&spec_with(&[], &["NOPE"]), &BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[cfg(unix)]
    #[test]
    fn secret_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        write(&secrets_path(dir.path()), &BTreeMap::new()).unwrap();
        let mode = fs::metadata(secrets_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
