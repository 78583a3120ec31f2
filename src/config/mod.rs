use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::TakoError;

mod resolve;
mod validate;

pub use resolve::{load_dotenv, parse_dotenv, resolve_vars, serialize_dotenv};

/// Top-level project description, loaded from `tako.yaml` or `tako.json`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub servers: HashMap<String, ServerSpec>,
    pub environments: HashMap<String, Environment>,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub key_file: Option<PathBuf>,
    pub password: Option<String>,
    pub role: Option<ServerRole>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Manager,
    Worker,
}

/// One deployable environment: an ordered list of server names plus the
/// services that run there.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Environment {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub image: Option<String>,
    /// Build context directory, mutually exclusive with `image`.
    pub build: Option<String>,
    pub port: Option<u16>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Secret names, either `KEY` or `KEY:SOURCE` alias form.
    #[serde(default)]
    pub secrets: Vec<String>,
    /// `host:container` or `name:container` mounts.
    #[serde(default)]
    pub volumes: Vec<String>,
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub hooks: Hooks,
    pub proxy: Option<ProxySpec>,
    pub placement: Option<PlacementSpec>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    pub export: Option<String>,
    pub monitoring: Option<MonitoringSpec>,
}

fn default_replicas() -> u32 {
    1
}

impl ServiceSpec {
    /// A service is public iff it has a proxy with at least one domain.
    pub fn is_public(&self) -> bool {
        self.proxy
            .as_ref()
            .map(|p| !p.domains.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Seconds between probes.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            retries: default_health_retries(),
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}
fn default_health_interval() -> u64 {
    5
}
fn default_health_timeout() -> u64 {
    5
}
fn default_health_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default)]
    pub pre_build: Vec<String>,
    #[serde(default)]
    pub post_build: Vec<String>,
    #[serde(default)]
    pub pre_deploy: Vec<String>,
    #[serde(default)]
    pub post_deploy: Vec<String>,
    /// Run inside the new container after it goes live.
    #[serde(default)]
    pub post_start: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    #[serde(default)]
    pub domains: Vec<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub redirect_from: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    #[serde(default)]
    pub strategy: PlacementStrategy,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementStrategy {
    #[default]
    Spread,
    Pinned,
    Any,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval")]
    pub interval: u64,
    pub webhook: Option<String>,
}

fn default_monitor_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default)]
    pub strategy: DeployStrategy,
    #[serde(default = "default_concurrent_builds")]
    pub max_concurrent_builds: usize,
    #[serde(default = "default_concurrent_deploys")]
    pub max_concurrent_deploys: usize,
    #[serde(default = "default_cache")]
    pub cache: bool,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            strategy: DeployStrategy::default(),
            max_concurrent_builds: default_concurrent_builds(),
            max_concurrent_deploys: default_concurrent_deploys(),
            cache: default_cache(),
        }
    }
}

fn default_concurrent_builds() -> usize {
    2
}
fn default_concurrent_deploys() -> usize {
    2
}
fn default_cache() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotificationsConfig {
    pub slack: Option<String>,
    pub discord: Option<String>,
    pub webhook: Option<String>,
}

impl NotificationsConfig {
    pub fn is_empty(&self) -> bool {
        self.slack.is_none() && self.discord.is_none() && self.webhook.is_none()
    }
}

/// Config file names probed, in order, when `--config` is not given.
const DISCOVERY_ORDER: [&str; 2] = ["tako.yaml", "tako.json"];

impl ProjectConfig {
    /// Load and validate a config. `path` of `None` discovers `tako.yaml`
    /// then `tako.json` in the current directory. `${NAME}` references are
    /// substituted from the process environment and `.env` before parsing.
    pub fn load(path: Option<&Path>, project_root: &Path) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::discover(project_root)?,
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let dotenv = load_dotenv(project_root)?;
        let resolved = resolve_vars(&raw, &|name| {
            std::env::var(name).ok().or_else(|| dotenv.get(name).cloned())
        })?;

        let config: Self = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&resolved)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            serde_yaml::from_str(&resolved)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        };

        validate::validate(&config)?;

        Ok(config)
    }

    fn discover(project_root: &Path) -> Result<PathBuf> {
        for name in DISCOVERY_ORDER {
            let candidate = project_root.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(TakoError::Config(format!(
            "no tako.yaml or tako.json found in {}",
            project_root.display()
        ))
        .into())
    }

    pub fn environment(&self, name: &str) -> Result<&Environment> {
        self.environments.get(name).ok_or_else(|| {
            TakoError::Config(format!("environment '{}' not found in config", name)).into()
        })
    }

    pub fn server(&self, name: &str) -> Result<&ServerSpec> {
        self.servers.get(name).ok_or_else(|| {
            TakoError::Config(format!("server '{}' not found in config", name)).into()
        })
    }

    /// The manager host of an environment: the first listed server with the
    /// manager role, falling back to the first listed server.
    pub fn manager(&self, env: &Environment) -> Result<&ServerSpec> {
        let mut first = None;
        for name in &env.servers {
            let spec = self.server(name)?;
            if first.is_none() {
                first = Some(spec);
            }
            if spec.role == Some(ServerRole::Manager) {
                return Ok(spec);
            }
        }
        first.ok_or_else(|| TakoError::Config("environment has no servers".into()).into())
    }

    /// Worker hosts of an environment, i.e. every listed server that is not
    /// the manager.
    pub fn workers(&self, env: &Environment) -> Result<Vec<&ServerSpec>> {
        let manager_host = self.manager(env)?.host.clone();
        let mut out = Vec::new();
        for name in &env.servers {
            let spec = self.server(name)?;
            if spec.host != manager_host {
                out.push(spec);
            }
        }
        Ok(out)
    }

    /// Multi-host environments deploy through Swarm.
    pub fn is_multi_host(&self, env: &Environment) -> bool {
        env.servers.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: blog
servers:
  vps1:
    host: 203.0.113.10
    user: deploy
environments:
  production:
    servers: [vps1]
    services:
      web:
        image: nginx:1.27
        port: 80
        replicas: 2
"#;

    fn write_config(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_minimal_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "tako.yaml", MINIMAL);

        let config = ProjectConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.name, "blog");
        assert_eq!(config.servers["vps1"].port, 22);

        let env = config.environment("production").unwrap();
        let web = &env.services["web"];
        assert_eq!(web.image.as_deref(), Some("nginx:1.27"));
        assert_eq!(web.replicas, 2);
        assert!(!web.is_public());
    }

    #[test]
    fn json_config_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "name": "blog",
            "servers": {"vps1": {"host": "203.0.113.10", "user": "deploy"}},
            "environments": {
                "production": {
                    "servers": ["vps1"],
                    "services": {"web": {"image": "nginx:1.27"}}
                }
            }
        });
        write_config(dir.path(), "tako.json", &json.to_string());

        let config = ProjectConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.environments["production"].services["web"].replicas, 1);
    }

    #[test]
    fn yaml_takes_precedence_over_json() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "tako.yaml", MINIMAL);
        write_config(dir.path(), "tako.json", "{\"name\": \"other\"}");

        let config = ProjectConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.name, "blog");
    }

    #[test]
    fn dotenv_vars_are_substituted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "APP_HOST=203.0.113.99\n").unwrap();
        write_config(
            dir.path(),
            "tako.yaml",
            r#"
name: blog
servers:
  vps1:
    host: ${APP_HOST}
    user: deploy
environments:
  production:
    servers: [vps1]
    services:
      web:
        image: nginx:1.27
"#,
        );

        let config = ProjectConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.servers["vps1"].host, "203.0.113.99");
    }

    #[test]
    fn unknown_var_reference_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "tako.yaml",
            "name: ${NO_SUCH_VAR_SET_ANYWHERE}\nservers: {}\nenvironments: {}\n",
        );

        let err = ProjectConfig::load(None, dir.path()).unwrap_err();
        assert!(err.to_string().contains("NO_SUCH_VAR_SET_ANYWHERE"));
    }

    #[test]
    fn manager_prefers_role_over_order() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "tako.yaml",
            r#"
name: blog
servers:
  a:
    host: 10.0.0.1
    user: deploy
    role: worker
  b:
    host: 10.0.0.2
    user: deploy
    role: manager
environments:
  production:
    servers: [a, b]
    services:
      web:
        image: nginx:1.27
"#,
        );

        let config = ProjectConfig::load(None, dir.path()).unwrap();
        let env = config.environment("production").unwrap();
        assert_eq!(config.manager(env).unwrap().host, "10.0.0.2");
        let workers: Vec<_> = config.workers(env).unwrap().iter().map(|s| s.host.clone()).collect();
        assert_eq!(workers, vec!["10.0.0.1".to_string()]);
    }
}
