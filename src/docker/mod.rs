use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod shell;

pub use shell::ShellDocker;

/// Label namespace stamped on everything tako manages.
pub const LABEL_PROJECT: &str = "tako.project";
pub const LABEL_ENVIRONMENT: &str = "tako.environment";
pub const LABEL_SERVICE: &str = "tako.service";
pub const LABEL_REPLICAS: &str = "tako.replicas";
pub const LABEL_REVISION: &str = "tako.revision";
pub const LABEL_PORT: &str = "tako.port";
pub const LABEL_CONFIG_HASH: &str = "tako.config-hash";

/// A service as observed on the remote runtime, aggregated over its
/// containers (single-host) or read from `docker service ls` (Swarm).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActualService {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_id: String,
    pub running_replicas: u32,
    pub desired_replicas: u32,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub healthy: Option<bool>,
    /// Physical container names backing the service, newest revision first.
    #[serde(default)]
    pub container_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
    /// No health check configured.
    None,
}

impl HealthState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "healthy" => HealthState::Healthy,
            "unhealthy" => HealthState::Unhealthy,
            "starting" => HealthState::Starting,
            _ => HealthState::None,
        }
    }
}

/// Everything needed to run one container of a service.
#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub port: Option<u16>,
    pub health_cmd: Option<String>,
    pub health_interval: u64,
    pub health_retries: u32,
}

/// Everything needed for one `docker service create|update`.
#[derive(Debug, Clone, Default)]
pub struct SwarmServiceRequest {
    pub name: String,
    pub image: String,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub replicas: u32,
    pub constraints: Vec<String>,
    pub placement_prefs: Vec<String>,
    pub port: Option<u16>,
}

/// Narrow capability over the remote container runtime. The SSH shell
/// adapter is the production implementation; tests swap in a fake.
#[allow(async_fn_in_trait)]
pub trait ContainerControl {
    /// Run a shell command on the host (deploy hooks, image builds).
    async fn host_command(&self, cmd: &str) -> Result<String>;
    async fn ensure_network(&self, name: &str) -> Result<()>;
    async fn create_container(&self, req: &ContainerRequest) -> Result<String>;
    async fn start_container(&self, name: &str) -> Result<()>;
    async fn stop_container(&self, name: &str) -> Result<()>;
    async fn remove_container(&self, name: &str) -> Result<()>;
    async fn exec(&self, container: &str, cmd: &str) -> Result<String>;
    async fn container_health(&self, name: &str) -> Result<HealthState>;
    /// HTTP probe from inside the host network, used for public services.
    async fn http_probe(&self, url: &str) -> Result<bool>;
    async fn list_services(&self, project: &str, env: &str) -> Result<Vec<ActualService>>;

    async fn create_service(&self, req: &SwarmServiceRequest) -> Result<()>;
    async fn update_service(&self, req: &SwarmServiceRequest) -> Result<()>;
    async fn scale_service(&self, name: &str, replicas: u32) -> Result<()>;
    async fn remove_service(&self, name: &str) -> Result<()>;
    async fn rollback_service(&self, name: &str) -> Result<()>;
    /// `(running, desired)` replica counts for a Swarm service.
    async fn service_replicas(&self, name: &str) -> Result<(u32, u32)>;
}

/// Quote a string for safe interpolation into a remote shell command.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Build the `docker run -d ...` line for a container request.
pub fn run_command(req: &ContainerRequest) -> String {
    let mut cmd = format!("docker run -d --name {}", req.name);

    if let Some(network) = &req.network {
        cmd.push_str(&format!(" --network {}", network));
    }
    cmd.push_str(" --restart unless-stopped");

    for (key, value) in &req.labels {
        cmd.push_str(&format!(" --label {}", sh_quote(&format!("{}={}", key, value))));
    }
    for (key, value) in &req.env {
        cmd.push_str(&format!(" -e {}", sh_quote(&format!("{}={}", key, value))));
    }
    for volume in &req.volumes {
        cmd.push_str(&format!(" -v {}", sh_quote(volume)));
    }
    if let Some(cmd_line) = &req.health_cmd {
        cmd.push_str(&format!(
            " --health-cmd {} --health-interval {}s --health-retries {}",
            sh_quote(cmd_line),
            req.health_interval,
            req.health_retries
        ));
    }

    cmd.push_str(&format!(" {}", req.image));
    cmd
}

/// Build `docker service create` / `docker service update` for a Swarm
/// request. Updates roll one task at a time and fall back to the previous
/// spec on failure.
pub fn service_command(req: &SwarmServiceRequest, update: bool) -> String {
    let mut cmd = if update {
        format!(
            "docker service update --update-parallelism 1 --update-delay 10s \
             --update-failure-action rollback --image {} --replicas {}",
            req.image, req.replicas
        )
    } else {
        let mut create = format!(
            "docker service create --name {} --replicas {}",
            req.name, req.replicas
        );
        if let Some(network) = &req.network {
            create.push_str(&format!(" --network {}", network));
        }
        if let Some(port) = req.port {
            create.push_str(&format!(" --publish {}", port));
        }
        create
    };

    for (key, value) in &req.labels {
        let flag = if update { "--label-add" } else { "--label" };
        cmd.push_str(&format!(" {} {}", flag, sh_quote(&format!("{}={}", key, value))));
    }
    for (key, value) in &req.env {
        let flag = if update { "--env-add" } else { "--env" };
        cmd.push_str(&format!(" {} {}", flag, sh_quote(&format!("{}={}", key, value))));
    }
    for constraint in &req.constraints {
        let flag = if update { "--constraint-add" } else { "--constraint" };
        cmd.push_str(&format!(" {} {}", flag, sh_quote(constraint)));
    }
    for pref in &req.placement_prefs {
        let flag = if update {
            "--placement-pref-add"
        } else {
            "--placement-pref"
        };
        cmd.push_str(&format!(" {} {}", flag, sh_quote(pref)));
    }

    if update {
        cmd.push_str(&format!(" {}", req.name));
    } else {
        cmd.push_str(&format!(" {}", req.image));
    }
    cmd
}

/// Fold `docker ps` rows (one per container) into per-service observations.
/// Expected row format, tab-separated:
/// name, image, id, service label, replicas label, port label, state.
pub fn parse_container_listing(listing: &str) -> Vec<ActualService> {
    let mut services: BTreeMap<String, ActualService> = BTreeMap::new();

    for line in listing.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 || fields[3].is_empty() {
            continue;
        }
        let (name, image, _id, service) = (fields[0], fields[1], fields[2], fields[3]);
        let desired: u32 = fields.get(4).and_then(|f| f.parse().ok()).unwrap_or(1);
        let port: Option<u16> = fields.get(5).and_then(|f| f.parse().ok());
        let running = fields
            .get(6)
            .map(|state| state.trim() == "running")
            .unwrap_or(true);

        let entry = services
            .entry(service.to_string())
            .or_insert_with(|| ActualService {
                name: service.to_string(),
                image: image.to_string(),
                desired_replicas: desired,
                ports: port.into_iter().collect(),
                ..Default::default()
            });
        if running {
            entry.running_replicas += 1;
        }
        entry.container_names.push(name.to_string());
    }

    // Newest revision first, matching rollout expectations.
    for service in services.values_mut() {
        service.container_names.sort_by(|a, b| b.cmp(a));
    }
    services.into_values().collect()
}

/// Parse `docker service ls` rows: name, image, replicas (`running/desired`).
pub fn parse_service_listing(project: &str, env: &str, listing: &str) -> Vec<ActualService> {
    let prefix = format!("{}_{}_", project, env);
    let mut services = Vec::new();

    for line in listing.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            continue;
        }
        let Some(service) = fields[0].strip_prefix(&prefix) else {
            continue;
        };
        let (running, desired) = match fields[2].split_once('/') {
            Some((r, d)) => (
                r.trim().parse().unwrap_or(0),
                d.trim().parse().unwrap_or(0),
            ),
            None => (0, 0),
        };

        services.push(ActualService {
            name: service.to_string(),
            image: fields[1].to_string(),
            running_replicas: running,
            desired_replicas: desired,
            ..Default::default()
        });
    }

    services.sort_by(|a, b| a.name.cmp(&b.name));
    services
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_embedded_quotes() {
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote("plain"), "'plain'");
    }

    #[test]
    fn run_command_carries_env_labels_and_health() {
        let req = ContainerRequest {
            name: "blog_production_web_4".into(),
            image: "nginx:1.27".into(),
            network: Some("tako_blog_production".into()),
            env: [("PORT".to_string(), "8080".to_string())].into_iter().collect(),
            labels: [(LABEL_SERVICE.to_string(), "web".to_string())]
                .into_iter()
                .collect(),
            volumes: vec!["data:/var/lib/data".into()],
            port: Some(8080),
            health_cmd: Some("curl -f http://localhost:8080/health".into()),
            health_interval: 5,
            health_retries: 3,
        };

        let cmd = run_command(&req);
        assert!(cmd.starts_with("docker run -d --name blog_production_web_4"));
        assert!(cmd.contains("--network tako_blog_production"));
        assert!(cmd.contains("-e 'PORT=8080'"));
        assert!(cmd.contains("--label 'tako.service=web'"));
        assert!(cmd.contains("-v 'data:/var/lib/data'"));
        assert!(cmd.contains("--health-cmd"));
        assert!(cmd.contains("--health-interval 5s"));
        assert!(cmd.ends_with(" nginx:1.27"));
    }

    #[test]
    fn service_create_and_update_use_matching_flags() {
        let req = SwarmServiceRequest {
            name: "blog_production_api".into(),
            image: "blog/api:9f8e7d6".into(),
            network: Some("tako_blog_production".into()),
            replicas: 3,
            constraints: vec!["node.hostname==vps2".into()],
            placement_prefs: vec![],
            ..Default::default()
        };

        let create = service_command(&req, false);
        assert!(create.starts_with("docker service create --name blog_production_api"));
        assert!(create.contains("--replicas 3"));
        assert!(create.contains("--constraint 'node.hostname==vps2'"));
        assert!(create.ends_with(" blog/api:9f8e7d6"));

        let update = service_command(&req, true);
        assert!(update.starts_with("docker service update"));
        assert!(update.contains("--update-parallelism 1"));
        assert!(update.contains("--update-delay 10s"));
        assert!(update.contains("--update-failure-action rollback"));
        assert!(update.contains("--constraint-add"));
        assert!(update.ends_with(" blog_production_api"));
    }

    #[test]
    fn container_listing_folds_replicas() {
        let listing = "blog_production_web_4\tnginx:1.27\taaa\tweb\t2\t8080\trunning\n\
                       blog_production_web_4b\tnginx:1.27\tbbb\tweb\t2\t8080\trunning\n\
                       blog_production_api_2\tblog/api:9f8\tccc\tapi\t1\t\texited\n";
        let services = parse_container_listing(listing);

        assert_eq!(services.len(), 2);
        let api = services.iter().find(|s| s.name == "api").unwrap();
        assert_eq!(api.running_replicas, 0);
        assert_eq!(api.desired_replicas, 1);

        let web = services.iter().find(|s| s.name == "web").unwrap();
        assert_eq!(web.running_replicas, 2);
        assert_eq!(web.ports, vec![8080]);
    }

    #[test]
    fn service_listing_filters_by_project_prefix() {
        let listing = "blog_production_web\tnginx:1.27\t2/2\n\
                       other_production_api\timg:1\t1/1\n\
                       blog_production_api\tblog/api:9f8\t0/3\n";
        let services = parse_service_listing("blog", "production", listing);

        assert_eq!(services.len(), 2);
        assert_eq!(services[0].name, "api");
        assert_eq!(services[0].running_replicas, 0);
        assert_eq!(services[0].desired_replicas, 3);
        assert_eq!(services[1].name, "web");
    }

    #[test]
    fn health_state_parses_docker_inspect_output() {
        assert_eq!(HealthState::parse("healthy\n"), HealthState::Healthy);
        assert_eq!(HealthState::parse("starting"), HealthState::Starting);
        assert_eq!(HealthState::parse("<nil>"), HealthState::None);
    }
}
