use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;

use crate::config::{Environment, ProjectConfig, ServiceSpec};
use crate::docker;
use crate::reconcile::config_hash;
use crate::state::GitInfo;

/// Everything a rollout needs to know about where it is deploying.
pub struct DeployContext {
    pub config: ProjectConfig,
    pub env_name: String,
    pub environment: Environment,
    pub project_root: PathBuf,
    /// Secret store for this environment, loaded once per run.
    pub secrets: BTreeMap<String, String>,
    pub git: Option<GitInfo>,
}

impl DeployContext {
    pub fn new(
        config: ProjectConfig,
        env_name: &str,
        project_root: PathBuf,
        secrets: BTreeMap<String, String>,
    ) -> Result<Self> {
        let environment = config.environment(env_name)?.clone();
        let git = GitInfo::detect(&project_root);
        Ok(Self {
            config,
            env_name: env_name.to_string(),
            environment,
            project_root,
            secrets,
            git,
        })
    }

    pub fn project(&self) -> &str {
        &self.config.name
    }

    /// Docker network all services of this environment share.
    pub fn network_name(&self) -> String {
        format!("tako_{}_{}", self.config.name, self.env_name)
    }

    /// Physical container name for one revision of a service. Replica
    /// indexes beyond the first get an `_rN` suffix.
    pub fn container_name(&self, service: &str, revision: u32, replica: u32) -> String {
        let base = format!("{}_{}_{}_{}", self.config.name, self.env_name, service, revision);
        if replica <= 1 {
            base
        } else {
            format!("{}_r{}", base, replica)
        }
    }

    /// Swarm service name (one logical name per service, no revisions).
    pub fn swarm_service_name(&self, service: &str) -> String {
        format!("{}_{}_{}", self.config.name, self.env_name, service)
    }

    /// Image tag for built services: `<project>/<service>:<shortCommit>`.
    pub fn image_tag(&self, service: &str) -> String {
        let tag = self
            .git
            .as_ref()
            .map(|g| g.short_hash.clone())
            .unwrap_or_else(|| "latest".to_string());
        format!("{}/{}:{}", self.config.name, service, tag)
    }

    /// Resolved image reference for a service: configured image, or the
    /// build tag.
    pub fn image_for(&self, service: &str, spec: &ServiceSpec) -> String {
        spec.image
            .clone()
            .unwrap_or_else(|| self.image_tag(service))
    }

    /// Remote artifacts directory (`/opt/<project>`).
    pub fn artifacts_path(&self) -> String {
        format!("/opt/{}", self.config.name)
    }

    /// Production labels stamped on containers and services.
    pub fn labels_for(&self, service: &str, spec: &ServiceSpec, revision: u32) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(docker::LABEL_PROJECT.to_string(), self.config.name.clone());
        labels.insert(docker::LABEL_ENVIRONMENT.to_string(), self.env_name.clone());
        labels.insert(docker::LABEL_SERVICE.to_string(), service.to_string());
        labels.insert(docker::LABEL_REPLICAS.to_string(), spec.replicas.to_string());
        labels.insert(docker::LABEL_REVISION.to_string(), revision.to_string());
        labels.insert(docker::LABEL_CONFIG_HASH.to_string(), config_hash(spec));
        if let Some(port) = spec.port {
            labels.insert(docker::LABEL_PORT.to_string(), port.to_string());
        }

        if let Some(proxy) = &spec.proxy {
            if !proxy.domains.is_empty() {
                let router = format!("{}-{}-{}", self.config.name, self.env_name, service);
                // redirectFrom hosts resolve on the same router; the proxy
                // issues the redirect.
                let rule = proxy
                    .domains
                    .iter()
                    .chain(proxy.redirect_from.iter())
                    .map(|d| format!("Host(`{}`)", d))
                    .collect::<Vec<_>>()
                    .join(" || ");
                labels.insert("traefik.enable".to_string(), "true".to_string());
                labels.insert(
                    format!("traefik.http.routers.{}.rule", router),
                    rule,
                );
                // New revisions outrank the previous one as soon as they
                // are healthy.
                labels.insert(
                    format!("traefik.http.routers.{}-{}.priority", router, revision),
                    "100".to_string(),
                );
                if let Some(port) = spec.port {
                    labels.insert(
                        format!("traefik.http.services.{}.loadbalancer.server.port", router),
                        port.to_string(),
                    );
                }
            }
        }

        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> DeployContext {
        let config: ProjectConfig = serde_yaml::from_str(
            r#"
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
        port: 8080
        proxy:
          domains: [blog.example.com]
"#,
        )
        .unwrap();
        DeployContext::new(config, "production", PathBuf::from("/tmp"), BTreeMap::new()).unwrap()
    }

    #[test]
    fn names_follow_the_project_env_service_scheme() {
        let ctx = context();
        assert_eq!(ctx.network_name(), "tako_blog_production");
        assert_eq!(ctx.container_name("web", 4, 1), "blog_production_web_4");
        assert_eq!(ctx.container_name("web", 4, 3), "blog_production_web_4_r3");
        assert_eq!(ctx.swarm_service_name("web"), "blog_production_web");
        assert_eq!(ctx.artifacts_path(), "/opt/blog");
    }

    #[test]
    fn labels_carry_identity_and_proxy_rule() {
        let ctx = context();
        let spec = ctx.environment.services["web"].clone();
        let labels = ctx.labels_for("web", &spec, 4);

        assert_eq!(labels[docker::LABEL_PROJECT], "blog");
        assert_eq!(labels[docker::LABEL_SERVICE], "web");
        assert_eq!(labels[docker::LABEL_REVISION], "4");
        assert_eq!(labels["traefik.enable"], "true");
        assert_eq!(
            labels["traefik.http.routers.blog-production-web.rule"],
            "Host(`blog.example.com`)"
        );
        assert_eq!(
            labels["traefik.http.routers.blog-production-web-4.priority"],
            "100"
        );
        assert_eq!(
            labels["traefik.http.services.blog-production-web.loadbalancer.server.port"],
            "8080"
        );
    }

    #[test]
    fn internal_services_get_no_proxy_labels() {
        let ctx = context();
        let spec = ServiceSpec {
            image: Some("redis:7".into()),
            ..Default::default()
        };
        let labels = ctx.labels_for("cache", &spec, 1);
        assert!(!labels.contains_key("traefik.enable"));
    }

    #[test]
    fn built_services_tag_with_short_commit_or_latest() {
        let mut ctx = context();
        ctx.git = None;
        let spec = ServiceSpec {
            build: Some(".".into()),
            ..Default::default()
        };
        assert_eq!(ctx.image_for("api", &spec), "blog/api:latest");

        ctx.git = Some(GitInfo {
            commit: "9f8e7d6aaaa".into(),
            short_hash: "9f8e7d6".into(),
            branch: "main".into(),
            message: "ship".into(),
            author: "dev".into(),
        });
        assert_eq!(ctx.image_for("api", &spec), "blog/api:9f8e7d6");
    }
}
