use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TakoError;
use crate::ssh::{transfer, SshClient};

pub const REGISTRY_PATH: &str = "/var/lib/tako/registry.json";

/// What one project publishes into the shared catalog on the manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub environment: String,
    pub network: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub deployed_at: Option<DateTime<Utc>>,
    /// Export name -> in-network address (`service:port`).
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
}

pub type Catalog = BTreeMap<String, RegistryEntry>;

/// Small key-value index on the manager recording which projects and
/// services exist. Consulted when resolving cross-project imports.
pub struct Registry {
    client: Arc<SshClient>,
}

impl Registry {
    pub fn new(client: Arc<SshClient>) -> Self {
        Self { client }
    }

    pub async fn load(&self) -> Result<Catalog> {
        if !self.client.path_exists(REGISTRY_PATH).await? {
            return Ok(Catalog::new());
        }
        let bytes = transfer::download(&self.client, REGISTRY_PATH).await?;
        serde_json::from_slice(&bytes).context("Malformed registry.json on the manager")
    }

    async fn save(&self, catalog: &Catalog) -> Result<()> {
        let mut json =
            serde_json::to_string_pretty(catalog).context("Failed to serialize registry")?;
        json.push('\n');
        transfer::upload(&self.client, REGISTRY_PATH, json.as_bytes())
            .await
            .context("Failed to write registry.json")
    }

    pub async fn update_project(&self, project: &str, entry: RegistryEntry) -> Result<()> {
        let mut catalog = self.load().await?;
        upsert(&mut catalog, project, entry);
        debug!("registry updated for {}", project);
        self.save(&catalog).await
    }

    pub async fn remove_project(&self, project: &str) -> Result<()> {
        let mut catalog = self.load().await?;
        if catalog.remove(project).is_some() {
            self.save(&catalog).await?;
        }
        Ok(())
    }
}

pub fn upsert(catalog: &mut Catalog, project: &str, entry: RegistryEntry) {
    catalog.insert(project.to_string(), entry);
}

pub fn lookup_import(catalog: &Catalog, reference: &str) -> Result<String> {
    let (project, export) = reference.split_once('.').ok_or_else(|| {
        TakoError::Config(format!(
            "import '{}' must have the form project.export",
            reference
        ))
    })?;

    let entry = catalog.get(project).ok_or_else(|| {
        TakoError::Config(format!("import '{}': project '{}' is not deployed", reference, project))
    })?;

    entry.exports.get(export).cloned().ok_or_else(|| {
        TakoError::Config(format!(
            "import '{}': project '{}' exports nothing named '{}'",
            reference, project, export
        ))
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(exports: &[(&str, &str)]) -> RegistryEntry {
        RegistryEntry {
            environment: "production".into(),
            network: "tako_blog_production".into(),
            services: vec!["web".into()],
            domains: vec!["blog.example.com".into()],
            deployed_at: Some(Utc::now()),
            exports: exports
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn upsert_replaces_existing_entry() {
        let mut catalog = Catalog::new();
        upsert(&mut catalog, "blog", entry(&[]));
        upsert(&mut catalog, "blog", entry(&[("db", "postgres:5432")]));

        assert_eq!(catalog.len(), 1);
        assert!(catalog["blog"].exports.contains_key("db"));
    }

    #[test]
    fn import_resolution_happy_path() {
        let mut catalog = Catalog::new();
        upsert(&mut catalog, "shared", entry(&[("db", "postgres:5432")]));

        assert_eq!(
            lookup_import(&catalog, "shared.db").unwrap(),
            "postgres:5432"
        );
    }

    #[test]
    fn import_errors_name_the_missing_part() {
        let mut catalog = Catalog::new();
        upsert(&mut catalog, "shared", entry(&[]));

        assert!(lookup_import(&catalog, "bad-format")
            .unwrap_err()
            .to_string()
            .contains("project.export"));
        assert!(lookup_import(&catalog, "ghost.db")
            .unwrap_err()
            .to_string()
            .contains("not deployed"));
        assert!(lookup_import(&catalog, "shared.db")
            .unwrap_err()
            .to_string()
            .contains("exports nothing"));
    }

    #[test]
    fn registry_wire_format_is_camel_case() {
        let mut catalog = Catalog::new();
        upsert(&mut catalog, "blog", entry(&[]));
        let json = serde_json::to_string(&catalog).unwrap();
        assert!(json.contains("\"deployedAt\""));
        assert!(json.contains("\"blog\""));
    }
}
