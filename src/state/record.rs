use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Success,
    Failed,
    RolledBack,
    /// Synthesized from running containers when no history survived.
    Recovered,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Recovered => "recovered",
        }
    }
}

/// One rollout attempt, append-only per project. Terminal records are never
/// rewritten, except that a rollback flips its target's status to
/// `rolled_back` in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub project_name: String,
    pub version: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSnapshot>,
    pub user: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitInfo>,
    /// Seconds.
    #[serde(default)]
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Manager host this copy was replicated from, set on worker copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl DeploymentRecord {
    /// Ids sort by creation: `dep-YYYYMMDD-HHMMSS`.
    pub fn id_for(at: DateTime<Utc>) -> String {
        format!("dep-{}", at.format("%Y%m%d-%H%M%S"))
    }

    /// Open a new in-progress record for a rollout attempt.
    pub fn begin(project: &str, version: &str, manager_host: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for(now),
            timestamp: now,
            project_name: project.to_string(),
            version: version.to_string(),
            status: DeploymentStatus::InProgress,
            services: BTreeMap::new(),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            host: manager_host.to_string(),
            git: None,
            duration: 0.0,
            error: None,
            message: None,
            source: None,
        }
    }

    /// A record is schema-valid for recovery purposes when it parsed and
    /// carries a usable identity.
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.project_name.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub replicas: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub health_check: HealthSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub commit: String,
    pub short_hash: String,
    pub branch: String,
    pub message: String,
    pub author: String,
}

impl GitInfo {
    /// Read HEAD metadata from the project checkout, if it is a git repo.
    pub fn detect(project_root: &Path) -> Option<Self> {
        let git = |args: &[&str]| -> Option<String> {
            let out = Command::new("git")
                .args(args)
                .current_dir(project_root)
                .output()
                .ok()?;
            if !out.status.success() {
                return None;
            }
            Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
        };

        let commit = git(&["rev-parse", "HEAD"])?;
        Some(Self {
            short_hash: commit.chars().take(7).collect(),
            commit,
            branch: git(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_default(),
            message: git(&["log", "-1", "--pretty=%s"]).unwrap_or_default(),
            author: git(&["log", "-1", "--pretty=%an"]).unwrap_or_default(),
        })
    }
}

/// Filters for history listings.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub status: Option<DeploymentStatus>,
}

/// History cap: keep the most recent N successful records plus every failed
/// one inside the window.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub keep_successful: usize,
    pub failed_window: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_successful: 20,
            failed_window: Duration::days(30),
        }
    }
}

impl RetentionPolicy {
    /// Ids to delete from `records` (any order) as of `now`. In-progress
    /// and recovered records are never pruned.
    pub fn prune_ids(&self, records: &[DeploymentRecord], now: DateTime<Utc>) -> Vec<String> {
        let mut successful: Vec<&DeploymentRecord> = records
            .iter()
            .filter(|r| r.status == DeploymentStatus::Success)
            .collect();
        successful.sort_by(|a, b| b.id.cmp(&a.id));

        let mut doomed: Vec<String> = successful
            .iter()
            .skip(self.keep_successful)
            .map(|r| r.id.clone())
            .collect();

        for record in records {
            let aged_out = now - record.timestamp > self.failed_window;
            if matches!(
                record.status,
                DeploymentStatus::Failed | DeploymentStatus::RolledBack
            ) && aged_out
            {
                doomed.push(record.id.clone());
            }
        }

        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, status: DeploymentStatus, age_days: i64) -> DeploymentRecord {
        let mut r = DeploymentRecord::begin("blog", "1", "m1");
        r.id = id.to_string();
        r.status = status;
        r.timestamp = Utc::now() - Duration::days(age_days);
        r
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let early = DeploymentRecord::id_for("2024-01-01T00:00:00Z".parse().unwrap());
        let later = DeploymentRecord::id_for("2024-06-30T23:59:59Z".parse().unwrap());
        assert_eq!(early, "dep-20240101-000000");
        assert!(early < later);
    }

    #[test]
    fn wire_format_uses_camel_case_names() {
        let mut r = record("dep-20240101-000000", DeploymentStatus::Success, 0);
        r.services.insert(
            "web".into(),
            ServiceSnapshot {
                name: "web".into(),
                image: "nginx:1".into(),
                replicas: 2,
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"projectName\":\"blog\""));
        assert!(json.contains("\"status\":\"success\""));
        assert!(json.contains("\"healthCheck\""));

        let back: DeploymentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.services["web"].replicas, 2);
    }

    #[test]
    fn retention_keeps_recent_successful_and_windowed_failures() {
        let policy = RetentionPolicy {
            keep_successful: 2,
            failed_window: Duration::days(30),
        };
        let records = vec![
            record("dep-20240103-000000", DeploymentStatus::Success, 1),
            record("dep-20240102-000000", DeploymentStatus::Success, 2),
            record("dep-20240101-000000", DeploymentStatus::Success, 3),
            record("dep-20231201-000000", DeploymentStatus::Failed, 40),
            record("dep-20240104-000000", DeploymentStatus::Failed, 0),
        ];

        let doomed = policy.prune_ids(&records, Utc::now());
        assert!(doomed.contains(&"dep-20240101-000000".to_string()));
        assert!(doomed.contains(&"dep-20231201-000000".to_string()));
        assert!(!doomed.contains(&"dep-20240104-000000".to_string()));
        assert_eq!(doomed.len(), 2);
    }

    #[test]
    fn in_progress_records_are_never_pruned() {
        let policy = RetentionPolicy {
            keep_successful: 0,
            failed_window: Duration::days(0),
        };
        let records = vec![record("dep-20240101-000000", DeploymentStatus::InProgress, 90)];
        assert!(policy.prune_ids(&records, Utc::now()).is_empty());
    }
}
