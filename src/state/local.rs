use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;

use crate::error::TakoError;

use super::record::{DeploymentRecord, DeploymentStatus, ListOptions, RetentionPolicy};
use super::History;

/// Per-project/env history on the operator workstation:
/// `.tako/<project>/<env>/history/<id>.json`.
pub struct LocalStateStore {
    history_dir: PathBuf,
    log_path: PathBuf,
    retention: RetentionPolicy,
}

impl LocalStateStore {
    pub fn open(tako_dir: &Path, project: &str, env: &str) -> Result<Self> {
        let env_dir = tako_dir.join(project).join(env);
        let history_dir = env_dir.join("history");
        fs::create_dir_all(&history_dir)
            .with_context(|| format!("Failed to create {}", history_dir.display()))?;

        Ok(Self {
            history_dir,
            log_path: env_dir.join("deployments.log"),
            retention: RetentionPolicy::default(),
        })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.history_dir.join(format!("{}.json", id))
    }

    fn read_record(&self, path: &Path) -> Result<DeploymentRecord> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Malformed deployment record {}", path.display()))
    }

    fn all_records(&self) -> Result<Vec<DeploymentRecord>> {
        let mut ids: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.history_dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        // Record ids sort by creation; newest first.
        ids.sort_by(|a, b| b.cmp(a));

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            records.push(self.read_record(&self.record_path(&id))?);
        }
        Ok(records)
    }
}

impl History for LocalStateStore {
    /// Write via temp file + rename so readers never observe a torn record.
    async fn save(&self, record: &DeploymentRecord) -> Result<()> {
        if record.status == DeploymentStatus::InProgress {
            if let Some(active) = self.current().await? {
                if active.status == DeploymentStatus::InProgress && active.id != record.id {
                    return Err(TakoError::StateLocked {
                        holder: format!("deployment {}", active.id),
                        since: active.timestamp,
                    }
                    .into());
                }
            }
        }

        let json = serde_json::to_string_pretty(record)? + "\n";
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move record into place: {}", path.display()))?;

        debug!("saved local record {}", record.id);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<DeploymentRecord> {
        self.read_record(&self.record_path(id))
    }

    async fn latest_successful(&self) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .all_records()?
            .into_iter()
            .find(|r| r.status == DeploymentStatus::Success))
    }

    async fn list(&self, opts: &ListOptions) -> Result<Vec<DeploymentRecord>> {
        let mut records = self.all_records()?;
        if let Some(status) = opts.status {
            records.retain(|r| r.status == status);
        }
        if let Some(limit) = opts.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// The in-progress record if one exists, otherwise the newest one.
    async fn current(&self) -> Result<Option<DeploymentRecord>> {
        let records = self.all_records()?;
        if let Some(active) = records
            .iter()
            .find(|r| r.status == DeploymentStatus::InProgress)
        {
            return Ok(Some(active.clone()));
        }
        Ok(records.into_iter().next())
    }

    async fn cleanup_old(&self) -> Result<usize> {
        let records = self.all_records()?;
        let doomed = self.retention.prune_ids(&records, Utc::now());
        for id in &doomed {
            fs::remove_file(self.record_path(id))
                .with_context(|| format!("Failed to remove record {}", id))?;
        }
        Ok(doomed.len())
    }

    async fn log_deployment(&self, message: &str) -> Result<()> {
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open {}", self.log_path.display()))?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStateStore::open(dir.path(), "blog", "production").unwrap();
        (dir, store)
    }

    fn record(id: &str, status: DeploymentStatus) -> DeploymentRecord {
        let mut r = DeploymentRecord::begin("blog", "1", "m1");
        r.id = id.to_string();
        r.status = status;
        r
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let (_dir, store) = store();
        let r = record("dep-20240101-000000", DeploymentStatus::Success);
        store.save(&r).await.unwrap();

        let loaded = store.load("dep-20240101-000000").await.unwrap();
        assert_eq!(loaded.project_name, "blog");
        assert_eq!(loaded.status, DeploymentStatus::Success);
    }

    #[tokio::test]
    async fn list_is_id_descending_and_filterable() {
        let (_dir, store) = store();
        store
            .save(&record("dep-20240101-000000", DeploymentStatus::Success))
            .await
            .unwrap();
        store
            .save(&record("dep-20240102-000000", DeploymentStatus::Failed))
            .await
            .unwrap();
        store
            .save(&record("dep-20240103-000000", DeploymentStatus::Success))
            .await
            .unwrap();

        let all = store.list(&ListOptions::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "dep-20240103-000000",
                "dep-20240102-000000",
                "dep-20240101-000000"
            ]
        );

        let failed = store
            .list(&ListOptions {
                status: Some(DeploymentStatus::Failed),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "dep-20240102-000000");
    }

    #[tokio::test]
    async fn at_most_one_in_progress_record() {
        let (_dir, store) = store();
        store
            .save(&record("dep-20240101-000000", DeploymentStatus::InProgress))
            .await
            .unwrap();

        let err = store
            .save(&record("dep-20240102-000000", DeploymentStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TakoError>(),
            Some(TakoError::StateLocked { .. })
        ));

        // Completing the active one is fine.
        store
            .save(&record("dep-20240101-000000", DeploymentStatus::Success))
            .await
            .unwrap();
        store
            .save(&record("dep-20240102-000000", DeploymentStatus::InProgress))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn current_prefers_in_progress_over_newest() {
        let (_dir, store) = store();
        store
            .save(&record("dep-20240101-000000", DeploymentStatus::InProgress))
            .await
            .unwrap();
        // Save a newer terminal record directly (bypassing the active
        // check by using a non-in-progress status).
        store
            .save(&record("dep-20240102-000000", DeploymentStatus::Failed))
            .await
            .unwrap();

        let current = store.current().await.unwrap().unwrap();
        assert_eq!(current.id, "dep-20240101-000000");
    }

    #[tokio::test]
    async fn cleanup_respects_retention() {
        let (_dir, store) = store();
        for day in 1..=25 {
            store
                .save(&record(
                    &format!("dep-202401{:02}-000000", day),
                    DeploymentStatus::Success,
                ))
                .await
                .unwrap();
        }

        let removed = store.cleanup_old().await.unwrap();
        assert_eq!(removed, 5);
        let remaining = store.list(&ListOptions::default()).await.unwrap();
        assert_eq!(remaining.len(), 20);
        assert_eq!(remaining[0].id, "dep-20240125-000000");
    }
}
