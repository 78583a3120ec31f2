use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::TakoError;
use crate::ssh::{transfer, SshClient};

use super::record::{
    DeploymentRecord, DeploymentStatus, ListOptions, RetentionPolicy, ServiceSnapshot,
};
use super::History;

pub const REMOTE_STATE_ROOT: &str = "/var/lib/tako";

/// Per-project history on the manager host, replicated best-effort to the
/// workers after every write.
pub struct RemoteStateStore {
    manager: Arc<SshClient>,
    workers: Vec<Arc<SshClient>>,
    project: String,
    env: String,
    retention: RetentionPolicy,
}

fn history_dir(project: &str) -> String {
    format!("{}/{}/history", REMOTE_STATE_ROOT, project)
}

fn record_path(project: &str, id: &str) -> String {
    format!("{}/{}.json", history_dir(project), id)
}

/// History files are newline-terminated JSON with a stable field order, so
/// uploading the same record twice produces identical remote bytes.
fn serialize_record(record: &DeploymentRecord) -> Result<Vec<u8>> {
    let mut json = serde_json::to_string_pretty(record).context("Failed to serialize record")?;
    json.push('\n');
    Ok(json.into_bytes())
}

impl RemoteStateStore {
    pub fn new(
        manager: Arc<SshClient>,
        workers: Vec<Arc<SshClient>>,
        project: &str,
        env: &str,
    ) -> Self {
        Self {
            manager,
            workers,
            project: project.to_string(),
            env: env.to_string(),
            retention: RetentionPolicy::default(),
        }
    }

    async fn fetch(client: &SshClient, project: &str, id: &str) -> Result<DeploymentRecord> {
        let bytes = transfer::download(client, &record_path(project, id)).await?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed remote record {}", id))
    }

    async fn list_ids(client: &SshClient, project: &str, limit: usize) -> Result<Vec<String>> {
        let listing = client
            .execute(&format!(
                "ls -1 {} 2>/dev/null | sort -r | head -{}",
                history_dir(project),
                limit
            ))
            .await?;
        Ok(parse_history_listing(&listing))
    }

    /// Push the just-written record to every worker. Failures are logged,
    /// never surfaced: replication is best-effort by design.
    fn replicate(&self, record: &DeploymentRecord) {
        if self.workers.is_empty() {
            return;
        }

        let mut copy = record.clone();
        copy.source = Some(self.manager.host().to_string());
        let path = record_path(&self.project, &copy.id);
        let payload = match serialize_record(&copy) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("replication skipped, cannot serialize record: {:#}", err);
                return;
            }
        };

        for worker in &self.workers {
            let worker = worker.clone();
            let path = path.clone();
            let payload = payload.clone();
            let id = copy.id.clone();
            tokio::spawn(async move {
                match transfer::upload(&worker, &path, &payload).await {
                    Ok(()) => debug!("replicated {} to {}", id, worker.host()),
                    Err(err) => {
                        warn!("replication of {} to {} failed: {:#}", id, worker.host(), err)
                    }
                }
            });
        }
    }

    /// Read-repair: ask every worker for its newest history record, pick
    /// the canonical one and restore it to the manager.
    pub async fn recover_from_workers(&self) -> Result<Option<DeploymentRecord>> {
        let mut candidates: Vec<(String, DeploymentRecord)> = Vec::new();

        for worker in &self.workers {
            let ids = match Self::list_ids(worker, &self.project, 1).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!("worker {} unreadable during recovery: {:#}", worker.host(), err);
                    continue;
                }
            };
            let Some(id) = ids.first() else { continue };
            match Self::fetch(worker, &self.project, id).await {
                Ok(record) if record.is_valid() => {
                    candidates.push((worker.host().to_string(), record))
                }
                Ok(_) => warn!("worker {} returned an invalid record", worker.host()),
                Err(err) => warn!("worker {} record fetch failed: {:#}", worker.host(), err),
            }
        }

        let Some(mut canonical) = choose_canonical(candidates) else {
            return Ok(None);
        };

        // The restored copy becomes authoritative again.
        canonical.source = None;
        let payload = serialize_record(&canonical)?;
        transfer::upload(
            &self.manager,
            &record_path(&self.project, &canonical.id),
            &payload,
        )
        .await
        .context("Failed to restore recovered record to the manager")?;

        Ok(Some(canonical))
    }

    /// Last resort when no history survives anywhere but containers are
    /// still running: synthesize a `recovered` record from the runtime.
    pub async fn reconcile_from_running(&self) -> Result<Option<DeploymentRecord>> {
        let listing = self
            .manager
            .execute(
                "docker ps --format '{{.Names}}\t{{.Image}}\t{{.ID}}' 2>/dev/null || true",
            )
            .await?;

        let services = parse_running_services(&self.project, &self.env, &listing);
        if services.is_empty() {
            return Ok(None);
        }

        let mut record = DeploymentRecord::begin(&self.project, "unknown", self.manager.host());
        record.status = DeploymentStatus::Recovered;
        record.message = Some("state reconstructed from running containers".to_string());
        record.services = services;

        let payload = serialize_record(&record)?;
        transfer::upload(
            &self.manager,
            &record_path(&self.project, &record.id),
            &payload,
        )
        .await?;

        Ok(Some(record))
    }
}

impl History for RemoteStateStore {
    async fn save(&self, record: &DeploymentRecord) -> Result<()> {
        let payload = serialize_record(record)?;
        transfer::upload(
            &self.manager,
            &record_path(&self.project, &record.id),
            &payload,
        )
        .await
        .with_context(|| format!("Failed to store record {} on the manager", record.id))?;

        self.replicate(record);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<DeploymentRecord> {
        Self::fetch(&self.manager, &self.project, id).await
    }

    async fn latest_successful(&self) -> Result<Option<DeploymentRecord>> {
        let records = self
            .list(&ListOptions {
                status: Some(DeploymentStatus::Success),
                limit: Some(1),
            })
            .await?;
        Ok(records.into_iter().next())
    }

    async fn list(&self, opts: &ListOptions) -> Result<Vec<DeploymentRecord>> {
        // Fetch a window large enough to satisfy the limit after status
        // filtering.
        let fetch_limit = opts.limit.map(|l| l.max(50)).unwrap_or(200);
        let ids = Self::list_ids(&self.manager, &self.project, fetch_limit).await?;

        let mut records = Vec::new();
        for id in ids {
            let record = Self::fetch(&self.manager, &self.project, &id).await?;
            if let Some(status) = opts.status {
                if record.status != status {
                    continue;
                }
            }
            records.push(record);
            if let Some(limit) = opts.limit {
                if records.len() >= limit {
                    break;
                }
            }
        }
        Ok(records)
    }

    async fn current(&self) -> Result<Option<DeploymentRecord>> {
        let records = self.list(&ListOptions::default()).await?;
        if let Some(active) = records
            .iter()
            .find(|r| r.status == DeploymentStatus::InProgress)
        {
            return Ok(Some(active.clone()));
        }
        Ok(records.into_iter().next())
    }

    async fn cleanup_old(&self) -> Result<usize> {
        let records = self.list(&ListOptions::default()).await?;
        let doomed = self.retention.prune_ids(&records, Utc::now());
        for id in &doomed {
            self.manager
                .execute(&format!("rm -f {}", record_path(&self.project, id)))
                .await?;
        }
        Ok(doomed.len())
    }

    async fn log_deployment(&self, message: &str) -> Result<()> {
        let line = format!("{} {}", Utc::now().to_rfc3339(), message);
        self.manager
            .execute(&format!(
                "printf '%s\\n' '{}' >> {}/{}/deployments.log",
                line.replace('\'', "'\\''"),
                REMOTE_STATE_ROOT,
                self.project
            ))
            .await?;
        Ok(())
    }
}

/// Parse `ls -1 | sort -r` output into record ids.
fn parse_history_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.trim().strip_suffix(".json"))
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect()
}

/// Pick the canonical record among worker copies: latest timestamp wins,
/// ties broken by lexicographically smaller host name.
fn choose_canonical(
    mut candidates: Vec<(String, DeploymentRecord)>,
) -> Option<DeploymentRecord> {
    candidates.sort_by(|(host_a, rec_a), (host_b, rec_b)| {
        rec_b
            .timestamp
            .cmp(&rec_a.timestamp)
            .then_with(|| host_a.cmp(host_b))
    });
    candidates.into_iter().next().map(|(_, record)| record)
}

/// Scan `docker ps` output for `<project>_<env>_<service>_<rev>` containers
/// and fold them into per-service snapshots.
fn parse_running_services(
    project: &str,
    env: &str,
    listing: &str,
) -> BTreeMap<String, ServiceSnapshot> {
    let prefix = format!("{}_{}_", project, env);
    let mut services: BTreeMap<String, ServiceSnapshot> = BTreeMap::new();

    for line in listing.lines() {
        let mut parts = line.split('\t');
        let (Some(name), Some(image)) = (parts.next(), parts.next()) else {
            continue;
        };
        let container_id = parts.next().unwrap_or_default();

        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        // Container names end in `_<revision>` with an optional `_rN`
        // replica suffix; everything before those is the service.
        let mut service = rest;
        if let Some((head, last)) = service.rsplit_once('_') {
            if last.len() > 1
                && last.starts_with('r')
                && last[1..].chars().all(|c| c.is_ascii_digit())
            {
                service = head;
            }
        }
        if let Some((head, last)) = service.rsplit_once('_') {
            if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
                service = head;
            }
        }
        if service.is_empty() {
            continue;
        }

        let snapshot = services
            .entry(service.to_string())
            .or_insert_with(|| ServiceSnapshot {
                name: service.to_string(),
                image: image.to_string(),
                container_id: Some(container_id.to_string()),
                replicas: 0,
                ..Default::default()
            });
        snapshot.replicas += 1;
    }

    services
}
