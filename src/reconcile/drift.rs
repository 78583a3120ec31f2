use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::config::ServiceSpec;
use crate::docker::ActualService;

use super::config_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    MissingService,
    ReplicaShortfall,
    UnmanagedService,
    ConfigDrift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for DriftSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftSeverity::Low => "low",
            DriftSeverity::Medium => "medium",
            DriftSeverity::High => "high",
            DriftSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One divergence between configuration and live state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DriftReport {
    pub service: String,
    #[serde(rename = "type")]
    pub drift_type: DriftType,
    pub expected: String,
    pub actual: String,
    pub severity: DriftSeverity,
}

/// Compare desired services against live state. The detector never heals;
/// it reports.
pub fn detect(
    desired: &BTreeMap<String, ServiceSpec>,
    observed: &[ActualService],
) -> Vec<DriftReport> {
    let mut reports = Vec::new();

    for (name, spec) in desired {
        let Some(actual) = observed.iter().find(|s| s.name == *name) else {
            reports.push(DriftReport {
                service: name.clone(),
                drift_type: DriftType::MissingService,
                expected: format!("{} replica(s) running", spec.replicas),
                actual: "service not found".into(),
                severity: DriftSeverity::Critical,
            });
            continue;
        };

        if actual.running_replicas < spec.replicas {
            reports.push(DriftReport {
                service: name.clone(),
                drift_type: DriftType::ReplicaShortfall,
                expected: format!("{} replica(s)", spec.replicas),
                actual: format!("{} running", actual.running_replicas),
                severity: DriftSeverity::High,
            });
        }

        let expected_hash = config_hash(spec);
        if let Some(actual_hash) = actual.labels.get(crate::docker::LABEL_CONFIG_HASH) {
            if actual_hash != &expected_hash {
                reports.push(DriftReport {
                    service: name.clone(),
                    drift_type: DriftType::ConfigDrift,
                    expected: expected_hash,
                    actual: actual_hash.clone(),
                    severity: DriftSeverity::Low,
                });
            }
        }
    }

    for actual in observed {
        if !desired.contains_key(&actual.name) {
            reports.push(DriftReport {
                service: actual.name.clone(),
                drift_type: DriftType::UnmanagedService,
                expected: "not present".into(),
                actual: format!("running {}", actual.image),
                severity: DriftSeverity::Medium,
            });
        }
    }

    reports.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.service.cmp(&b.service)));
    reports
}

/// Edge-triggered change tracking: notify and log only when the set of
/// reports differs from the previous run.
#[derive(Default)]
pub struct DriftTracker {
    last_fingerprint: Option<u64>,
}

impl DriftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_new_state(&mut self, reports: &[DriftReport]) -> bool {
        let mut hasher = DefaultHasher::new();
        for report in reports {
            report.hash(&mut hasher);
        }
        let fingerprint = hasher.finish();

        let changed = self.last_fingerprint != Some(fingerprint);
        self.last_fingerprint = Some(fingerprint);
        changed
    }
}
