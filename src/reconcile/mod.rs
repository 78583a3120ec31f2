use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::config::ServiceSpec;
use crate::docker::ActualService;

pub mod drift;
pub mod plan;

pub use plan::{Plan, PlanItem, PlanKind};

/// Hash of the service configuration fields that force a container replace
/// when changed: env, port, volumes, placement. The hash is stamped on
/// containers as a label so the reconciler can compare without inspecting
/// each container.
pub fn config_hash(spec: &ServiceSpec) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in &spec.env {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    if let Some(port) = spec.port {
        hasher.update(port.to_be_bytes());
    }
    for volume in &spec.volumes {
        hasher.update(volume.as_bytes());
        hasher.update(b"\n");
    }
    if let Some(placement) = &spec.placement {
        hasher.update(format!("{:?}", placement.strategy).as_bytes());
        for server in &placement.servers {
            hasher.update(server.as_bytes());
        }
    }
    hex::encode(&hasher.finalize()[..6])
}

/// Diff desired services against observed runtime state and produce the
/// plan. Items follow `order` (the resolver's topological order of the
/// desired set); services only present remotely sort after it by name.
pub struct Reconciler<'a> {
    desired: &'a BTreeMap<String, ServiceSpec>,
    observed: &'a [ActualService],
}

impl<'a> Reconciler<'a> {
    pub fn new(desired: &'a BTreeMap<String, ServiceSpec>, observed: &'a [ActualService]) -> Self {
        Self { desired, observed }
    }

    fn observed_service(&self, name: &str) -> Option<&ActualService> {
        self.observed.iter().find(|s| s.name == name)
    }

    pub fn plan(&self, order: &[String]) -> Plan {
        let mut items = Vec::new();

        for name in order {
            let Some(spec) = self.desired.get(name) else {
                continue;
            };
            items.push(self.diff_service(name, spec));
        }

        // Desired services missing from the resolver order still must be
        // planned; keep name order for them.
        for (name, spec) in self.desired {
            if !order.iter().any(|o| o == name) {
                items.push(self.diff_service(name, spec));
            }
        }

        let mut extra: Vec<&ActualService> = self
            .observed
            .iter()
            .filter(|s| !self.desired.contains_key(&s.name))
            .collect();
        extra.sort_by(|a, b| a.name.cmp(&b.name));
        for service in extra {
            items.push(PlanItem {
                kind: PlanKind::Remove,
                service: service.name.clone(),
                from: Some(service.image.clone()),
                to: None,
                reason: "service is not in the configuration".into(),
                destructive: true,
            });
        }

        Plan::new(items)
    }

    fn diff_service(&self, name: &str, spec: &ServiceSpec) -> PlanItem {
        let desired_image = spec.image.clone().unwrap_or_else(|| format!("build:{}", name));

        let Some(observed) = self.observed_service(name) else {
            return PlanItem {
                kind: PlanKind::Create,
                service: name.to_string(),
                from: None,
                to: Some(desired_image),
                reason: "service is not running".into(),
                destructive: false,
            };
        };

        // Image reference change always replaces. Built images are compared
        // by tag, which embeds the commit.
        if spec.image.as_deref().is_some_and(|image| image != observed.image) {
            return PlanItem {
                kind: PlanKind::UpdateImage,
                service: name.to_string(),
                from: Some(observed.image.clone()),
                to: Some(desired_image),
                reason: "image changed".into(),
                destructive: spec.replicas == 0,
            };
        }

        let desired_hash = config_hash(spec);
        let observed_hash = observed.labels.get(crate::docker::LABEL_CONFIG_HASH);
        if observed_hash.is_some_and(|h| h != &desired_hash) {
            return PlanItem {
                kind: PlanKind::UpdateImage,
                service: name.to_string(),
                from: observed_hash.cloned(),
                to: Some(desired_hash),
                reason: "env, port, volumes or placement changed".into(),
                destructive: spec.replicas == 0,
            };
        }

        if spec.replicas != observed.desired_replicas {
            return PlanItem {
                kind: PlanKind::Scale,
                service: name.to_string(),
                from: Some(observed.desired_replicas.to_string()),
                to: Some(spec.replicas.to_string()),
                reason: "replica count changed".into(),
                destructive: spec.replicas == 0,
            };
        }

        PlanItem {
            kind: PlanKind::Noop,
            service: name.to_string(),
            from: None,
            to: None,
            reason: "up to date".into(),
            destructive: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(image: &str, replicas: u32) -> ServiceSpec {
        ServiceSpec {
            image: Some(image.to_string()),
            replicas,
            ..Default::default()
        }
    }

    fn observed(name: &str, image: &str, replicas: u32, hash: Option<&str>) -> ActualService {
        let mut labels = BTreeMap::new();
        if let Some(hash) = hash {
            labels.insert(
                crate::docker::LABEL_CONFIG_HASH.to_string(),
                hash.to_string(),
            );
        }
        ActualService {
            name: name.to_string(),
            image: image.to_string(),
            running_replicas: replicas,
            desired_replicas: replicas,
            labels,
            ..Default::default()
        }
    }

    fn plan_kinds(plan: &Plan) -> Vec<(String, PlanKind)> {
        plan.items()
            .iter()
            .map(|i| (i.service.clone(), i.kind))
            .collect()
    }

    #[test]
    fn matching_state_yields_empty_plan() {
        let mut desired = BTreeMap::new();
        desired.insert("web".to_string(), spec("nginx:1", 2));
        let hash = config_hash(&desired["web"]);
        let observed = vec![observed("web", "nginx:1", 2, Some(&hash))];

        let plan = Reconciler::new(&desired, &observed).plan(&["web".to_string()]);
        assert!(plan.is_empty());
        assert!(!plan.needs_confirmation());
    }

    #[test]
    fn missing_service_is_created() {
        let mut desired = BTreeMap::new();
        desired.insert("web".to_string(), spec("nginx:1", 2));

        let plan = Reconciler::new(&desired, &[]).plan(&["web".to_string()]);
        assert_eq!(plan_kinds(&plan), vec![("web".to_string(), PlanKind::Create)]);
        assert!(!plan.needs_confirmation());
    }

    #[test]
    fn image_change_forces_update() {
        let mut desired = BTreeMap::new();
        desired.insert("web".to_string(), spec("nginx:2", 2));
        let observed = vec![observed("web", "nginx:1", 2, None)];

        let plan = Reconciler::new(&desired, &observed).plan(&["web".to_string()]);
        let item = &plan.items()[0];
        assert_eq!(item.kind, PlanKind::UpdateImage);
        assert_eq!(item.from.as_deref(), Some("nginx:1"));
        assert_eq!(item.to.as_deref(), Some("nginx:2"));
    }

    #[test]
    fn replicas_only_change_scales() {
        let mut desired = BTreeMap::new();
        desired.insert("web".to_string(), spec("nginx:1", 5));
        let hash = config_hash(&desired["web"]);
        let observed = vec![observed("web", "nginx:1", 2, Some(&hash))];

        let plan = Reconciler::new(&desired, &observed).plan(&["web".to_string()]);
        assert_eq!(plan.items()[0].kind, PlanKind::Scale);
    }

    #[test]
    fn frozen_field_set_forces_update_not_scale() {
        // Changing env (a frozen field) plus replicas must replace, not
        // scale.
        let mut desired = BTreeMap::new();
        let mut changed = spec("nginx:1", 5);
        changed.env.insert("NEW".into(), "var".into());
        let old_hash = config_hash(&spec("nginx:1", 2));
        desired.insert("web".to_string(), changed);
        let observed = vec![observed("web", "nginx:1", 2, Some(&old_hash))];

        let plan = Reconciler::new(&desired, &observed).plan(&["web".to_string()]);
        assert_eq!(plan.items()[0].kind, PlanKind::UpdateImage);
    }

    #[test]
    fn unmanaged_service_is_removed_and_destructive() {
        let desired = BTreeMap::new();
        let observed = vec![observed("legacy", "old:1", 1, None)];

        let plan = Reconciler::new(&desired, &observed).plan(&[]);
        assert_eq!(plan.items()[0].kind, PlanKind::Remove);
        assert!(plan.needs_confirmation());
    }

    #[test]
    fn config_hash_tracks_only_frozen_fields() {
        let base = spec("nginx:1", 2);

        let mut scaled = base.clone();
        scaled.replicas = 9;
        assert_eq!(config_hash(&base), config_hash(&scaled));

        let mut with_port = base.clone();
        with_port.port = Some(8080);
        assert_ne!(config_hash(&base), config_hash(&with_port));

        let mut with_volume = base.clone();
        with_volume.volumes.push("data:/data".into());
        assert_ne!(config_hash(&base), config_hash(&with_volume));
    }

    #[test]
    fn applying_the_plan_converges_on_desired() {
        // Plan completeness: simulate apply and compare the resulting
        // service->image map with the desired one.
        let mut desired = BTreeMap::new();
        desired.insert("api".to_string(), spec("app/api:2", 1));
        desired.insert("web".to_string(), spec("nginx:2", 2));
        let observed = vec![
            observed("web", "nginx:1", 2, None),
            observed("legacy", "old:1", 1, None),
        ];

        let plan =
            Reconciler::new(&desired, &observed).plan(&["api".to_string(), "web".to_string()]);

        let mut simulated: BTreeMap<String, String> = observed
            .iter()
            .map(|s| (s.name.clone(), s.image.clone()))
            .collect();
        for item in plan.actionable() {
            match item.kind {
                PlanKind::Create | PlanKind::UpdateImage => {
                    simulated.insert(item.service.clone(), item.to.clone().unwrap());
                }
                PlanKind::Remove => {
                    simulated.remove(&item.service);
                }
                PlanKind::Scale | PlanKind::Noop => {}
            }
        }

        let desired_images: BTreeMap<String, String> = desired
            .iter()
            .map(|(n, s)| (n.clone(), s.image.clone().unwrap()))
            .collect();
        assert_eq!(simulated, desired_images);
    }
}
