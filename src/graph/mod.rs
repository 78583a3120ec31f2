use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::cmp::Reverse;

use anyhow::Result;

use crate::config::ServiceSpec;
use crate::error::TakoError;

/// Orders services so dependencies deploy before their dependents. Explicit
/// `dependsOn` edges are merged with edges inferred from environment
/// variables that name another service as a hostname.
pub struct DependencyResolver {
    /// service -> services it depends on
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    pub fn new(services: &BTreeMap<String, ServiceSpec>) -> Self {
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, spec) in services {
            let entry = deps.entry(name.clone()).or_default();
            for dep in &spec.depends_on {
                entry.insert(dep.clone());
            }
        }
        Self { deps }
    }

    /// Edges inferred from env values: a value that is a bare service name,
    /// a `service:port` pair, or a URL whose host is a service name ties the
    /// consumer to that service.
    pub fn infer_dependencies(
        &self,
        services: &BTreeMap<String, ServiceSpec>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut inferred: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (name, spec) in services {
            for value in spec.env.values() {
                for other in services.keys() {
                    if other != name && references_service(value, other) {
                        inferred.entry(name.clone()).or_default().insert(other.clone());
                    }
                }
            }
        }
        inferred
    }

    /// Union the given edges in. Merging the same set twice is a no-op.
    pub fn merge_dependencies(&mut self, edges: &BTreeMap<String, BTreeSet<String>>) {
        for (name, deps) in edges {
            self.deps
                .entry(name.clone())
                .or_default()
                .extend(deps.iter().cloned());
        }
    }

    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.deps.get(name).cloned().unwrap_or_default()
    }

    /// Kahn's algorithm with a deterministic name tie-break. A cycle yields
    /// `CycleError` with one concrete cycle path and no partial output.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for (name, deps) in &self.deps {
            in_degree.entry(name.as_str()).or_insert(0);
            for dep in deps {
                // Edges to services outside this set do not gate ordering.
                if !self.deps.contains_key(dep.as_str()) {
                    continue;
                }
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: BinaryHeap<Reverse<&str>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| Reverse(*name))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(name)) = ready.pop() {
            order.push(name.to_string());
            for dependent in dependents.get(name).cloned().unwrap_or_default() {
                let degree = in_degree.get_mut(dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < in_degree.len() {
            let ordered: BTreeSet<&str> = order.iter().map(|o| o.as_str()).collect();
            let remaining: BTreeSet<&str> = in_degree
                .keys()
                .copied()
                .filter(|name| !ordered.contains(name))
                .collect();
            return Err(TakoError::Cycle {
                path: self.find_cycle(&remaining),
            }
            .into());
        }

        Ok(order)
    }

    /// Walk dependency edges inside the stuck set until a node repeats.
    fn find_cycle(&self, remaining: &BTreeSet<&str>) -> Vec<String> {
        let start = match remaining.iter().next() {
            Some(start) => *start,
            None => return Vec::new(),
        };

        let mut path: Vec<&str> = vec![start];
        let mut seen: BTreeSet<&str> = [start].into_iter().collect();
        let mut current = start;

        loop {
            let next = self
                .deps
                .get(current)
                .and_then(|deps| deps.iter().find(|d| remaining.contains(d.as_str())));
            let Some(next) = next else {
                return path.iter().map(|s| s.to_string()).collect();
            };

            if seen.contains(next.as_str()) {
                // Close the loop at the first repeated node.
                let cycle_start = path.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[cycle_start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.clone());
                return cycle;
            }

            path.push(next.as_str());
            seen.insert(next.as_str());
            current = next.as_str();
        }
    }
}

/// Does `value` syntactically reference `service` as a host? Accepted
/// shapes: the bare name, `name:port`, and a URL whose authority host is
/// the name.
fn references_service(value: &str, service: &str) -> bool {
    if value == service {
        return true;
    }

    if let Some((host, port)) = value.split_once(':') {
        if host == service && !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return true;
        }
    }

    if let Some((_, rest)) = value.split_once("://") {
        let authority = rest.split(['/', '?']).next().unwrap_or("");
        let host = authority
            .rsplit_once('@')
            .map(|(_, h)| h)
            .unwrap_or(authority);
        let host = host.split(':').next().unwrap_or("");
        return host == service;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services(defs: &[(&str, &[&str])]) -> BTreeMap<String, ServiceSpec> {
        defs.iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    ServiceSpec {
                        image: Some("img:1".into()),
                        depends_on: deps.iter().map(|d| d.to_string()).collect(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let svcs = services(&[("api", &["db"]), ("db", &[]), ("worker", &["api"])]);
        let order = DependencyResolver::new(&svcs).resolve_order().unwrap();

        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("db") < pos("api"));
        assert!(pos("api") < pos("worker"));
    }

    #[test]
    fn independent_services_order_by_name() {
        let svcs = services(&[("c", &[]), ("a", &[]), ("b", &[])]);
        let order = DependencyResolver::new(&svcs).resolve_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_an_error_with_a_concrete_path() {
        let svcs = services(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = DependencyResolver::new(&svcs).resolve_order().unwrap_err();

        match err.downcast_ref::<TakoError>() {
            Some(TakoError::Cycle { path }) => {
                assert!(path.len() >= 4);
                assert_eq!(path.first(), path.last());
                for node in path {
                    assert!(["a", "b", "c"].contains(&node.as_str()));
                }
            }
            other => panic!("expected CycleError, got {:?}", other),
        }
    }

    #[test]
    fn env_values_infer_edges() {
        let mut svcs = services(&[("api", &[]), ("db", &[]), ("cache", &[])]);
        let api = svcs.get_mut("api").unwrap();
        api.env.insert("DATABASE_URL".into(), "postgres://user@db:5432/app".into());
        api.env.insert("CACHE_ADDR".into(), "cache:6379".into());
        api.env.insert("UNRELATED".into(), "dbx".into());

        let resolver = DependencyResolver::new(&svcs);
        let inferred = resolver.infer_dependencies(&svcs);

        let api_deps = inferred.get("api").unwrap();
        assert!(api_deps.contains("db"));
        assert!(api_deps.contains("cache"));
        assert_eq!(api_deps.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let svcs = services(&[("api", &["db"]), ("db", &[])]);
        let mut resolver = DependencyResolver::new(&svcs);

        let mut extra: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        extra
            .entry("api".into())
            .or_default()
            .insert("db".into());

        resolver.merge_dependencies(&extra);
        resolver.merge_dependencies(&extra);

        assert_eq!(resolver.dependencies_of("api").len(), 1);
        assert_eq!(
            resolver.resolve_order().unwrap(),
            vec!["db".to_string(), "api".to_string()]
        );
    }

    #[test]
    fn bare_name_and_host_port_reference() {
        assert!(references_service("db", "db"));
        assert!(references_service("db:5432", "db"));
        assert!(references_service("redis://cache:6379/0", "cache"));
        assert!(!references_service("database", "db"));
        assert!(!references_service("db:notaport", "db"));
        assert!(!references_service("https://example.com/db", "db"));
    }
}
