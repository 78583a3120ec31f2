use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TakoError;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_builds: usize,
    pub max_concurrent_deploys: usize,
    pub enable_cache: bool,
    pub build_timeout: Duration,
    pub deploy_timeout: Duration,
    /// Roll back already-deployed services when a later one fails.
    pub atomic: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 2,
            max_concurrent_deploys: 2,
            enable_cache: true,
            build_timeout: Duration::from_secs(600),
            deploy_timeout: Duration::from_secs(300),
            atomic: false,
        }
    }
}

/// What the orchestrator drives per service. The deployer provides the
/// production implementation; tests provide recording fakes.
#[allow(async_fn_in_trait)]
pub trait ServiceActions {
    /// Build (or resolve) the image for a service, returning its reference.
    async fn build(&self, service: &str) -> Result<String>;
    async fn deploy(&self, service: &str, image: &str) -> Result<()>;
    async fn rollback(&self, service: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    pub total_duration: Duration,
    pub build_durations: BTreeMap<String, Duration>,
    pub deploy_durations: BTreeMap<String, Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Building,
    Built,
    Deploying,
    Deployed,
    Failed,
}

enum Event {
    Built {
        service: String,
        result: Result<String>,
        took: Duration,
    },
    Deployed {
        service: String,
        result: Result<()>,
        took: Duration,
    },
}

/// Bounded-parallel build/deploy driver for `deployment.strategy: parallel`.
/// Builds and deploys run on separate bounded pools; a service deploys only
/// after its own build and every dependency's deploy completed. The first
/// failure stops new work; in-flight work runs to completion.
pub struct Orchestrator<'a> {
    order: &'a [String],
    deps: BTreeMap<String, BTreeSet<String>>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        order: &'a [String],
        deps: BTreeMap<String, BTreeSet<String>>,
        config: OrchestratorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            order,
            deps,
            config,
            cancel,
        }
    }

    pub async fn run<A: ServiceActions>(&self, actions: &A) -> Result<OrchestratorMetrics> {
        let started = Instant::now();
        debug!(
            "orchestrating {} service(s): {} build slot(s), {} deploy slot(s), cache {}",
            self.order.len(),
            self.config.max_concurrent_builds,
            self.config.max_concurrent_deploys,
            self.config.enable_cache
        );
        let build_slots = Arc::new(Semaphore::new(self.config.max_concurrent_builds.max(1)));
        let deploy_slots = Arc::new(Semaphore::new(self.config.max_concurrent_deploys.max(1)));

        let mut states: HashMap<String, ServiceState> = HashMap::new();
        let mut images: BTreeMap<String, String> = BTreeMap::new();
        let mut metrics = OrchestratorMetrics::default();
        let mut first_error: Option<anyhow::Error> = None;
        let mut secondary: Vec<String> = Vec::new();

        type EventFuture<'f> = Pin<Box<dyn Future<Output = Event> + 'f>>;
        let mut in_flight: FuturesUnordered<EventFuture<'_>> = FuturesUnordered::new();

        for service in self.order {
            states.insert(service.clone(), ServiceState::Building);
            in_flight.push(Box::pin(Self::build_one(
                actions,
                service.clone(),
                build_slots.clone(),
                self.config.build_timeout,
                self.cancel.clone(),
            )));
        }

        while let Some(event) = in_flight.next().await {
            match event {
                Event::Built {
                    service,
                    result,
                    took,
                } => {
                    metrics.build_durations.insert(service.clone(), took);
                    match result {
                        Ok(image) => {
                            debug!("built {} in {:?}", service, took);
                            states.insert(service.clone(), ServiceState::Built);
                            images.insert(service, image);
                        }
                        Err(err) => {
                            states.insert(service.clone(), ServiceState::Failed);
                            Self::note_failure(
                                &mut first_error,
                                &mut secondary,
                                &service,
                                "build",
                                err,
                            );
                        }
                    }
                }
                Event::Deployed {
                    service,
                    result,
                    took,
                } => {
                    metrics.deploy_durations.insert(service.clone(), took);
                    match result {
                        Ok(()) => {
                            debug!("deployed {} in {:?}", service, took);
                            states.insert(service, ServiceState::Deployed);
                        }
                        Err(err) => {
                            states.insert(service.clone(), ServiceState::Failed);
                            Self::note_failure(
                                &mut first_error,
                                &mut secondary,
                                &service,
                                "deploy",
                                err,
                            );
                        }
                    }
                }
            }

            // First failure cancels new work; what is already running drains.
            if first_error.is_none() {
                for service in self.order {
                    if states.get(service) != Some(&ServiceState::Built) {
                        continue;
                    }
                    let deps_done = self
                        .deps
                        .get(service)
                        .map(|deps| {
                            deps.iter().all(|dep| {
                                // Dependencies outside the rollout set are
                                // assumed satisfied.
                                !states.contains_key(dep)
                                    || states.get(dep) == Some(&ServiceState::Deployed)
                            })
                        })
                        .unwrap_or(true);
                    if !deps_done {
                        continue;
                    }

                    states.insert(service.clone(), ServiceState::Deploying);
                    let image = images.get(service).cloned().unwrap_or_default();
                    in_flight.push(Box::pin(Self::deploy_one(
                        actions,
                        service.clone(),
                        image,
                        deploy_slots.clone(),
                        self.config.deploy_timeout,
                        self.cancel.clone(),
                    )));
                }
            }
        }

        metrics.total_duration = started.elapsed();

        if let Some(err) = first_error {
            if self.config.atomic {
                let deployed: Vec<&String> = self
                    .order
                    .iter()
                    .filter(|s| states.get(*s) == Some(&ServiceState::Deployed))
                    .collect();
                for service in deployed {
                    warn!("atomic rollout: rolling back {}", service);
                    if let Err(rollback_err) = actions.rollback(service).await {
                        warn!("rollback of {} failed: {:#}", service, rollback_err);
                    }
                }
            }

            if secondary.is_empty() {
                return Err(err);
            }
            return Err(err.context(format!("secondary failures: {}", secondary.join("; "))));
        }

        Ok(metrics)
    }

    async fn build_one<A: ServiceActions>(
        actions: &A,
        service: String,
        slots: Arc<Semaphore>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Event {
        let started = Instant::now();
        let result = Self::bounded(&slots, timeout, &cancel, "build", actions.build(&service)).await;
        Event::Built {
            service,
            result,
            took: started.elapsed(),
        }
    }

    async fn deploy_one<A: ServiceActions>(
        actions: &A,
        service: String,
        image: String,
        slots: Arc<Semaphore>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Event {
        let started = Instant::now();
        let result = Self::bounded(
            &slots,
            timeout,
            &cancel,
            "deploy",
            actions.deploy(&service, &image),
        )
        .await;
        Event::Deployed {
            service,
            result,
            took: started.elapsed(),
        }
    }

    /// Acquire a pool slot, then run `op` under the timeout, honoring
    /// cancellation at both suspension points.
    async fn bounded<T>(
        slots: &Semaphore,
        timeout: Duration,
        cancel: &CancellationToken,
        what: &str,
        op: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(TakoError::Cancelled.into()),
            permit = slots.acquire() => permit.map_err(|_| anyhow!("worker pool closed"))?,
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(TakoError::Cancelled.into()),
            result = tokio::time::timeout(timeout, op) => match result {
                Ok(result) => result,
                Err(_) => Err(TakoError::Deadline {
                    operation: what.to_string(),
                    seconds: timeout.as_secs(),
                }
                .into()),
            },
        }
    }

    fn note_failure(
        first_error: &mut Option<anyhow::Error>,
        secondary: &mut Vec<String>,
        service: &str,
        phase: &str,
        err: anyhow::Error,
    ) {
        warn!("{} of {} failed: {:#}", phase, service, err);
        if first_error.is_none() {
            *first_error = Some(err.context(format!("{} of {} failed", phase, service)));
        } else {
            secondary.push(format!("{} of {}: {:#}", phase, service, err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        // (service, phase, start, end)
        events: Mutex<Vec<(String, &'static str, Instant, Instant)>>,
        fail_deploy: Option<String>,
        rollbacks: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl Recorder {
        fn with_delay(ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(ms),
                ..Default::default()
            }
        }

        fn spans(&self, phase: &str) -> Vec<(String, Instant, Instant)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, p, _, _)| *p == phase)
                .map(|(s, _, a, b)| (s.clone(), *a, *b))
                .collect()
        }
    }

    impl ServiceActions for Recorder {
        async fn build(&self, service: &str) -> Result<String> {
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.events
                .lock()
                .unwrap()
                .push((service.to_string(), "build", start, Instant::now()));
            Ok(format!("img/{}", service))
        }

        async fn deploy(&self, service: &str, image: &str) -> Result<()> {
            let start = Instant::now();
            tokio::time::sleep(self.delay).await;
            self.events
                .lock()
                .unwrap()
                .push((service.to_string(), "deploy", start, Instant::now()));
            if self.fail_deploy.as_deref() == Some(service) {
                return Err(TakoError::HealthCheckFailed {
                    service: service.to_string(),
                    last_status: "unhealthy".into(),
                }
                .into());
            }
            assert_eq!(image, format!("img/{}", service));
            Ok(())
        }

        async fn rollback(&self, service: &str) -> Result<()> {
            self.rollbacks.lock().unwrap().push(service.to_string());
            Ok(())
        }
    }

    fn deps(pairs: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        pairs
            .iter()
            .map(|(s, ds)| {
                (
                    s.to_string(),
                    ds.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn dependency_gates_deploy_but_not_build() {
        let order = vec!["db".to_string(), "api".to_string()];
        let recorder = Recorder::with_delay(20);

        let orchestrator = Orchestrator::new(
            &order,
            deps(&[("db", &[]), ("api", &["db"])]),
            OrchestratorConfig::default(),
            CancellationToken::new(),
        );
        let metrics = orchestrator.run(&recorder).await.unwrap();

        // Builds overlap (two slots, both start immediately).
        let builds = recorder.spans("build");
        assert_eq!(builds.len(), 2);
        let api_build_start = builds.iter().find(|(s, _, _)| s == "api").unwrap().1;
        let db_build_end = builds.iter().find(|(s, _, _)| s == "db").unwrap().2;
        assert!(api_build_start < db_build_end);

        // db fully deploys before api starts deploying.
        let deploys = recorder.spans("deploy");
        let db_end = deploys.iter().find(|(s, _, _)| s == "db").unwrap().2;
        let api_start = deploys.iter().find(|(s, _, _)| s == "api").unwrap().1;
        assert!(db_end <= api_start);

        assert_eq!(metrics.build_durations.len(), 2);
        assert_eq!(metrics.deploy_durations.len(), 2);
        assert!(metrics.total_duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn failure_stops_dependents_from_deploying() {
        let order = vec!["db".to_string(), "api".to_string()];
        let recorder = Recorder {
            fail_deploy: Some("db".to_string()),
            ..Recorder::with_delay(5)
        };

        let orchestrator = Orchestrator::new(
            &order,
            deps(&[("db", &[]), ("api", &["db"])]),
            OrchestratorConfig::default(),
            CancellationToken::new(),
        );
        let err = orchestrator.run(&recorder).await.unwrap_err();
        assert!(err.to_string().contains("deploy of db failed"));

        // api was built but never deployed.
        assert!(recorder.spans("deploy").iter().all(|(s, _, _)| s != "api"));
    }

    #[tokio::test]
    async fn atomic_mode_rolls_back_deployed_services() {
        let order = vec!["db".to_string(), "api".to_string()];
        let recorder = Recorder {
            fail_deploy: Some("api".to_string()),
            ..Recorder::with_delay(5)
        };

        let config = OrchestratorConfig {
            atomic: true,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            &order,
            deps(&[("db", &[]), ("api", &["db"])]),
            config,
            CancellationToken::new(),
        );
        orchestrator.run(&recorder).await.unwrap_err();

        assert_eq!(*recorder.rollbacks.lock().unwrap(), vec!["db".to_string()]);
    }

    #[tokio::test]
    async fn build_pool_is_bounded() {
        let order: Vec<String> = (0..4).map(|i| format!("svc{}", i)).collect();
        let recorder = Recorder::with_delay(30);

        let config = OrchestratorConfig {
            max_concurrent_builds: 1,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            &order,
            BTreeMap::new(),
            config,
            CancellationToken::new(),
        );
        orchestrator.run(&recorder).await.unwrap();

        // With one slot, no two build spans may overlap.
        let mut builds = recorder.spans("build");
        builds.sort_by_key(|(_, start, _)| *start);
        for pair in builds.windows(2) {
            assert!(pair[0].2 <= pair[1].1);
        }
    }
}
