use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use tracing::warn;

use crate::config::{DeployStrategy, ProjectConfig, ServiceSpec};
use crate::docker::shell::list_swarm_services;
use crate::docker::{ContainerControl, ShellDocker};
use crate::error::TakoError;
use crate::graph::DependencyResolver;
use crate::notify::{Event, EventKind, Notifier};
use crate::output;
use crate::reconcile::{Plan, PlanKind, Reconciler};
use crate::registry::{Registry, RegistryEntry};
use crate::runtime::Runtime;
use crate::secrets;
use crate::ssh::SshPool;
use crate::state::{
    DeploymentRecord, DeploymentStatus, History, LocalStateStore, LockOperation, RemoteStateStore,
    ServiceSnapshot, StateLock,
};

pub mod build;
pub mod context;
pub mod health;
pub mod hooks;
pub mod orchestrator;
pub mod single;
pub mod swarm;
#[cfg(test)]
pub mod testing;

pub use context::DeployContext;
use orchestrator::{Orchestrator, OrchestratorConfig, ServiceActions};
use single::BlueGreenDeployer;
use swarm::SwarmDeployer;

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub skip_build: bool,
    /// Confirm destructive plans without prompting.
    pub yes: bool,
}

/// One full `tako deploy` run: observe, plan, confirm, execute, record.
pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: PathBuf,
    opts: DeployOptions,
) -> Result<()> {
    let tako_dir = project_root.join(".tako");
    let _lock = StateLock::acquire(&tako_dir, LockOperation::Deploy)?;

    let store_secrets = secrets::load(&tako_dir, env_name)?;
    let mut ctx = DeployContext::new(config, env_name, project_root, store_secrets)?;

    let pool = SshPool::new(runtime.clone());
    let manager_spec = ctx.config.manager(&ctx.environment)?.clone();
    let manager = pool.get_or_create(&manager_spec).await?;
    let control = ShellDocker::new(manager.clone());
    let multi_host = ctx.config.is_multi_host(&ctx.environment);

    output::header(&format!(
        "Deploying {} to {} ({})",
        ctx.config.name,
        env_name,
        if multi_host { "swarm" } else { "single host" }
    ));

    // Cross-project imports resolve to env vars before diffing, so an
    // import change rolls the consumer.
    let registry = Registry::new(manager.clone());
    resolve_imports(&registry, &mut ctx).await?;

    output::step(1, 4, "Inspecting remote state");
    let observed = if multi_host {
        list_swarm_services(&manager, ctx.project(), env_name).await?
    } else {
        control.list_services(ctx.project(), env_name).await?
    };

    let services = ctx.environment.services.clone();
    let mut resolver = DependencyResolver::new(&services);
    let inferred = resolver.infer_dependencies(&services);
    resolver.merge_dependencies(&inferred);
    let order = resolver.resolve_order()?;

    output::step(2, 4, "Computing the plan");
    let plan = Reconciler::new(&services, &observed).plan(&order);
    println!("{}", plan.format_plan());

    if plan.is_empty() {
        output::success("Nothing to do.");
        pool.close_all().await;
        return Ok(());
    }

    confirm_plan(&plan, opts.yes)?;

    let workers = {
        let mut clients = Vec::new();
        for spec in ctx.config.workers(&ctx.environment)? {
            clients.push(pool.get_or_create(spec).await?);
        }
        clients
    };

    let local_store = LocalStateStore::open(&tako_dir, ctx.project(), env_name)?;
    let remote_store =
        RemoteStateStore::new(manager.clone(), workers, ctx.project(), env_name);

    let mut record = DeploymentRecord::begin(
        ctx.project(),
        &ctx.config.version,
        &manager_spec.host,
    );
    record.git = ctx.git.clone();
    local_store.save(&record).await?;
    remote_store.save(&record).await?;

    let notifier = Notifier::from_config(runtime.clone(), &ctx.config.notifications);
    notifier.dispatch(&Event::new(
        EventKind::DeployStarted,
        ctx.project(),
        env_name,
        &format!("deployment {} started", record.id),
    ));

    output::step(3, 4, "Rolling out");
    let started = Instant::now();
    let result = execute_plan(
        &runtime, &pool, &ctx, &control, &plan, &order, &resolver, multi_host, &opts, &tako_dir,
    )
    .await;

    record.duration = started.elapsed().as_secs_f64();
    output::step(4, 4, "Recording deployment");
    match result {
        Ok(snapshots) => {
            record.status = DeploymentStatus::Success;
            record.services = snapshots;
            record.message = Some(format!("deployed {} service(s)", record.services.len()));
            local_store.save(&record).await?;
            remote_store.save(&record).await?;

            if let Err(err) = local_store.cleanup_old().await {
                warn!("local history cleanup failed: {:#}", err);
            }
            if let Err(err) = remote_store.cleanup_old().await {
                warn!("remote history cleanup failed: {:#}", err);
            }

            if let Err(err) = update_registry(&registry, &ctx, &record).await {
                warn!("registry update failed: {:#}", err);
            }

            notifier.dispatch(
                &Event::new(
                    EventKind::DeployDone,
                    ctx.project(),
                    env_name,
                    &format!("deployment {} succeeded", record.id),
                )
                .with_duration(record.duration),
            );

            output::success(&format!(
                "Deploy complete in {:.1}s ({})",
                record.duration, record.id
            ));
            pool.close_all().await;
            Ok(())
        }
        Err(err) => {
            record.status = DeploymentStatus::Failed;
            record.error = Some(format!("{:#}", err));
            if let Err(save_err) = local_store.save(&record).await {
                warn!("failed to persist failed record locally: {:#}", save_err);
            }
            if let Err(save_err) = remote_store.save(&record).await {
                warn!("failed to persist failed record remotely: {:#}", save_err);
            }

            notifier.dispatch(
                &Event::new(
                    EventKind::DeployFailed,
                    ctx.project(),
                    env_name,
                    &format!("deployment {} failed: {:#}", record.id, err),
                )
                .with_duration(record.duration),
            );

            pool.close_all().await;
            Err(err)
        }
    }
}

fn confirm_plan(plan: &Plan, assume_yes: bool) -> Result<()> {
    if !plan.needs_confirmation() || assume_yes {
        return Ok(());
    }
    if crate::runtime::non_interactive() {
        return Err(TakoError::PlanRefused.into());
    }

    let accepted = dialoguer::Confirm::new()
        .with_prompt("The plan contains destructive changes. Continue?")
        .default(false)
        .interact()
        .unwrap_or(false);
    if !accepted {
        return Err(TakoError::PlanRefused.into());
    }
    Ok(())
}

async fn resolve_imports(registry: &Registry, ctx: &mut DeployContext) -> Result<()> {
    let has_imports = ctx
        .environment
        .services
        .values()
        .any(|s| !s.imports.is_empty());
    if !has_imports {
        return Ok(());
    }

    let catalog = registry.load().await?;
    for spec in ctx.environment.services.values_mut() {
        for import in spec.imports.clone() {
            let address = crate::registry::lookup_import(&catalog, &import)?;
            let var = import
                .split_once('.')
                .map(|(_, export)| export.to_uppercase().replace('-', "_"))
                .unwrap_or_else(|| import.to_uppercase());
            spec.env.entry(var).or_insert(address);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn execute_plan(
    runtime: &Arc<Runtime>,
    pool: &SshPool,
    ctx: &DeployContext,
    control: &ShellDocker,
    plan: &Plan,
    order: &[String],
    resolver: &DependencyResolver,
    multi_host: bool,
    opts: &DeployOptions,
    tako_dir: &std::path::Path,
) -> Result<BTreeMap<String, ServiceSnapshot>> {
    if multi_host {
        swarm::setup_swarm_cluster(pool, &ctx.config, &ctx.environment, tako_dir).await?;
    }

    let rollout: Vec<&str> = plan
        .actionable()
        .filter(|i| matches!(i.kind, PlanKind::Create | PlanKind::UpdateImage))
        .map(|i| i.service.as_str())
        .collect();

    let snapshots: Mutex<BTreeMap<String, ServiceSnapshot>> = Mutex::new(BTreeMap::new());

    let actions = RolloutActions {
        runtime,
        ctx,
        control,
        multi_host,
        skip_build: opts.skip_build,
        snapshots: &snapshots,
    };

    if ctx.config.deployment.strategy == DeployStrategy::Parallel && rollout.len() > 1 {
        let rollout_order: Vec<String> = order
            .iter()
            .filter(|s| rollout.contains(&s.as_str()))
            .cloned()
            .collect();
        let deps = rollout_order
            .iter()
            .map(|s| (s.clone(), resolver.dependencies_of(s)))
            .collect();

        let config = OrchestratorConfig {
            max_concurrent_builds: ctx.config.deployment.max_concurrent_builds,
            max_concurrent_deploys: ctx.config.deployment.max_concurrent_deploys,
            enable_cache: ctx.config.deployment.cache,
            ..Default::default()
        };
        Orchestrator::new(&rollout_order, deps, config, runtime.cancel.clone())
            .run(&actions)
            .await?;
    } else {
        for service in order.iter().filter(|s| rollout.contains(&s.as_str())) {
            let image = actions.build(service).await?;
            actions.deploy(service, &image).await?;
        }
    }

    // Scales and removes run after the rollouts, in plan order.
    for item in plan.actionable() {
        let spec = ctx.environment.services.get(&item.service);
        match item.kind {
            PlanKind::Scale => {
                let spec = spec.ok_or_else(|| {
                    TakoError::Config(format!("unknown service '{}' in plan", item.service))
                })?;
                if multi_host {
                    SwarmDeployer::new(control, ctx, runtime.cancel.clone())
                        .scale(&item.service, spec.replicas)
                        .await?;
                } else {
                    BlueGreenDeployer::new(control, ctx, runtime.cancel.clone())
                        .scale_service(&item.service, spec, spec.replicas)
                        .await?;
                }
                snapshots.lock().unwrap().insert(
                    item.service.clone(),
                    snapshot_for(&item.service, spec, ctx),
                );
            }
            PlanKind::Remove => {
                if multi_host {
                    SwarmDeployer::new(control, ctx, runtime.cancel.clone())
                        .remove(&item.service)
                        .await?;
                } else {
                    BlueGreenDeployer::new(control, ctx, runtime.cancel.clone())
                        .remove_service(&item.service)
                        .await?;
                }
            }
            _ => {}
        }
    }

    // Unchanged services still belong in the record.
    for (name, spec) in &ctx.environment.services {
        snapshots
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_insert_with(|| snapshot_for(name, spec, ctx));
    }

    Ok(snapshots.into_inner().unwrap())
}

fn snapshot_for(name: &str, spec: &ServiceSpec, ctx: &DeployContext) -> ServiceSnapshot {
    ServiceSnapshot {
        name: name.to_string(),
        image: ctx.image_for(name, spec),
        port: spec.port,
        replicas: spec.replicas,
        env: spec.env.clone(),
        ..Default::default()
    }
}

/// Per-service build/deploy/rollback used both by the orchestrator and the
/// sequential path.
struct RolloutActions<'a> {
    runtime: &'a Arc<Runtime>,
    ctx: &'a DeployContext,
    control: &'a ShellDocker,
    multi_host: bool,
    skip_build: bool,
    snapshots: &'a Mutex<BTreeMap<String, ServiceSnapshot>>,
}

impl RolloutActions<'_> {
    fn spec(&self, service: &str) -> Result<&ServiceSpec> {
        self.ctx.environment.services.get(service).ok_or_else(|| {
            TakoError::Config(format!("unknown service '{}' in plan", service)).into()
        })
    }
}

impl ServiceActions for RolloutActions<'_> {
    async fn build(&self, service: &str) -> Result<String> {
        let spec = self.spec(service)?;
        if self.skip_build || spec.build.is_none() {
            return Ok(self.ctx.image_for(service, spec));
        }
        build::build_image(self.control.client(), self.control, self.ctx, service, spec).await
    }

    async fn deploy(&self, service: &str, image: &str) -> Result<()> {
        let spec = self.spec(service)?;

        if self.multi_host {
            SwarmDeployer::new(self.control, self.ctx, self.runtime.cancel.clone())
                .deploy_service(service, spec, image)
                .await?;
            let mut snapshot = snapshot_for(service, spec, self.ctx);
            snapshot.image = image.to_string();
            self.snapshots
                .lock()
                .unwrap()
                .insert(service.to_string(), snapshot);
        } else {
            let snapshot =
                BlueGreenDeployer::new(self.control, self.ctx, self.runtime.cancel.clone())
                    .deploy_service(service, spec, image)
                    .await?;
            self.snapshots
                .lock()
                .unwrap()
                .insert(service.to_string(), snapshot);
        }
        Ok(())
    }

    async fn rollback(&self, service: &str) -> Result<()> {
        // Atomic mode: take the freshly rolled service out of rotation; the
        // operator restores a known-good state with `tako rollback`.
        warn!("rolling back {} after a failed atomic rollout", service);
        if self.multi_host {
            SwarmDeployer::new(self.control, self.ctx, self.runtime.cancel.clone())
                .stop(service)
                .await
        } else {
            BlueGreenDeployer::new(self.control, self.ctx, self.runtime.cancel.clone())
                .stop_service(service)
                .await
        }
    }
}

/// Roll the environment back to an earlier deployment. With no explicit id
/// the previous successful record is restored. The record being undone is
/// flipped to `rolled_back`; no new record is created.
pub async fn rollback(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: PathBuf,
    target_id: Option<&str>,
) -> Result<()> {
    let tako_dir = project_root.join(".tako");
    let _lock = StateLock::acquire(&tako_dir, LockOperation::Rollback)?;

    let store_secrets = secrets::load(&tako_dir, env_name)?;
    let ctx = DeployContext::new(config, env_name, project_root, store_secrets)?;

    let pool = SshPool::new(runtime.clone());
    let manager_spec = ctx.config.manager(&ctx.environment)?.clone();
    let manager = pool.get_or_create(&manager_spec).await?;
    let control = ShellDocker::new(manager.clone());
    let multi_host = ctx.config.is_multi_host(&ctx.environment);

    let local_store = LocalStateStore::open(&tako_dir, ctx.project(), env_name)?;
    let remote_store = RemoteStateStore::new(manager.clone(), Vec::new(), ctx.project(), env_name);

    let mut undone = local_store
        .latest_successful()
        .await?
        .ok_or_else(|| TakoError::Config("no successful deployment to roll back".into()))?;

    let target = match target_id {
        Some(id) => match local_store.load(id).await {
            Ok(record) => record,
            Err(_) => remote_store.load(id).await?,
        },
        None => {
            let all = local_store
                .list(&crate::state::ListOptions {
                    status: Some(DeploymentStatus::Success),
                    limit: None,
                })
                .await?;
            all.into_iter()
                .find(|r| r.id < undone.id)
                .ok_or_else(|| TakoError::Config("no earlier successful deployment".into()))?
        }
    };

    if target.id == undone.id {
        return Err(TakoError::Config(format!(
            "{} is already the active deployment",
            target.id
        ))
        .into());
    }

    output::header(&format!(
        "Rolling back {} on {} to {}",
        ctx.project(),
        env_name,
        target.id
    ));

    let notifier = Notifier::from_config(runtime.clone(), &ctx.config.notifications);
    notifier.dispatch(&Event::new(
        EventKind::RollbackStarted,
        ctx.project(),
        env_name,
        &format!("rolling back to {}", target.id),
    ));

    let started = Instant::now();
    for (name, snapshot) in &target.services {
        let Some(spec) = ctx.environment.services.get(name) else {
            warn!("service {} from {} is no longer configured, skipping", name, target.id);
            continue;
        };
        let mut spec = spec.clone();
        spec.replicas = snapshot.replicas;

        if multi_host {
            SwarmDeployer::new(&control, &ctx, runtime.cancel.clone())
                .deploy_service(name, &spec, &snapshot.image)
                .await?;
        } else {
            BlueGreenDeployer::new(&control, &ctx, runtime.cancel.clone())
                .deploy_service(name, &spec, &snapshot.image)
                .await?;
        }
    }

    undone.status = DeploymentStatus::RolledBack;
    local_store.save(&undone).await?;
    remote_store.save(&undone).await?;

    notifier.dispatch(
        &Event::new(
            EventKind::RollbackDone,
            ctx.project(),
            env_name,
            &format!("rolled back to {}", target.id),
        )
        .with_duration(started.elapsed().as_secs_f64()),
    );

    output::success(&format!("Rolled back to {}", target.id));
    pool.close_all().await;
    Ok(())
}

async fn update_registry(
    registry: &Registry,
    ctx: &DeployContext,
    record: &DeploymentRecord,
) -> Result<()> {
    let mut exports = BTreeMap::new();
    for (name, spec) in &ctx.environment.services {
        if let Some(export) = &spec.export {
            let address = match spec.port {
                Some(port) => format!("{}:{}", name, port),
                None => name.clone(),
            };
            exports.insert(export.clone(), address);
        }
    }

    let entry = RegistryEntry {
        environment: ctx.env_name.clone(),
        network: ctx.network_name(),
        services: ctx.environment.services.keys().cloned().collect(),
        domains: ctx
            .environment
            .services
            .values()
            .filter_map(|s| s.proxy.as_ref())
            .flat_map(|p| p.domains.clone())
            .collect(),
        deployed_at: Some(record.timestamp),
        exports,
    };
    registry.update_project(ctx.project(), entry).await
}
