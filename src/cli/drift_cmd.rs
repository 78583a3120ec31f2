use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::style;

use crate::config::ProjectConfig;
use crate::docker::shell::list_swarm_services;
use crate::docker::{ContainerControl, ShellDocker};
use crate::notify::{Event, EventKind, Notifier};
use crate::output;
use crate::reconcile::drift::{self, DriftReport, DriftSeverity, DriftTracker};
use crate::runtime::Runtime;
use crate::ssh::SshPool;
use crate::state::{History, LocalStateStore};

/// `tako drift [--watch]`: run the reconciler against live state and report
/// divergences. The detector never heals; in watch mode it notifies and
/// logs a history entry when the drift picture changes.
pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env_name: &str,
    project_root: &Path,
    watch: bool,
    interval_secs: u64,
) -> Result<()> {
    let env = config.environment(env_name)?.clone();
    let pool = SshPool::new(runtime.clone());
    let manager = pool.get_or_create(config.manager(&env)?).await?;
    let control = ShellDocker::new(manager.clone());
    let multi_host = config.is_multi_host(&env);

    let notifier = Notifier::from_config(runtime.clone(), &config.notifications);

    // Services can route their own drift alerts via monitoring.webhook.
    let service_notifiers: Vec<Notifier> = {
        let mut urls: Vec<String> = env
            .services
            .values()
            .filter_map(|s| s.monitoring.as_ref())
            .filter(|m| m.enabled)
            .filter_map(|m| m.webhook.clone())
            .collect();
        urls.sort();
        urls.dedup();
        urls.into_iter()
            .map(|url| {
                Notifier::from_config(
                    runtime.clone(),
                    &crate::config::NotificationsConfig {
                        webhook: Some(url),
                        ..Default::default()
                    },
                )
            })
            .collect()
    };

    let store = LocalStateStore::open(&project_root.join(".tako"), &config.name, env_name)?;
    let mut tracker = DriftTracker::new();
    let interval = Duration::from_secs(interval_secs.max(1));

    loop {
        let observed = if multi_host {
            list_swarm_services(&manager, &config.name, env_name).await?
        } else {
            control.list_services(&config.name, env_name).await?
        };

        let reports = drift::detect(&env.services, &observed);
        print_reports(&reports);

        if tracker.is_new_state(&reports) && !reports.is_empty() {
            let worst = reports
                .first()
                .map(|r| r.severity)
                .unwrap_or(DriftSeverity::Low);
            let event = Event::new(
                EventKind::DriftDetected,
                &config.name,
                env_name,
                &format!("{} drift(s) detected, worst {}", reports.len(), worst),
            )
            .with_detail("count", &reports.len().to_string());
            notifier.dispatch(&event);
            for extra in &service_notifiers {
                extra.dispatch(&event);
            }
            store
                .log_deployment(&format!("drift detected: {} report(s)", reports.len()))
                .await?;
        }

        if !watch {
            break;
        }
        tokio::select! {
            _ = runtime.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    pool.close_all().await;
    Ok(())
}

fn print_reports(reports: &[DriftReport]) {
    if reports.is_empty() {
        output::success("No drift. Live state matches the configuration.");
        return;
    }

    output::header(&format!("{} drift report(s)", reports.len()));
    for report in reports {
        let severity = match report.severity {
            DriftSeverity::Critical => style("critical").red().bold(),
            DriftSeverity::High => style("high").red(),
            DriftSeverity::Medium => style("medium").yellow(),
            DriftSeverity::Low => style("low").dim(),
        };
        output::item(&format!(
            "{:<9} {:<16} expected {}, got {}",
            severity, report.service, report.expected, report.actual
        ));
    }
}
