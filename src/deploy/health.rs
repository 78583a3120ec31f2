use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::docker::{ContainerControl, HealthState};
use crate::error::TakoError;

/// Overall deadline is `interval * retries * SAFETY_FACTOR`.
const SAFETY_FACTOR: u32 = 2;

/// What to probe and how long to keep at it.
pub struct HealthTarget {
    pub service: String,
    pub container: String,
    /// For public services the probe goes through the proxy.
    pub http_url: Option<String>,
    pub interval: Duration,
    pub retries: u32,
}

impl HealthTarget {
    pub fn deadline(&self) -> Duration {
        self.interval * self.retries * SAFETY_FACTOR
    }
}

/// Gate a rollout on the target becoming healthy: `retries` consecutive
/// healthy samples within the deadline, polling every `interval`.
pub async fn wait_healthy<C: ContainerControl>(
    control: &C,
    target: &HealthTarget,
    cancel: &CancellationToken,
) -> Result<()> {
    let deadline = target.deadline();
    let started = Instant::now();
    let mut consecutive = 0u32;
    let mut last_status = "unknown".to_string();

    loop {
        if cancel.is_cancelled() {
            return Err(TakoError::Cancelled.into());
        }

        let healthy = match &target.http_url {
            Some(url) => {
                let up = control.http_probe(url).await.unwrap_or(false);
                last_status = if up { "200".into() } else { "unreachable".into() };
                up
            }
            None => match control.container_health(&target.container).await {
                Ok(HealthState::Healthy) => {
                    last_status = "healthy".into();
                    true
                }
                // No health check configured counts as healthy once the
                // container is up.
                Ok(HealthState::None) => {
                    last_status = "no healthcheck".into();
                    true
                }
                Ok(HealthState::Starting) => {
                    last_status = "starting".into();
                    false
                }
                Ok(HealthState::Unhealthy) => {
                    last_status = "unhealthy".into();
                    false
                }
                Err(err) => {
                    last_status = format!("inspect failed: {:#}", err);
                    false
                }
            },
        };

        if healthy {
            consecutive += 1;
            if consecutive >= target.retries {
                debug!(
                    "{} healthy after {:?} ({} consecutive samples)",
                    target.service,
                    started.elapsed(),
                    consecutive
                );
                return Ok(());
            }
        } else {
            consecutive = 0;
        }

        if started.elapsed() + target.interval > deadline {
            return Err(TakoError::HealthCheckFailed {
                service: target.service.clone(),
                last_status,
            }
            .into());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(TakoError::Cancelled.into()),
            _ = tokio::time::sleep(target.interval) => {}
        }
    }
}
