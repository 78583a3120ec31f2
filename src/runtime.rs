use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::ssh::breaker::CircuitBreaker;
use crate::ssh::known_hosts::HostKeyMode;

/// Explicit per-invocation context carried through call sites: the shared
/// HTTP client, the process-wide cancellation token, the host-key policy and
/// the circuit breakers. There are no global singletons behind this.
pub struct Runtime {
    pub cancel: CancellationToken,
    pub host_key_mode: HostKeyMode,
    http: reqwest::Client,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Runtime {
    pub fn new(host_key_mode: HostKeyMode) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Arc::new(Self {
            cancel: CancellationToken::new(),
            host_key_mode,
            http,
            breakers: Mutex::new(HashMap::new()),
        }))
    }

    /// Thin default for the CLI: host-key mode from flag or
    /// `TAKO_HOST_KEY_MODE`, ctrl-c wired to the cancellation token.
    pub fn for_cli(host_key_mode: HostKeyMode) -> Result<Arc<Self>> {
        let mode = match std::env::var("TAKO_HOST_KEY_MODE") {
            Ok(v) => v.parse().unwrap_or(host_key_mode),
            Err(_) => host_key_mode,
        };

        let runtime = Self::new(mode)?;

        let cancel = runtime.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });

        Ok(runtime)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Shared circuit breaker for `kind` (`ssh`, `http`, `deploy`) and a
    /// per-target key, created on first use.
    pub fn breaker(&self, kind: &str, key: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(format!("{}:{}", kind, key))
            .or_insert_with(|| Arc::new(CircuitBreaker::for_kind(kind)))
            .clone()
    }
}

/// Prompts are suppressed under `TAKO_NONINTERACTIVE=1` or `CI=true`.
pub fn non_interactive() -> bool {
    std::env::var("TAKO_NONINTERACTIVE").map(|v| v == "1").unwrap_or(false)
        || std::env::var("CI").map(|v| v == "true").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn breakers_are_shared_by_kind_and_key() {
        let runtime = Runtime::new(HostKeyMode::Tofu).unwrap();
        let a = runtime.breaker("ssh", "10.0.0.1");
        let b = runtime.breaker("ssh", "10.0.0.1");
        let c = runtime.breaker("ssh", "10.0.0.2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
