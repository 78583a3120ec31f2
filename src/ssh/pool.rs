use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::ServerSpec;
use crate::runtime::Runtime;

use super::client::SshClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    user: String,
}

impl PoolKey {
    fn for_spec(spec: &ServerSpec) -> Self {
        Self {
            host: spec.host.clone(),
            port: spec.port,
            user: spec.user.clone(),
        }
    }
}

/// Multiplexes SSH clients by `(host, port, user)`. Clients are created on
/// demand and closed collectively on teardown. Safe under concurrent access.
pub struct SshPool {
    runtime: Arc<Runtime>,
    clients: Mutex<HashMap<PoolKey, Arc<SshClient>>>,
}

impl SshPool {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Get the client for a server, connecting if none exists yet.
    pub async fn get_or_create(&self, spec: &ServerSpec) -> Result<Arc<SshClient>> {
        self.get_or_create_with_auth(spec).await
    }

    /// Same as `get_or_create`; the spec carries its own credentials, so an
    /// explicit-auth variant only differs in the spec the caller passes.
    pub async fn get_or_create_with_auth(&self, spec: &ServerSpec) -> Result<Arc<SshClient>> {
        let key = PoolKey::for_spec(spec);

        // Holding the map lock across connect also collapses concurrent
        // connection attempts to the same host into one.
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = Arc::new(
            SshClient::connect(&self.runtime, spec)
                .await
                .with_context(|| format!("Failed to connect to {}@{}", spec.user, spec.host))?,
        );
        clients.insert(key, client.clone());
        Ok(client)
    }

    /// Close every pooled client. The pool remains usable; later calls
    /// reconnect.
    pub async fn close_all(&self) {
        let mut clients = self.clients.lock().await;
        for (key, client) in clients.drain() {
            debug!("closing ssh connection to {}@{}:{}", key.user, key.host, key.port);
            let _ = client.close().await;
        }
    }
}
