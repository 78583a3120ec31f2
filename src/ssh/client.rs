use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use anyhow::Result;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::ssh_key::public::PublicKey;
use russh_keys::PublicKeyBase64;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ServerSpec;
use crate::error::TakoError;
use crate::output;
use crate::runtime::Runtime;

use super::breaker::CircuitBreaker;
use super::known_hosts::{HostKeyMode, KeyStatus, KnownHostsStore};
use super::retry::{self, RetryPolicy};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

static INSECURE_WARNING: Once = Once::new();

struct HostKeyCheck {
    host: String,
    port: u16,
    mode: HostKeyMode,
    store: KnownHostsStore,
    /// Detailed rejection for the connect caller; the russh error alone
    /// cannot carry the expected/got pair.
    rejection: Arc<StdMutex<Option<TakoError>>>,
}

impl HostKeyCheck {
    fn reject(&self, err: TakoError) -> bool {
        *self.rejection.lock().unwrap() = Some(err);
        false
    }

    fn verify(&self, key: &PublicKey) -> bool {
        let algo = key.algorithm().to_string();
        let presented = key.public_key_base64();

        if self.mode == HostKeyMode::Insecure {
            INSECURE_WARNING.call_once(|| {
                output::warning("host key verification disabled (--host-key-mode insecure)");
            });
            return true;
        }

        let status = match self.store.check(&self.host, self.port, &algo, &presented) {
            Ok(status) => status,
            Err(err) => {
                return self.reject(TakoError::Network(format!(
                    "known_hosts unreadable: {:#}",
                    err
                )))
            }
        };

        match (self.mode, status) {
            (_, KeyStatus::Known) => true,
            (HostKeyMode::Tofu, KeyStatus::Unknown) => {
                debug!("pinning first-seen key for {}:{}", self.host, self.port);
                match self.store.record(&self.host, self.port, &algo, &presented) {
                    Ok(()) => true,
                    Err(err) => self.reject(TakoError::Network(format!(
                        "failed to pin host key: {:#}",
                        err
                    ))),
                }
            }
            (HostKeyMode::Strict, KeyStatus::Unknown) => self.reject(TakoError::HostKey {
                host: self.host.clone(),
                expected: "a pinned key (strict mode)".into(),
                got: format!("{} {}", algo, key.fingerprint(russh_keys::ssh_key::HashAlg::Sha256)),
            }),
            (HostKeyMode::Ask, KeyStatus::Unknown) => {
                self.confirm(key, &presented, None)
            }
            (HostKeyMode::Insecure, KeyStatus::Unknown) => true,
            (mode, KeyStatus::Mismatch { expected }) => {
                if mode == HostKeyMode::Ask {
                    return self.confirm(key, &presented, Some(&expected));
                }
                self.reject(TakoError::HostKey {
                    host: self.host.clone(),
                    expected,
                    got: format!("{} {}", algo, key.fingerprint(russh_keys::ssh_key::HashAlg::Sha256)),
                })
            }
        }
    }

    fn confirm(&self, key: &PublicKey, presented: &str, changed_from: Option<&str>) -> bool {
        if crate::runtime::non_interactive() {
            return self.reject(TakoError::HostKey {
                host: self.host.clone(),
                expected: changed_from.unwrap_or("operator confirmation").to_string(),
                got: format!("{} {}", key.algorithm(), key.fingerprint(russh_keys::ssh_key::HashAlg::Sha256)),
            });
        }

        let prompt = match changed_from {
            Some(_) => format!(
                "Host key for {} CHANGED ({}). Trust the new key?",
                self.host,
                key.fingerprint(russh_keys::ssh_key::HashAlg::Sha256)
            ),
            None => format!(
                "Unknown host {} ({}). Trust this key?",
                self.host,
                key.fingerprint(russh_keys::ssh_key::HashAlg::Sha256)
            ),
        };

        let accepted = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);

        if accepted {
            if let Err(err) = self
                .store
                .record(&self.host, self.port, &key.algorithm().to_string(), presented)
            {
                return self.reject(TakoError::Network(format!(
                    "failed to pin host key: {:#}",
                    err
                )));
            }
            true
        } else {
            self.reject(TakoError::HostKey {
                host: self.host.clone(),
                expected: "operator confirmation".into(),
                got: format!("{} {}", key.algorithm(), key.fingerprint(russh_keys::ssh_key::HashAlg::Sha256)),
            })
        }
    }
}

struct ClientHandler {
    check: HostKeyCheck,
}

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.check.verify(server_public_key))
    }
}

/// One authenticated SSH connection. Commands on a single client are
/// serialized by an internal session mutex; concurrency comes from widening
/// the pool.
pub struct SshClient {
    host: String,
    handle: Mutex<Handle<ClientHandler>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl SshClient {
    /// Connect and authenticate. Auth order: key file if configured, then
    /// password, then any reachable SSH agent.
    pub async fn connect(runtime: &Runtime, spec: &ServerSpec) -> Result<Self> {
        debug!("connecting to {}@{}:{}", spec.user, spec.host, spec.port);

        let rejection = Arc::new(StdMutex::new(None));
        let handler = ClientHandler {
            check: HostKeyCheck {
                host: spec.host.clone(),
                port: spec.port,
                mode: runtime.host_key_mode,
                store: KnownHostsStore::default_store()?,
                rejection: rejection.clone(),
            },
        };

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let connect = client::connect(config, (spec.host.as_str(), spec.port), handler);
        let mut handle = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Err(_) => {
                return Err(TakoError::Deadline {
                    operation: format!("connect to {}:{}", spec.host, spec.port),
                    seconds: CONNECT_TIMEOUT.as_secs(),
                }
                .into())
            }
            Ok(Err(err)) => {
                // A host-key rejection surfaces as a generic russh error;
                // restore the detailed one recorded by the handler.
                if let Some(rejected) = rejection.lock().unwrap().take() {
                    return Err(rejected.into());
                }
                return Err(TakoError::Network(format!(
                    "connect to {}:{} failed: {}",
                    spec.host, spec.port, err
                ))
                .into());
            }
            Ok(Ok(handle)) => handle,
        };

        Self::authenticate(&mut handle, spec).await?;

        Ok(Self {
            host: spec.host.clone(),
            handle: Mutex::new(handle),
            closed: AtomicBool::new(false),
            cancel: runtime.cancel.clone(),
            breaker: runtime.breaker("ssh", &spec.host),
            policy: RetryPolicy::default(),
        })
    }

    async fn authenticate(handle: &mut Handle<ClientHandler>, spec: &ServerSpec) -> Result<()> {
        let auth_err = |reason: String| TakoError::Auth {
            user: spec.user.clone(),
            host: spec.host.clone(),
            reason,
        };

        if let Some(key_file) = &spec.key_file {
            let pair = russh_keys::load_secret_key(key_file, None)
                .map_err(|e| auth_err(format!("cannot load key {}: {}", key_file.display(), e)))?;
            let key = russh_keys::key::PrivateKeyWithHashAlg::new(Arc::new(pair), None)
                .map_err(|e| auth_err(format!("unsupported key algorithm: {}", e)))?;
            let ok = handle
                .authenticate_publickey(&spec.user, key)
                .await
                .map_err(|e| TakoError::Network(format!("auth exchange failed: {}", e)))?;
            if ok {
                return Ok(());
            }
            debug!("key file auth rejected for {}@{}", spec.user, spec.host);
        }

        if let Some(password) = &spec.password {
            let ok = handle
                .authenticate_password(&spec.user, password)
                .await
                .map_err(|e| TakoError::Network(format!("auth exchange failed: {}", e)))?;
            if ok {
                return Ok(());
            }
            debug!("password auth rejected for {}@{}", spec.user, spec.host);
        }

        if Self::authenticate_agent(handle, &spec.user).await? {
            return Ok(());
        }

        Err(auth_err("all authentication methods rejected".into()).into())
    }

    async fn authenticate_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool> {
        let mut agent = match russh_keys::agent::client::AgentClient::connect_env().await {
            Ok(agent) => agent,
            // No agent socket is not an error; it is just the end of the
            // auth chain.
            Err(_) => return Ok(false),
        };

        let identities = match agent.request_identities().await {
            Ok(identities) => identities,
            Err(err) => {
                debug!("ssh agent unavailable: {}", err);
                return Ok(false);
            }
        };

        for key in identities {
            if matches!(
                handle
                    .authenticate_publickey_with(user, key, &mut agent)
                    .await,
                Ok(true)
            ) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Execute a command and return its stdout. Non-zero exit fails with
    /// `RemoteExec{exit_code, stderr}`. Network-class failures are retried
    /// under the transport policy; the per-host breaker guards repeated
    /// failures.
    pub async fn execute(&self, cmd: &str) -> Result<String> {
        self.execute_with_timeout(cmd, COMMAND_TIMEOUT).await
    }

    /// `execute` with a caller-chosen deadline, for long-running commands
    /// like image builds.
    pub async fn execute_with_timeout(&self, cmd: &str, limit: Duration) -> Result<String> {
        retry::with_retry(&self.policy, &self.cancel, "ssh exec", || async {
            if !self.breaker.allow() {
                return Err(TakoError::Network(format!(
                    "circuit breaker open for {}",
                    self.host
                ))
                .into());
            }
            match self.run_captured(cmd, limit).await {
                Ok(output) => {
                    self.breaker.record_success();
                    Ok(output)
                }
                Err(err) => {
                    if crate::error::is_retryable(&err) {
                        self.breaker.record_failure();
                    } else {
                        // The transport worked; the remote command failed.
                        self.breaker.record_success();
                    }
                    Err(err)
                }
            }
        })
        .await
    }

    /// Execute a command returning `Ok(true)` on exit 0, `Ok(false)` on any
    /// non-zero exit.
    pub async fn execute_ok(&self, cmd: &str) -> Result<bool> {
        match self.execute(cmd).await {
            Ok(_) => Ok(true),
            Err(err) => match err.downcast_ref::<TakoError>() {
                Some(TakoError::RemoteExec { .. }) => Ok(false),
                _ => Err(err),
            },
        }
    }

    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        self.execute_ok(&format!("test -e {}", path)).await
    }

    async fn run_captured(&self, cmd: &str, limit: Duration) -> Result<String> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let exit = self.run(cmd, &mut stdout, &mut stderr, limit).await?;

        if exit != 0 {
            return Err(TakoError::RemoteExec {
                exit_code: exit,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    /// Execute with live sinks attached; returns the remote exit status.
    pub async fn execute_stream(
        &self,
        cmd: &str,
        out: &mut (dyn Write + Send),
        err: &mut (dyn Write + Send),
    ) -> Result<u32> {
        let mut stdout = SinkWriter(out);
        let mut stderr = SinkWriter(err);
        self.run_streaming(cmd, &mut stdout, &mut stderr, None).await
    }

    async fn run(
        &self,
        cmd: &str,
        stdout: &mut Vec<u8>,
        stderr: &mut Vec<u8>,
        limit: Duration,
    ) -> Result<u32> {
        let mut out = BufSink(stdout);
        let mut err = BufSink(stderr);
        self.run_streaming(cmd, &mut out, &mut err, Some(limit)).await
    }

    async fn run_streaming(
        &self,
        cmd: &str,
        stdout: &mut (dyn Sink + Send),
        stderr: &mut (dyn Sink + Send),
        timeout: Option<Duration>,
    ) -> Result<u32> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TakoError::Network(format!("connection to {} closed", self.host)).into());
        }
        if self.cancel.is_cancelled() {
            return Err(TakoError::Cancelled.into());
        }

        debug!("[{}] exec: {}", self.host, cmd);

        // Sessions are per-client; holding the lock for the whole command
        // serializes concurrent callers on this host.
        let mut handle = self.handle.lock().await;
        let handle = &mut *handle;

        let work = async {
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| TakoError::Network(format!("channel open failed: {}", e)))?;

            channel
                .exec(true, cmd)
                .await
                .map_err(|e| TakoError::Network(format!("exec request failed: {}", e)))?;

            let mut exit: Option<u32> = None;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.write_chunk(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.write_chunk(data),
                    ChannelMsg::ExitStatus { exit_status } => exit = Some(exit_status),
                    _ => {}
                }
            }

            exit.ok_or_else(|| {
                TakoError::Network(format!("channel to {} closed without exit status", self.host))
                    .into()
            })
        };

        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => Err(TakoError::Deadline {
                        operation: format!("remote command on {}", self.host),
                        seconds: limit.as_secs(),
                    }
                    .into()),
                },
                None => work.await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TakoError::Cancelled.into()),
            result = bounded => result,
        }
    }

    /// Close the connection. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut handle = self.handle.lock().await;
        if let Err(err) = (*handle)
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!("disconnect from {} failed: {}", self.host, err);
        }
        Ok(())
    }
}

/// Narrow write target for channel data; keeps the streaming loop free of
/// generic bounds.
trait Sink: Send {
    fn write_chunk(&mut self, data: &[u8]);
}

struct BufSink<'a>(&'a mut Vec<u8>);

impl Sink for BufSink<'_> {
    fn write_chunk(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }
}

struct SinkWriter<'a>(&'a mut (dyn Write + Send));

impl Sink for SinkWriter<'_> {
    fn write_chunk(&mut self, data: &[u8]) {
        let _ = self.0.write_all(data);
        let _ = self.0.flush();
    }
}
