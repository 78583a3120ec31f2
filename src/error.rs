use chrono::{DateTime, Utc};
use thiserror::Error;

/// The closed set of failure kinds tako distinguishes. Everything that
/// crosses a module boundary is one of these; `anyhow` carries the context
/// chain on top.
#[derive(Debug, Error)]
pub enum TakoError {
    #[error("config error: {0}")]
    Config(String),

    #[error("authentication failed for {user}@{host}: {reason}")]
    Auth {
        user: String,
        host: String,
        reason: String,
    },

    #[error("host key for {host} changed: expected {expected}, got {got}")]
    HostKey {
        host: String,
        expected: String,
        got: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("remote command exited with status {exit_code}: {stderr}")]
    RemoteExec { exit_code: u32, stderr: String },

    #[error("health check failed for {service}: last status {last_status}")]
    HealthCheckFailed {
        service: String,
        last_status: String,
    },

    #[error("plan contains destructive changes; re-run with --yes to confirm")]
    PlanRefused,

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("state is locked by {holder} since {since}")]
    StateLocked {
        holder: String,
        since: DateTime<Utc>,
    },

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptAuth,

    #[error("decryption failed: {0}")]
    DecryptFormat(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} timed out after {seconds}s")]
    Deadline { operation: String, seconds: u64 },
}

impl TakoError {
    /// Whether the transport retry policy may re-attempt the failed
    /// operation. Auth failures, non-zero remote exits and cancellation are
    /// permanent; everything network-ish is worth another try.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TakoError::Network(_) | TakoError::Deadline { .. }
        )
    }

    /// Process exit code for the CLI layer: 1 user error, 2 remote error,
    /// 3 state conflict, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            TakoError::Config(_) | TakoError::Cycle { .. } | TakoError::DecryptFormat(_) => 1,
            TakoError::Auth { .. }
            | TakoError::HostKey { .. }
            | TakoError::Network(_)
            | TakoError::RemoteExec { .. }
            | TakoError::HealthCheckFailed { .. }
            | TakoError::Deadline { .. } => 2,
            TakoError::PlanRefused | TakoError::StateLocked { .. } | TakoError::DecryptAuth => 3,
            TakoError::Cancelled => 4,
        }
    }
}

/// Map an error chain to the CLI exit code, defaulting unknown errors to 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<TakoError>()
        .map(TakoError::exit_code)
        .unwrap_or(1)
}

/// Classify an error chain for the retry policy.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TakoError>()
        .map(TakoError::is_retryable)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(TakoError::Config("bad".into()).exit_code(), 1);
        assert_eq!(
            TakoError::RemoteExec {
                exit_code: 127,
                stderr: "not found".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(
            TakoError::StateLocked {
                holder: "pid 1".into(),
                since: Utc::now()
            }
            .exit_code(),
            3
        );
        assert_eq!(TakoError::Cancelled.exit_code(), 4);
    }

    #[test]
    fn only_network_class_errors_retry() {
        assert!(TakoError::Network("reset".into()).is_retryable());
        assert!(TakoError::Deadline {
            operation: "exec".into(),
            seconds: 60
        }
        .is_retryable());
        assert!(!TakoError::Cancelled.is_retryable());
        assert!(!TakoError::RemoteExec {
            exit_code: 1,
            stderr: String::new()
        }
        .is_retryable());
        assert!(!TakoError::Auth {
            user: "deploy".into(),
            host: "h".into(),
            reason: "denied".into()
        }
        .is_retryable());
    }

    #[test]
    fn downcast_through_anyhow_context() {
        let err = anyhow::Error::new(TakoError::Network("timeout".into()))
            .context("while listing services");
        assert!(is_retryable(&err));
        assert_eq!(exit_code_for(&err), 2);
    }
}
