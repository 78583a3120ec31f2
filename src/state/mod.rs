pub mod local;
pub mod lock;
pub mod record;
pub mod remote;

use anyhow::Result;

pub use local::LocalStateStore;
pub use lock::{LockOperation, StateLock};
pub use record::{
    DeploymentRecord, DeploymentStatus, GitInfo, HealthSnapshot, ListOptions, RetentionPolicy,
    ServiceSnapshot,
};
pub use remote::{RemoteStateStore, REMOTE_STATE_ROOT};

/// Deployment history. Implemented by the local workstation store and the
/// remote manager-host store; callers work against this surface so state
/// commands behave the same either way.
#[allow(async_fn_in_trait)]
pub trait History {
    async fn save(&self, record: &DeploymentRecord) -> Result<()>;
    async fn load(&self, id: &str) -> Result<DeploymentRecord>;
    async fn latest_successful(&self) -> Result<Option<DeploymentRecord>>;
    async fn list(&self, opts: &ListOptions) -> Result<Vec<DeploymentRecord>>;
    /// The in-progress record if any, otherwise the newest record.
    async fn current(&self) -> Result<Option<DeploymentRecord>>;
    async fn cleanup_old(&self) -> Result<usize>;
    async fn log_deployment(&self, message: &str) -> Result<()>;
}
