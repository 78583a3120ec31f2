use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::ProjectConfig;
use crate::deploy;
use crate::runtime::Runtime;

pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env: &str,
    project_root: PathBuf,
    id: Option<&str>,
) -> Result<()> {
    deploy::rollback(runtime, config, env, project_root, id).await
}
