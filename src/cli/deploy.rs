use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::config::ProjectConfig;
use crate::deploy::{self, DeployOptions};
use crate::runtime::Runtime;

pub async fn run(
    runtime: Arc<Runtime>,
    config: ProjectConfig,
    env: &str,
    project_root: PathBuf,
    skip_build: bool,
    yes: bool,
) -> Result<()> {
    deploy::run(
        runtime,
        config,
        env,
        project_root,
        DeployOptions { skip_build, yes },
    )
    .await
}
