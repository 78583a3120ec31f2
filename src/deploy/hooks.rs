use anyhow::{Context, Result};
use tracing::debug;

use crate::docker::ContainerControl;
use crate::output;

/// Run host-side hook commands in order. The first failing hook aborts.
pub async fn run_host_hooks<C: ContainerControl>(
    control: &C,
    hooks: &[String],
    stage: &str,
) -> Result<()> {
    for hook in hooks {
        debug!("running {} hook: {}", stage, hook);
        output::info(&format!("{} hook: {}", stage, hook));
        control
            .host_command(hook)
            .await
            .with_context(|| format!("{} hook failed: {}", stage, hook))?;
    }
    Ok(())
}

/// Run post-start hooks inside the freshly started container.
pub async fn run_container_hooks<C: ContainerControl>(
    control: &C,
    container: &str,
    hooks: &[String],
) -> Result<()> {
    for hook in hooks {
        debug!("running post-start hook in {}: {}", container, hook);
        output::info(&format!("post-start hook: {}", hook));
        control
            .exec(container, hook)
            .await
            .with_context(|| format!("post-start hook failed: {}", hook))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::testing::FakeControl;

    #[tokio::test]
    async fn host_hooks_run_in_order() {
        let control = FakeControl::default();
        run_host_hooks(
            &control,
            &["echo one".to_string(), "echo two".to_string()],
            "pre-deploy",
        )
        .await
        .unwrap();

        assert_eq!(control.ops(), vec!["host echo one", "host echo two"]);
    }

    #[tokio::test]
    async fn failing_hook_stops_the_chain() {
        let control = FakeControl::default();
        control.fail_on("host bad");
        let err = run_host_hooks(
            &control,
            &["bad".to_string(), "never".to_string()],
            "pre-build",
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("pre-build hook failed"));
        assert_eq!(control.ops().len(), 1);
    }

    #[tokio::test]
    async fn post_start_hooks_exec_inside_the_container() {
        let control = FakeControl::default();
        run_container_hooks(&control, "blog_production_web_2", &["rake db:migrate".into()])
            .await
            .unwrap();

        assert_eq!(
            control.ops(),
            vec!["exec blog_production_web_2 rake db:migrate"]
        );
    }
}
