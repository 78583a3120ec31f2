use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::ServiceSpec;
use crate::docker::ContainerControl;
use crate::output;
use crate::ssh::{transfer, SshClient};

use super::context::DeployContext;
use super::hooks;

const BUILD_TIMEOUT: Duration = Duration::from_secs(600);

/// Build the image for a service with a `build:` context: archive the
/// context locally, ship it to the build host, `docker build` there. The
/// resulting tag embeds the commit so the reconciler can compare by
/// reference.
pub async fn build_image<C: ContainerControl>(
    client: &SshClient,
    control: &C,
    ctx: &DeployContext,
    service: &str,
    spec: &ServiceSpec,
) -> Result<String> {
    let Some(build_dir) = &spec.build else {
        // Nothing to build; the configured image is used as-is.
        return Ok(ctx.image_for(service, spec));
    };

    hooks::run_host_hooks(control, &spec.hooks.pre_build, "pre-build").await?;

    let tag = ctx.image_tag(service);
    let context_dir = ctx.project_root.join(build_dir);
    let archive = archive_context(&context_dir)
        .with_context(|| format!("Failed to archive build context for {}", service))?;

    let remote_dir = format!("{}/build/{}", ctx.artifacts_path(), service);
    let remote_archive = format!("{}.tar.gz", remote_dir);
    let script = remote_build_script(&remote_dir, &remote_archive, &tag, ctx.config.deployment.cache);

    if tracing::enabled!(tracing::Level::DEBUG) {
        // Verbose runs get the live build log instead of a spinner.
        transfer::upload(client, &remote_archive, &archive)
            .await
            .context("Failed to upload build context")?;
        let mut out = std::io::stderr();
        let mut err = std::io::stderr();
        let exit = client.execute_stream(&script, &mut out, &mut err).await?;
        if exit != 0 {
            return Err(crate::error::TakoError::RemoteExec {
                exit_code: exit,
                stderr: format!("image build failed for {}", service),
            }
            .into());
        }
    } else {
        let spinner = output::create_spinner(&format!("Building {} ({})", service, tag));
        let upload = transfer::upload(client, &remote_archive, &archive)
            .await
            .context("Failed to upload build context");
        let result = match upload {
            Ok(()) => client
                .execute_with_timeout(&script, BUILD_TIMEOUT)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        spinner.finish_and_clear();
        result.with_context(|| format!("Image build failed for {}", service))?;
    }

    hooks::run_host_hooks(control, &spec.hooks.post_build, "post-build").await?;

    debug!("built {} for {}", tag, service);
    Ok(tag)
}

/// `tar czf` the build context into memory via a local temp file.
fn archive_context(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        bail!("build context {} is not a directory", dir.display());
    }

    let tmp = tempfile::NamedTempFile::new().context("Failed to create temp archive")?;
    let status = Command::new("tar")
        .arg("czf")
        .arg(tmp.path())
        .arg("-C")
        .arg(dir)
        .arg(".")
        .status()
        .context("Failed to run tar")?;
    if !status.success() {
        bail!("tar of {} failed", dir.display());
    }

    let bytes = std::fs::read(tmp.path()).context("Failed to read archive")?;
    Ok(bytes)
}

/// Unpack-and-build shell line run on the build host. The archive is
/// removed afterwards either way.
fn remote_build_script(dir: &str, archive: &str, tag: &str, cache: bool) -> String {
    let no_cache = if cache { "" } else { " --no-cache" };
    format!(
        "rm -rf {dir} && mkdir -p {dir} && tar -xzf {archive} -C {dir} && \
         docker build{no_cache} -t {tag} {dir}; status=$?; rm -f {archive}; exit $status",
        dir = dir,
        archive = archive,
        tag = tag,
        no_cache = no_cache,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_script_cleans_up_archive_on_both_paths() {
        let script = remote_build_script(
            "/opt/blog/build/api",
            "/opt/blog/build/api.tar.gz",
            "blog/api:9f8e7d6",
            true,
        );
        assert!(script.contains("tar -xzf /opt/blog/build/api.tar.gz"));
        assert!(script.contains("docker build -t blog/api:9f8e7d6"));
        assert!(script.contains("rm -f /opt/blog/build/api.tar.gz"));
        assert!(script.contains("exit $status"));
    }

    #[test]
    fn cache_disabled_adds_no_cache() {
        let script = remote_build_script("/d", "/a.tar.gz", "t:1", false);
        assert!(script.contains("docker build --no-cache -t t:1"));
    }

    #[test]
    fn archiving_a_real_directory_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let archive = archive_context(dir.path()).unwrap();
        // gzip magic
        assert_eq!(&archive[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn missing_context_is_an_error() {
        assert!(archive_context(Path::new("/no/such/dir")).is_err());
    }
}
