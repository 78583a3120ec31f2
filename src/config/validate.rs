use anyhow::Result;

use super::ProjectConfig;
use crate::error::TakoError;

fn fail(msg: String) -> Result<()> {
    Err(TakoError::Config(msg).into())
}

pub fn validate(config: &ProjectConfig) -> Result<()> {
    if config.name.is_empty() {
        return fail("name cannot be empty".into());
    }

    if config.servers.is_empty() {
        return fail("no servers defined".into());
    }

    for (name, server) in &config.servers {
        if server.host.is_empty() {
            return fail(format!("server '{}' has an empty host", name));
        }
        if server.user.is_empty() {
            return fail(format!("server '{}' has an empty user", name));
        }
    }

    for (env_name, env) in &config.environments {
        if env.servers.is_empty() {
            return fail(format!("environment '{}' has no servers", env_name));
        }

        for server in &env.servers {
            if !config.servers.contains_key(server) {
                return fail(format!(
                    "environment '{}' references unknown server '{}'",
                    env_name, server
                ));
            }
        }

        for (svc_name, svc) in &env.services {
            if svc.image.is_none() && svc.build.is_none() {
                return fail(format!(
                    "service '{}' in '{}' needs either image or build",
                    svc_name, env_name
                ));
            }
            if svc.image.is_some() && svc.build.is_some() {
                return fail(format!(
                    "service '{}' in '{}' has both image and build",
                    svc_name, env_name
                ));
            }

            for dep in &svc.depends_on {
                if !env.services.contains_key(dep) {
                    return fail(format!(
                        "service '{}' in '{}' depends on unknown service '{}'",
                        svc_name, env_name, dep
                    ));
                }
            }

            if let Some(proxy) = &svc.proxy {
                if proxy.domains.is_empty() {
                    return fail(format!(
                        "service '{}' in '{}' has a proxy with no domains",
                        svc_name, env_name
                    ));
                }
            }

            if let Some(placement) = &svc.placement {
                for server in &placement.servers {
                    if !config.servers.contains_key(server) {
                        return fail(format!(
                            "service '{}' in '{}' pins to unknown server '{}'",
                            svc_name, env_name, server
                        ));
                    }
                }
            }

            for secret in &svc.secrets {
                let key = secret.split_once(':').map(|(k, _)| k).unwrap_or(secret);
                if key.is_empty() {
                    return fail(format!(
                        "service '{}' in '{}' has an empty secret name",
                        svc_name, env_name
                    ));
                }
            }
        }
    }

    Ok(())
}
