use anyhow::{bail, Result};

use super::{EnvironmentKind, HostPortMode, SwitchyardConfig};

pub fn validate(config: &SwitchyardConfig) -> Result<()> {
    if config.app.name.is_empty() {
        bail!("app.name cannot be empty");
    }

    if !is_valid_name(&config.app.name) {
        bail!(
            "app.name '{}' may only contain lowercase letters, digits and '-'",
            config.app.name
        );
    }

    for (role, host) in [("app", &config.hosts.app), ("proxy", &config.hosts.proxy)] {
        if host.address.is_empty() {
            bail!("hosts.{}.address cannot be empty", role);
        }
    }

    let ports = &config.ports;
    if ports.start == 0 || ports.start > ports.end {
        bail!(
            "ports range {}-{} is invalid (start must be non-zero and <= end)",
            ports.start,
            ports.end
        );
    }
    if ports.max_attempts == 0 {
        bail!("ports.max_attempts must be greater than zero");
    }

    if config.proxy.upstream_dir.is_empty() {
        bail!("proxy.upstream_dir cannot be empty");
    }

    for (name, env) in &config.environments {
        if !is_valid_name(name) {
            bail!(
                "Environment '{}' may only contain lowercase letters, digits and '-'",
                name
            );
        }

        if env.kind == EnvironmentKind::Static {
            continue;
        }

        if env.image.is_empty() {
            bail!("Environment '{}' has no image defined", name);
        }
        if env.container_port == 0 {
            bail!("Environment '{}' has no container_port defined", name);
        }
        if env.host_port == HostPortMode::Fixed(0) {
            bail!("Environment '{}' host_port cannot be 0", name);
        }
        if env.health_check.retries == 0 {
            bail!("Environment '{}' health_check.retries must be at least 1", name);
        }
        if env.network.is_empty() {
            bail!("Environment '{}' network cannot be empty", name);
        }
    }

    Ok(())
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
