use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::compose::Descriptor;
use crate::config::{HostPortMode, HostRole};
use crate::error::{Error, Result};
use crate::exec::{shell, Executor};
use crate::instance::{self, DeploymentInstance, LiveContainer};
use crate::output;
use crate::ports::PortAllocator;
use crate::upstream::{self, declared_port, ports_match, Upstream};

use super::context::DeployContext;

/// What the Allocating phase learned about the host.
pub struct Allocation {
    pub host_port: u16,
    /// Containers of this environment that existed before the run.
    pub previous: Vec<LiveContainer>,
}

pub async fn allocate(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    allocator: &mut PortAllocator,
) -> Result<Allocation> {
    let containers = instance::list(exec, ctx.config).await?;

    let previous: Vec<LiveContainer> = containers
        .iter()
        .filter(|c| c.environment == ctx.environment)
        .cloned()
        .collect();

    let host_port = match ctx.env.host_port {
        HostPortMode::Fixed(port) => {
            debug!("{} pins host port {}", ctx.environment, port);
            port
        }
        HostPortMode::Auto => {
            let mut exclude: BTreeSet<u16> = containers
                .iter()
                .flat_map(LiveContainer::published_ports)
                .collect();
            exclude.extend(upstream::referenced_ports(exec, ctx.config).await?);
            allocator.allocate(exec, HostRole::App, &exclude).await?
        }
    };

    Ok(Allocation {
        host_port,
        previous,
    })
}

/// A pinned host port can only be bound once: stop whichever previous
/// instance holds it. Returns the names of the stopped containers.
pub async fn free_fixed_port(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    previous: &[LiveContainer],
) -> Result<Vec<String>> {
    let HostPortMode::Fixed(port) = ctx.env.host_port else {
        return Ok(Vec::new());
    };

    let mut stopped = Vec::new();
    for container in previous
        .iter()
        .filter(|c| c.running && c.published_ports().contains(&port))
    {
        output::warning(&format!(
            "Port {} is pinned; stopping {} before starting the new instance",
            port, container.name
        ));
        exec.run_checked(
            HostRole::App,
            &format!(
                "docker stop -t {} {}",
                ctx.env.stop_grace_period,
                shell::quote(&container.name)
            ),
        )
        .await?;
        stopped.push(container.name.clone());
    }
    Ok(stopped)
}

/// Bring back containers stopped by [`free_fixed_port`].
pub async fn restart_displaced(exec: &Executor, displaced: &[String]) -> Result<()> {
    for name in displaced {
        exec.run_checked(HostRole::App, &format!("docker start {}", shell::quote(name)))
            .await?;
    }
    Ok(())
}

pub async fn start(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    instance: &DeploymentInstance,
) -> Result<()> {
    let descriptor = Descriptor {
        app_name: ctx.app_name(),
        environment: ctx.environment,
        env: ctx.env,
        instance_id: instance.id.as_str(),
        container_name: &instance.container,
        image: &instance.image,
        host_port: Some(instance.host_port),
    };
    let content = descriptor.render()?;
    let compose_path = ctx.compose_path(&instance.id);

    exec.run_checked(HostRole::App, &shell::write_file(&compose_path, &content))
        .await?;

    exec.run_checked(
        HostRole::App,
        &format!(
            "docker compose -p {} -f {} up -d",
            shell::quote(&ctx.project_name(&instance.id)),
            shell::quote(&compose_path)
        ),
    )
    .await?;

    info!(
        "Started {} on host port {} ({})",
        instance.container, instance.host_port, descriptor.port_mapping()
    );
    Ok(())
}

pub async fn health_check(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    instance: &DeploymentInstance,
) -> Result<()> {
    let hc = &ctx.env.health_check;
    let spinner = output::create_spinner(&format!(
        "Waiting for {} to become healthy ...",
        instance.container
    ));

    let mut last = String::from("no response");
    for attempt in 1..=hc.retries {
        debug!("Health check attempt {}/{}", attempt, hc.retries);

        match probe(ctx, exec, instance).await {
            Ok(Probe::Healthy) => {
                spinner.finish_and_clear();
                return Ok(());
            }
            Ok(Probe::Unhealthy(detail)) => {
                spinner.finish_and_clear();
                return Err(Error::HealthCheckFailed {
                    instance: instance.id.to_string(),
                    attempts: attempt,
                    last: detail,
                });
            }
            Ok(Probe::Waiting(detail)) => {
                debug!("{} not healthy yet: {}", instance.container, detail);
                last = detail;
            }
            Err(e) => {
                spinner.finish_and_clear();
                return Err(e);
            }
        }

        if attempt < hc.retries {
            tokio::time::sleep(Duration::from_secs(hc.interval)).await;
        }
    }

    spinner.finish_and_clear();
    Err(Error::HealthCheckFailed {
        instance: instance.id.to_string(),
        attempts: hc.retries,
        last,
    })
}

enum Probe {
    Healthy,
    Waiting(String),
    Unhealthy(String),
}

async fn probe(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    instance: &DeploymentInstance,
) -> Result<Probe> {
    let hc = &ctx.env.health_check;

    if hc.cmd.is_some() {
        let out = exec
            .run(
                HostRole::App,
                &format!(
                    "docker inspect --format '{{{{.State.Health.Status}}}}' {}",
                    shell::quote(&instance.container)
                ),
            )
            .await?;
        let status = out.stdout.trim().to_string();
        return Ok(match status.as_str() {
            "healthy" => Probe::Healthy,
            "unhealthy" => Probe::Unhealthy("container reported unhealthy".to_string()),
            "" => Probe::Waiting(out.stderr.trim().to_string()),
            other => Probe::Waiting(format!("status {}", other)),
        });
    }

    let url = format!("http://127.0.0.1:{}{}", instance.host_port, hc.path);
    let out = exec
        .run(
            HostRole::App,
            &format!(
                "curl -fsS -o /dev/null --max-time {} {}",
                hc.timeout,
                shell::quote(&url)
            ),
        )
        .await?;

    Ok(if out.success() {
        Probe::Healthy
    } else {
        Probe::Waiting(format!("{} (exit {}) {}", url, out.exit_code, out.stderr.trim()))
    })
}

/// Replace the record so it targets `port`, then have the proxy validate it.
///
/// If validation fails, `previous` is written back before the error is returned.
/// When that write fails too, [`Error::RestoreFailed`] carries both errors.
pub async fn apply_record(
    upstream: &Upstream<'_>,
    port: u16,
    previous: Option<&str>,
) -> Result<()> {
    let record = upstream.record_for(port);
    upstream.replace(&record.render()).await?;

    if let Err(rejected) = upstream.validate().await {
        if let Err(e) = upstream.restore(previous).await {
            warn!("Proxy rejected {} and restoring it failed: {}", upstream.path(), e);
            return Err(Error::RestoreFailed {
                path: upstream.path().to_string(),
                rejected: Box::new(rejected),
                source: Box::new(e),
            });
        }
        return Err(rejected);
    }

    debug!("{} now targets {}:{}", upstream.path(), record.host, port);
    Ok(())
}

/// Reload the proxy, then compare the record against the runtime's published port.
pub async fn verify(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    upstream: &Upstream<'_>,
    container: &str,
) -> Result<String> {
    upstream.reload().await?;

    let declared = declared_port(upstream.read().await?.as_deref());
    let actual = instance::published_port(exec, container, ctx.env.container_port).await?;

    if !ports_match(&declared, &actual) {
        return Err(Error::VerificationMismatch {
            environment: ctx.environment.to_string(),
            declared,
            actual,
        });
    }
    Ok(actual)
}

/// Stop and remove every previous container. Failures are returned, not raised:
/// traffic has already moved by the time this runs.
pub async fn retire_previous(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    previous: &[LiveContainer],
) -> Vec<(String, Error)> {
    let mut failures = Vec::new();
    for container in previous {
        debug!("Retiring {} ({})", container.name, container.instance);
        // unlabelled containers have no directory of ours to remove
        let dir = (!container.instance.is_empty()).then(|| ctx.instance_dir(&container.instance));
        if let Err(e) = instance::teardown(
            exec,
            &container.name,
            dir.as_deref(),
            ctx.env.stop_grace_period,
        )
        .await
        {
            failures.push((container.name.clone(), e));
        }
    }
    failures
}
