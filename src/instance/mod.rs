//! Deployment instances: one container per environment per deploy run.
//!
//! Instances are found again through the labels written into their compose
//! file, so no local state is needed to know what is running.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{HostRole, SwitchyardConfig};
use crate::error::Result;
use crate::exec::{shell, Executor};

pub const LABEL_APP: &str = "switchyard.app";
pub const LABEL_ENVIRONMENT: &str = "switchyard.environment";
pub const LABEL_INSTANCE: &str = "switchyard.instance";

/// `<environment>-<UTC creation timestamp>`; sorts by creation time within an environment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(environment: &str) -> Self {
        Self::at(environment, Utc::now())
    }

    pub fn at(environment: &str, created: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", environment, created.format("%Y%m%d-%H%M%S-%6f")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn container_name(&self, app: &str) -> String {
        format!("{}-{}", app, self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Healthy,
    /// Serving traffic through the upstream record.
    Active,
    /// Being stopped after a failed run.
    Draining,
    Removed,
}

#[derive(Debug, Clone)]
pub struct DeploymentInstance {
    pub id: InstanceId,
    pub environment: String,
    pub container: String,
    pub host_port: u16,
    pub image: String,
    pub state: InstanceState,
}

impl DeploymentInstance {
    pub fn transition(&mut self, state: InstanceState) {
        debug!("{}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }
}

/// A container of this app as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveContainer {
    pub name: String,
    pub environment: String,
    pub instance: String,
    pub running: bool,
    /// `Ports` column as printed by the runtime, e.g. `0.0.0.0:30042->3000/tcp`.
    pub ports: String,
}

impl LiveContainer {
    /// Host ports bound to anything.
    pub fn published_ports(&self) -> Vec<u16> {
        self.ports
            .split(", ")
            .filter_map(|binding| binding.split_once("->"))
            .filter_map(|(host, _)| host.rsplit(':').next())
            .filter_map(|port| port.parse().ok())
            .collect()
    }

    /// Host port bound to `container_port`, empty when it is not published.
    pub fn published_port_for(&self, container_port: u16) -> String {
        let suffix = format!("->{}/tcp", container_port);
        self.ports
            .split(", ")
            .filter_map(|binding| binding.strip_suffix(&suffix))
            .filter_map(|host| host.rsplit(':').next())
            .find(|port| !port.is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsRow {
    names: String,
    #[serde(default)]
    labels: String,
    #[serde(default)]
    ports: String,
    #[serde(default)]
    state: String,
}

pub fn list_command(app: &str) -> String {
    format!(
        "docker ps -a --no-trunc --filter label={}={} --format '{{{{json .}}}}'",
        LABEL_APP, app
    )
}

/// Parse `docker ps --format '{{json .}}'` output, one object per line.
pub fn parse_ps(output: &str) -> Vec<LiveContainer> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<PsRow>(line) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!("Skipping unparseable container row: {}", e);
                None
            }
        })
        .map(|row| {
            let label = |key: &str| {
                row.labels
                    .split(',')
                    .filter_map(|kv| kv.split_once('='))
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_default()
            };
            LiveContainer {
                environment: label(LABEL_ENVIRONMENT),
                instance: label(LABEL_INSTANCE),
                running: row.state == "running",
                name: row.names.clone(),
                ports: row.ports.clone(),
            }
        })
        .collect()
}

/// Every container of the app, running or not.
pub async fn list(exec: &Executor, config: &SwitchyardConfig) -> Result<Vec<LiveContainer>> {
    let stdout = exec
        .run_checked(HostRole::App, &list_command(&config.app.name))
        .await?;
    Ok(parse_ps(&stdout))
}

/// The newest running instance of `environment`, if any.
pub fn newest_running<'a>(
    containers: &'a [LiveContainer],
    environment: &str,
) -> Option<&'a LiveContainer> {
    containers
        .iter()
        .filter(|c| c.running && c.environment == environment)
        .max_by(|a, b| a.instance.cmp(&b.instance))
}

/// Ask the runtime which host port `container_port` of `container` is published on.
pub async fn published_port(
    exec: &Executor,
    container: &str,
    container_port: u16,
) -> Result<String> {
    let cmd = format!(
        "docker port {} {}/tcp",
        shell::quote(container),
        container_port
    );
    let out = exec.run(HostRole::App, &cmd).await?;
    if !out.success() {
        debug!("{} publishes nothing for {}", container, container_port);
        return Ok(String::new());
    }
    Ok(parse_docker_port(&out.stdout))
}

/// First host port in `docker port` output (`0.0.0.0:30042` / `[::]:30042`).
pub fn parse_docker_port(output: &str) -> String {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or_default()
        .to_string()
}

/// Stop gracefully, then force-remove the container and its compose directory.
pub async fn teardown(
    exec: &Executor,
    container: &str,
    instance_dir: Option<&str>,
    grace_period: u64,
) -> Result<()> {
    let name = shell::quote(container);
    let stopped = exec
        .run_ok(
            HostRole::App,
            &format!("docker stop -t {} {}", grace_period, name),
        )
        .await?;
    if !stopped {
        debug!("docker stop {} failed, forcing removal", container);
    }

    exec.run_checked(HostRole::App, &format!("docker rm -f {}", name))
        .await?;
    if let Some(dir) = instance_dir {
        exec.run_checked(HostRole::App, &format!("rm -rf -- {}", shell::quote(dir)))
            .await?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::ps_row;
    use super::*;

    #[test]
    fn instance_ids_carry_environment_and_timestamp() {
        let id = InstanceId::new("production");
        assert!(id.as_str().starts_with("production-"));
        assert_eq!(id.as_str().len(), "production-".len() + "20261018-101500-000001".len());
        assert!(id.container_name("testapp").starts_with("testapp-production-"));
    }

    #[test]
    fn instance_ids_keep_creation_order_across_a_clock_change() {
        use chrono::TimeZone;

        // 2026-10-25 01:00 UTC is when central European summer time ends;
        // local wall clocks there jump from 03:00 back to 02:00.
        let before = InstanceId::at("staging", Utc.with_ymd_and_hms(2026, 10, 25, 0, 59, 59).unwrap());
        let after = InstanceId::at("staging", Utc.with_ymd_and_hms(2026, 10, 25, 1, 0, 1).unwrap());

        assert_eq!(before.as_str(), "staging-20261025-005959-000000");
        assert_eq!(after.as_str(), "staging-20261025-010001-000000");
        assert!(before < after);
    }

    #[test]
    fn parses_ps_rows_and_published_ports() {
        let output = format!(
            "{}\n{}\n",
            ps_row(
                "testapp-production-20261001-080000-000000",
                "production",
                "production-20261001-080000-000000",
                "running",
                "0.0.0.0:30040->3000/tcp, [::]:30040->3000/tcp"
            ),
            ps_row(
                "testapp-staging-20261002-080000-000000",
                "staging",
                "staging-20261002-080000-000000",
                "exited",
                ""
            ),
        );

        let containers = parse_ps(&output);
        assert_eq!(containers.len(), 2);

        let prod = &containers[0];
        assert_eq!(prod.environment, "production");
        assert_eq!(prod.instance, "production-20261001-080000-000000");
        assert!(prod.running);
        assert_eq!(prod.published_ports(), vec![30040, 30040]);
        assert_eq!(prod.published_port_for(3000), "30040");
        assert_eq!(prod.published_port_for(8080), "");

        let staging = &containers[1];
        assert!(!staging.running);
        assert!(staging.published_ports().is_empty());
    }

    #[test]
    fn newest_running_prefers_latest_instance_id() {
        let output = [
            ps_row("a", "production", "production-20261001-080000-000000", "running", ""),
            ps_row("b", "production", "production-20261003-080000-000000", "running", ""),
            ps_row("c", "production", "production-20261005-080000-000000", "exited", ""),
            ps_row("d", "staging", "staging-20261009-080000-000000", "running", ""),
        ]
        .join("\n");
        let containers = parse_ps(&output);

        assert_eq!(newest_running(&containers, "production").unwrap().name, "b");
        assert!(newest_running(&containers, "qa").is_none());
    }

    #[test]
    fn parses_docker_port_output() {
        assert_eq!(parse_docker_port("0.0.0.0:30042\n[::]:30042\n"), "30042");
        assert_eq!(parse_docker_port(""), "");
    }

    #[test]
    fn list_command_filters_by_app_label() {
        assert_eq!(
            list_command("testapp"),
            "docker ps -a --no-trunc --filter label=switchyard.app=testapp --format '{{json .}}'"
        );
    }
}
