//! Upstream records: the proxy-side file naming the one `host:port` an
//! environment's traffic goes to.
//!
//! A record is only ever replaced whole (temp file + move), validated by the
//! proxy before any reload, and restored from the previous content when the
//! proxy rejects it.

use tracing::{debug, info, warn};

use crate::config::{HostRole, SwitchyardConfig};
use crate::error::{Error, Result};
use crate::exec::{checked, shell, Executor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl UpstreamRecord {
    pub fn render(&self) -> String {
        format!(
            "upstream {} {{\n    server {}:{};\n}}\n",
            self.name, self.host, self.port
        )
    }
}

/// The `host:port` of the record's server line, if it has exactly one.
pub fn parse_target(content: &str) -> Option<(String, String)> {
    let mut targets = content.lines().filter_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix("server ")?;
        let target = rest.split(|c: char| c == ';' || c.is_whitespace()).next()?;
        let (host, port) = target.rsplit_once(':')?;
        Some((host.to_string(), port.to_string()))
    });

    let first = targets.next()?;
    if targets.next().is_some() {
        return None;
    }
    Some(first)
}

/// Port declared by a record's content; empty when there is none.
pub fn declared_port(content: Option<&str>) -> String {
    content
        .and_then(parse_target)
        .map(|(_, port)| port)
        .unwrap_or_default()
}

/// True only when both sides are non-empty and textually equal.
pub fn ports_match(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && a == b
}

/// Remote operations on one environment's record.
pub struct Upstream<'a> {
    exec: &'a Executor,
    config: &'a SwitchyardConfig,
    environment: &'a str,
    path: String,
}

impl<'a> Upstream<'a> {
    pub fn new(exec: &'a Executor, config: &'a SwitchyardConfig, environment: &'a str) -> Self {
        Self {
            exec,
            config,
            environment,
            path: config.upstream_path(environment),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn record_for(&self, port: u16) -> UpstreamRecord {
        UpstreamRecord {
            name: self.config.upstream_name(self.environment),
            host: self.config.hosts.app.reachable_address().to_string(),
            port,
        }
    }

    /// Current content, or `None` when no record exists yet.
    pub async fn read(&self) -> Result<Option<String>> {
        let out = self
            .exec
            .run(HostRole::Proxy, &shell::read_file(&self.path))
            .await?;
        if out.success() {
            Ok(Some(out.stdout))
        } else {
            debug!("No upstream record at {}", self.path);
            Ok(None)
        }
    }

    pub async fn replace(&self, content: &str) -> Result<()> {
        let cmd = shell::atomic_write(&self.path, content, self.config.proxy.sudo);
        self.exec.run_checked(HostRole::Proxy, &cmd).await?;
        Ok(())
    }

    /// Put back what [`Upstream::read`] returned before a change.
    pub async fn restore(&self, previous: Option<&str>) -> Result<()> {
        match previous {
            Some(content) => {
                info!("Restoring previous upstream record at {}", self.path);
                self.replace(content).await
            }
            None => {
                info!("Removing upstream record at {} (none existed before)", self.path);
                let cmd = shell::remove_file(&self.path, self.config.proxy.sudo);
                self.exec.run_checked(HostRole::Proxy, &cmd).await?;
                Ok(())
            }
        }
    }

    /// Ask the proxy whether its merged configuration is acceptable.
    pub async fn validate(&self) -> Result<()> {
        let out = self
            .exec
            .run(HostRole::Proxy, &self.config.proxy.validate_cmd)
            .await?;
        if out.success() {
            return Ok(());
        }

        let output = format!("{}{}", out.stdout, out.stderr).trim().to_string();
        warn!("Proxy validation failed for {}: {}", self.environment, output);
        Err(Error::ConfigValidationFailed {
            environment: self.environment.to_string(),
            output,
        })
    }

    pub async fn reload(&self) -> Result<()> {
        let cmd = &self.config.proxy.reload_cmd;
        let out = self.exec.run(HostRole::Proxy, cmd).await?;
        checked(HostRole::Proxy, cmd, out)?;
        Ok(())
    }
}

/// Ports referenced by any record of this app on the proxy.
pub async fn referenced_ports(
    exec: &Executor,
    config: &SwitchyardConfig,
) -> Result<Vec<u16>> {
    let cmd = format!(
        "cat -- {}/*.conf 2>/dev/null || true",
        shell::quote(&config.upstream_app_dir())
    );
    let stdout = exec.run_checked(HostRole::Proxy, &cmd).await?;

    Ok(stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("server "))
        .filter_map(|rest| rest.trim_end_matches(';').rsplit(':').next())
        .filter_map(|port| port.trim().parse().ok())
        .collect())
}
