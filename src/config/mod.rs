use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

mod validate;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SwitchyardConfig {
    pub app: AppConfig,
    pub hosts: HostsConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub name: String,
    #[serde(default = "default_deploy_to")]
    pub deploy_to: String,
}

fn default_deploy_to() -> String {
    "/var/deploy".to_string()
}

/// The two machines a cutover touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    /// Runs the container runtime.
    App,
    /// Runs the reverse proxy and holds the upstream records.
    Proxy,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::App => f.write_str("app"),
            HostRole::Proxy => f.write_str("proxy"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostsConfig {
    pub app: HostConfig,
    pub proxy: HostConfig,
}

impl HostsConfig {
    pub fn get(&self, role: HostRole) -> &HostConfig {
        match role {
            HostRole::App => &self.app,
            HostRole::Proxy => &self.proxy,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostConfig {
    pub address: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Address the proxy uses to reach ports published on this host.
    pub private_address: Option<String>,
}

impl HostConfig {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("deploy")
    }

    pub fn reachable_address(&self) -> &str {
        self.private_address.as_deref().unwrap_or(&self.address)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_command_timeout() -> u64 {
    120
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PortsConfig {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_port_start() -> u16 {
    30000
}
fn default_port_end() -> u16 {
    32767
}
fn default_max_attempts() -> u32 {
    50
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxyConfig {
    #[serde(default = "default_upstream_dir")]
    pub upstream_dir: String,
    #[serde(default = "default_validate_cmd")]
    pub validate_cmd: String,
    #[serde(default = "default_reload_cmd")]
    pub reload_cmd: String,
    #[serde(default = "default_true")]
    pub sudo: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_dir: default_upstream_dir(),
            validate_cmd: default_validate_cmd(),
            reload_cmd: default_reload_cmd(),
            sudo: true,
        }
    }
}

fn default_upstream_dir() -> String {
    "/etc/nginx/upstreams".to_string()
}
fn default_validate_cmd() -> String {
    "sudo nginx -t".to_string()
}
fn default_reload_cmd() -> String {
    "sudo nginx -s reload".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    #[default]
    Container,
    Static,
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentKind::Container => f.write_str("container"),
            EnvironmentKind::Static => f.write_str("static"),
        }
    }
}

/// Host-side binding of the container port: picked per deploy, or pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawHostPort", into = "RawHostPort")]
pub enum HostPortMode {
    #[default]
    Auto,
    Fixed(u16),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawHostPort {
    Number(u16),
    Text(String),
}

impl TryFrom<RawHostPort> for HostPortMode {
    type Error = String;

    fn try_from(raw: RawHostPort) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawHostPort::Number(port) => Ok(HostPortMode::Fixed(port)),
            RawHostPort::Text(text) if text == "auto" => Ok(HostPortMode::Auto),
            RawHostPort::Text(text) => text
                .parse::<u16>()
                .map(HostPortMode::Fixed)
                .map_err(|_| format!("host_port must be a port number or \"auto\", got '{}'", text)),
        }
    }
}

impl From<HostPortMode> for RawHostPort {
    fn from(mode: HostPortMode) -> Self {
        match mode {
            HostPortMode::Auto => RawHostPort::Text("auto".to_string()),
            HostPortMode::Fixed(port) => RawHostPort::Number(port),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnvironmentConfig {
    #[serde(default, rename = "type")]
    pub kind: EnvironmentKind,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub container_port: u16,
    #[serde(default)]
    pub host_port: HostPortMode,
    pub env_file: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_restart")]
    pub restart: String,
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

fn default_network() -> String {
    "switchyard".to_string()
}
fn default_restart() -> String {
    "unless-stopped".to_string()
}
fn default_stop_grace_period() -> u64 {
    30
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_driver")]
    pub driver: String,
    #[serde(default = "default_log_max_size")]
    pub max_size: String,
    #[serde(default = "default_log_max_file")]
    pub max_file: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            driver: default_log_driver(),
            max_size: default_log_max_size(),
            max_file: default_log_max_file(),
        }
    }
}

fn default_log_driver() -> String {
    "json-file".to_string()
}
fn default_log_max_size() -> String {
    "10m".to_string()
}
fn default_log_max_file() -> u32 {
    3
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Runs inside the container; when set, the runtime's own health status is polled.
    pub cmd: Option<String>,
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
    pub start_period: Option<u64>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            cmd: None,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            retries: default_health_retries(),
            start_period: None,
        }
    }
}

fn default_health_path() -> String {
    "/health".to_string()
}
fn default_health_interval() -> u64 {
    2
}
fn default_health_timeout() -> u64 {
    5
}
fn default_health_retries() -> u32 {
    15
}

impl SwitchyardConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        validate::validate(&config)?;
        Ok(config)
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments
            .get(name)
            .with_context(|| format!("Environment '{}' not found in config", name))
    }

    pub fn app_path(&self) -> String {
        format!("{}/{}", self.app.deploy_to, self.app.name)
    }

    pub fn upstream_app_dir(&self) -> String {
        format!("{}/{}", self.proxy.upstream_dir, self.app.name)
    }

    pub fn upstream_path(&self, environment: &str) -> String {
        format!("{}/{}.conf", self.upstream_app_dir(), environment)
    }

    /// Backend name declared inside the upstream record.
    pub fn upstream_name(&self, environment: &str) -> String {
        format!("{}_{}", self.app.name, environment).replace('-', "_")
    }
}
