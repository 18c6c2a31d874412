use anyhow::{Context, Result};
use minijinja::Environment;

use crate::config::{EnvironmentConfig, HostPortMode};

const COMPOSE_TEMPLATE: &str = include_str!("../../templates/docker-compose.yml.j2");

/// Everything needed to render one instance's compose file.
pub struct Descriptor<'a> {
    pub app_name: &'a str,
    pub environment: &'a str,
    pub env: &'a EnvironmentConfig,
    pub instance_id: &'a str,
    pub container_name: &'a str,
    pub image: &'a str,
    /// Host port chosen for this run; falls back to the environment's pinned port.
    pub host_port: Option<u16>,
}

impl Descriptor<'_> {
    /// `host:container`, or the bare container port when nothing is bound host-side.
    pub fn port_mapping(&self) -> String {
        let host_port = self.host_port.or(match self.env.host_port {
            HostPortMode::Fixed(port) => Some(port),
            HostPortMode::Auto => None,
        });

        match host_port {
            Some(port) => format!("{}:{}", port, self.env.container_port),
            None => self.env.container_port.to_string(),
        }
    }

    pub fn render(&self) -> Result<String> {
        let hc = &self.env.health_check;
        let health_cmd = hc
            .cmd
            .as_deref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode health check command")?;

        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_template("compose", COMPOSE_TEMPLATE)
            .context("Failed to load compose template")?;

        let tmpl = env
            .get_template("compose")
            .context("Compose template missing")?;
        let rendered = tmpl
            .render(minijinja::context! {
                app_name => self.app_name,
                environment => self.environment,
                service => self.environment,
                instance_id => self.instance_id,
                container_name => self.container_name,
                image => self.image,
                restart => &self.env.restart,
                stop_grace_period => self.env.stop_grace_period,
                port_mapping => self.port_mapping(),
                env_file => &self.env.env_file,
                network => &self.env.network,
                log_driver => &self.env.logging.driver,
                log_max_size => &self.env.logging.max_size,
                log_max_file => self.env.logging.max_file,
                health_cmd => health_cmd,
                health_interval => hc.interval,
                health_timeout => hc.timeout,
                health_retries => hc.retries,
                health_start_period => hc.start_period,
            })
            .context("Failed to render compose template")?;

        Ok(rendered)
    }
}
