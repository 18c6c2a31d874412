use anyhow::{bail, Result};

use crate::config::{EnvironmentConfig, EnvironmentKind, SwitchyardConfig};
use crate::instance::InstanceId;

/// One environment, resolved from config, for the duration of a run.
pub struct DeployContext<'a> {
    pub config: &'a SwitchyardConfig,
    pub environment: &'a str,
    pub env: &'a EnvironmentConfig,
    pub image: String,
}

impl<'a> DeployContext<'a> {
    pub fn new(config: &'a SwitchyardConfig, environment: &'a str) -> Result<Self> {
        let env = config.environment(environment)?;
        if env.kind != EnvironmentKind::Container {
            bail!(
                "Environment '{}' is of type '{}'; only container environments can be deployed",
                environment,
                env.kind
            );
        }

        Ok(Self {
            config,
            environment,
            env,
            image: env.image.clone(),
        })
    }

    /// Deploy a different image than the configured one for this run.
    pub fn with_image(mut self, image: Option<String>) -> Self {
        if let Some(image) = image {
            self.image = image;
        }
        self
    }

    pub fn app_name(&self) -> &str {
        &self.config.app.name
    }

    pub fn environment_path(&self) -> String {
        format!("{}/{}", self.config.app_path(), self.environment)
    }

    pub fn instance_dir(&self, instance: &str) -> String {
        format!("{}/{}", self.environment_path(), instance)
    }

    pub fn compose_path(&self, id: &InstanceId) -> String {
        format!("{}/docker-compose.yml", self.instance_dir(id.as_str()))
    }

    pub fn project_name(&self, id: &InstanceId) -> String {
        format!("{}-{}", self.app_name(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::sample;

    #[test]
    fn derives_remote_paths() {
        let config = sample();
        let ctx = DeployContext::new(&config, "production").unwrap();
        let id = InstanceId::new("production");

        assert_eq!(ctx.environment_path(), "/var/deploy/testapp/production");
        assert_eq!(
            ctx.compose_path(&id),
            format!("/var/deploy/testapp/production/{}/docker-compose.yml", id)
        );
        assert_eq!(ctx.project_name(&id), format!("testapp-{}", id));
    }

    #[test]
    fn image_override_replaces_configured_image() {
        let config = sample();
        let ctx = DeployContext::new(&config, "production")
            .unwrap()
            .with_image(Some("registry.example.com/testapp:1.5.0".to_string()));
        assert_eq!(ctx.image, "registry.example.com/testapp:1.5.0");
    }

    #[test]
    fn static_environments_cannot_be_deployed() {
        let config = sample();
        assert!(DeployContext::new(&config, "docs").is_err());
    }
}
