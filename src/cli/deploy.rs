use anyhow::Result;

use crate::config::SwitchyardConfig;
use crate::deploy;
use crate::deploy::context::DeployContext;
use crate::exec::Executor;
use crate::ports::PortAllocator;

pub async fn run(
    config: &SwitchyardConfig,
    exec: &Executor,
    environment: &str,
    image: Option<String>,
) -> Result<()> {
    let ctx = DeployContext::new(config, environment)?.with_image(image);
    let mut allocator = PortAllocator::from_config(&config.ports);

    deploy::run(&ctx, exec, &mut allocator).await?;
    Ok(())
}
