use anyhow::Result;

use crate::config::SwitchyardConfig;
use crate::exec::Executor;
use crate::output;
use crate::sync;

/// Read-only report: the same observation sync makes, without reconciling.
pub async fn run(
    config: &SwitchyardConfig,
    exec: &mut Executor,
    environment: Option<&str>,
) -> Result<()> {
    let environments = match environment {
        Some(env) => {
            sync::ensure_container(config, env)?;
            vec![env]
        }
        None => sync::container_environments(config),
    };

    output::header(&format!("Status of {}", config.app.name));
    println!("  {:<16} {:>8} {:>8}  state", "environment", "upstream", "live");

    for (env, observation) in sync::observe(exec, config, &environments).await {
        match observation {
            Ok(obs) => {
                let verdict = match (&obs.container, obs.in_sync()) {
                    (None, _) => "no running instance".to_string(),
                    (Some(container), true) => format!("in sync ({})", container),
                    (Some(container), false) => format!("DRIFT ({})", container),
                };
                output::report_row(&env, &obs.declared, &obs.actual, &verdict);
                if obs.instances > 1 {
                    output::info(&format!("{}: {} instances present", env, obs.instances));
                }
            }
            Err(e) => output::error(&format!("{}: {}", env, e)),
        }
    }
    Ok(())
}
