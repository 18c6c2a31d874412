use anyhow::{bail, Result};

use crate::config::SwitchyardConfig;
use crate::exec::Executor;
use crate::output;
use crate::sync::{self, SyncOutcome};

pub async fn run(
    config: &SwitchyardConfig,
    exec: &mut Executor,
    environment: Option<&str>,
    force: bool,
) -> Result<()> {
    output::header(&format!("Syncing upstreams for {}", config.app.name));

    let results = match environment {
        Some(env) => vec![(env.to_string(), sync::sync(exec, config, env, force).await)],
        None => sync::sync_all(exec, config, force).await,
    };

    let mut failed = 0;
    for (env, result) in &results {
        match result {
            Ok(outcome @ SyncOutcome::InSync { .. }) => {
                output::success(&format!("{}: {}", env, outcome))
            }
            Ok(outcome @ SyncOutcome::Repaired { .. }) => {
                output::warning(&format!("{}: {}", env, outcome))
            }
            Err(e) => {
                failed += 1;
                output::error(&format!("{}: {}", env, e));
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} environment(s) could not be synced", failed, results.len());
    }
    Ok(())
}
