//! Zero-downtime cutover for one container environment.
//!
//! A run walks `Allocating -> Starting -> HealthChecking -> Switching ->
//! Verifying -> Committed`. Any failure before `Committed` moves to
//! `RolledBack`: the new instance is removed and, once the upstream record
//! has been touched, the previous record is put back. The previous instance
//! keeps serving until traffic has provably moved.

pub mod context;
pub mod steps;

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::error::Error;
use crate::exec::Executor;
use crate::instance::{self, DeploymentInstance, InstanceId, InstanceState};
use crate::output;
use crate::ports::PortAllocator;
use crate::upstream::Upstream;

use context::DeployContext;

const TOTAL_STEPS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Allocating,
    Starting,
    HealthChecking,
    Switching,
    Verifying,
    Committed,
    RolledBack,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Allocating => "allocating",
            Phase::Starting => "starting",
            Phase::HealthChecking => "health checking",
            Phase::Switching => "switching",
            Phase::Verifying => "verifying",
            Phase::Committed => "committed",
            Phase::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// What was done to undo a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Failed before anything changed on either host.
    NothingChanged,
    /// New instance removed; the upstream record was never touched.
    RolledBack,
    /// Previous upstream record put back and the new instance removed.
    Restored,
    /// The previous record could not be put back, so the new instance stays up.
    LeftAsIs,
}

impl fmt::Display for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            Recovery::NothingChanged => "nothing to undo",
            Recovery::RolledBack => "rolled back: new instance removed, upstream untouched",
            Recovery::Restored => "restored previous upstream record and removed new instance",
            Recovery::LeftAsIs => {
                "left as-is: previous upstream record could not be restored, new instance kept running"
            }
        };
        f.write_str(action)
    }
}

#[derive(Debug, Error)]
#[error("deploy of '{environment}' failed while {phase} ({recovery})")]
pub struct DeployError {
    pub environment: String,
    pub phase: Phase,
    pub recovery: Recovery,
    /// The instance this run started, in the state the rollback left it.
    pub instance: Option<DeploymentInstance>,
    #[source]
    pub source: Error,
}

/// Deploy `ctx.image` to `ctx.environment`.
pub async fn run(
    ctx: &DeployContext<'_>,
    exec: &Executor,
    allocator: &mut PortAllocator,
) -> Result<DeploymentInstance, DeployError> {
    output::header(&format!(
        "Deploying {} to {} ({})",
        ctx.app_name(),
        ctx.environment,
        ctx.image
    ));

    let mut cutover = Cutover::new(ctx, exec);
    let driven = cutover.drive(allocator).await;
    match driven {
        Ok(instance) => {
            println!();
            output::success(&format!(
                "Deploy complete! {} is live in {} on port {} ({}).",
                instance.image, instance.environment, instance.host_port, instance.id
            ));
            Ok(instance)
        }
        Err(e) => Err(cutover.abort(e).await),
    }
}

/// Bookkeeping for one run, so a failure knows what to undo.
struct Cutover<'c, 'a> {
    ctx: &'c DeployContext<'a>,
    exec: &'c Executor,
    upstream: Upstream<'c>,
    phase: Phase,
    step: usize,
    /// Snapshot of the new instance, set once `docker compose up` has been issued.
    candidate: Option<DeploymentInstance>,
    /// Previous containers stopped to free a pinned port.
    displaced: Vec<String>,
    /// Record content read before switching; `Some(None)` means there was none.
    previous_record: Option<Option<String>>,
}

impl<'c, 'a> Cutover<'c, 'a> {
    fn new(ctx: &'c DeployContext<'a>, exec: &'c Executor) -> Self {
        Self {
            ctx,
            exec,
            upstream: Upstream::new(exec, ctx.config, ctx.environment),
            phase: Phase::Allocating,
            step: 0,
            candidate: None,
            displaced: Vec::new(),
            previous_record: None,
        }
    }

    fn enter(&mut self, phase: Phase, msg: &str) {
        info!("{}: {} -> {}", self.ctx.environment, self.phase, phase);
        self.phase = phase;
        self.step += 1;
        output::step(self.step, TOTAL_STEPS, msg);
    }

    async fn drive(&mut self, allocator: &mut PortAllocator) -> Result<DeploymentInstance, Error> {
        let (ctx, exec) = (self.ctx, self.exec);

        // Step 1: pick the host port and a fresh instance id
        self.enter(Phase::Allocating, "Allocating host port");
        let allocation = steps::allocate(ctx, exec, allocator).await?;
        let id = InstanceId::new(ctx.environment);
        let mut instance = DeploymentInstance {
            container: id.container_name(ctx.app_name()),
            id,
            environment: ctx.environment.to_string(),
            host_port: allocation.host_port,
            image: ctx.image.clone(),
            state: InstanceState::Starting,
        };
        output::info(&format!(
            "Instance {} on host port {}",
            instance.id, instance.host_port
        ));

        // Step 2: start it next to whatever is serving now
        self.enter(Phase::Starting, &format!("Starting {}", instance.container));
        self.displaced = steps::free_fixed_port(ctx, exec, &allocation.previous).await?;
        self.candidate = Some(instance.clone());
        steps::start(ctx, exec, &instance).await?;

        // Step 3: traffic has not moved yet
        self.enter(Phase::HealthChecking, "Running health check");
        steps::health_check(ctx, exec, &instance).await?;
        instance.transition(InstanceState::Healthy);
        self.candidate = Some(instance.clone());
        output::success("Health check passed");

        // Step 4: swap the upstream record
        self.enter(Phase::Switching, "Switching upstream");
        let previous = self.upstream.read().await?;
        self.previous_record = Some(previous.clone());
        steps::apply_record(&self.upstream, instance.host_port, previous.as_deref()).await?;

        // Step 5
        self.enter(Phase::Verifying, "Reloading proxy and verifying");
        let port = steps::verify(ctx, exec, &self.upstream, &instance.container).await?;
        instance.transition(InstanceState::Active);
        output::success(&format!("Upstream and instance agree on port {}", port));

        // Step 6: past this point failures are cleanup only
        self.enter(Phase::Committed, "Retiring previous instances");
        for (container, e) in steps::retire_previous(ctx, exec, &allocation.previous).await {
            warn!("Failed to retire {}: {}", container, e);
            output::warning(&format!(
                "Could not remove previous instance {} ({}); remove it manually",
                container, e
            ));
        }

        Ok(instance)
    }

    async fn abort(mut self, source: Error) -> DeployError {
        let failed_in = self.phase;
        info!("{}: {} -> {}", self.ctx.environment, failed_in, Phase::RolledBack);
        self.phase = Phase::RolledBack;

        let recovery = self.undo(failed_in, &source).await;
        output::failure(&failed_in.to_string(), &recovery.to_string());

        DeployError {
            environment: self.ctx.environment.to_string(),
            phase: failed_in,
            recovery,
            instance: self.candidate.take(),
            source,
        }
    }

    async fn undo(&mut self, failed_in: Phase, source: &Error) -> Recovery {
        let mut recovery = Recovery::NothingChanged;

        if let Some(previous) = self.previous_record.take() {
            // apply_record has already tried to put a rejected record back
            let unrestored = match source {
                Error::ConfigValidationFailed { .. } => None,
                Error::RestoreFailed { source: e, .. } => Some(e.to_string()),
                _ => self
                    .restore_record(previous.as_deref(), failed_in == Phase::Verifying)
                    .await
                    .err()
                    .map(|e| e.to_string()),
            };
            if let Some(e) = unrestored {
                warn!("Failed to restore upstream record: {}", e);
                output::error(&format!(
                    "Could not restore {} ({}); fix it before the next reload",
                    self.upstream.path(),
                    e
                ));
                return Recovery::LeftAsIs;
            }
            recovery = Recovery::Restored;
        }

        if let Some(candidate) = self.candidate.as_mut() {
            candidate.transition(InstanceState::Draining);
            let dir = self.ctx.instance_dir(candidate.id.as_str());
            match instance::teardown(
                self.exec,
                &candidate.container,
                Some(dir.as_str()),
                self.ctx.env.stop_grace_period,
            )
            .await
            {
                Ok(()) => candidate.transition(InstanceState::Removed),
                Err(e) => {
                    warn!("Failed to remove {}: {}", candidate.container, e);
                    output::warning(&format!(
                        "Could not remove new instance {} ({})",
                        candidate.container, e
                    ));
                }
            }
            if recovery == Recovery::NothingChanged {
                recovery = Recovery::RolledBack;
            }
        }

        if !self.displaced.is_empty() {
            if let Err(e) = steps::restart_displaced(self.exec, &self.displaced).await {
                warn!("Failed to restart displaced instances: {}", e);
                output::warning(&format!(
                    "Could not restart {} ({})",
                    self.displaced.join(", "),
                    e
                ));
            }
        }

        recovery
    }

    /// Put the record back, reloading when the proxy may have picked up the new one.
    async fn restore_record(&self, previous: Option<&str>, reload: bool) -> Result<(), Error> {
        self.upstream.restore(previous).await?;
        if reload {
            self.upstream.reload().await?;
        }
        Ok(())
    }
}
