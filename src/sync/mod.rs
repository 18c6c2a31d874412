//! Drift reconciliation between upstream records and running instances.
//!
//! An environment is in sync when its record declares exactly the host port
//! its newest running instance publishes. Anything else, including a missing
//! record, is drift and is repaired by re-running the switch and verify steps
//! of a deploy against the observed port.

use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::join_all;
use tracing::{debug, info};

use crate::config::{EnvironmentKind, HostRole, SwitchyardConfig};
use crate::deploy::context::DeployContext;
use crate::deploy::steps;
use crate::error::{Error, Result};
use crate::exec::{checked, shell, Executor, TaskStatus};
use crate::instance::{self, LiveContainer};
use crate::upstream::{declared_port, ports_match, Upstream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Record and instance already agreed; nothing was written.
    InSync { port: String },
    /// Record rewritten from `from` (possibly empty) to `to`.
    Repaired { from: String, to: String },
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::InSync { port } => write!(f, "in sync on {}", port),
            SyncOutcome::Repaired { from, to } if from.is_empty() => {
                write!(f, "repaired: <none> -> {}", to)
            }
            SyncOutcome::Repaired { from, to } => write!(f, "repaired: {} -> {}", from, to),
        }
    }
}

/// Both sides of one environment, as read from the hosts.
#[derive(Debug, Clone)]
pub struct Observation {
    pub environment: String,
    /// Raw record content, kept so a repair can be undone.
    pub record: Option<String>,
    pub declared: String,
    pub actual: String,
    /// Newest running instance, if any.
    pub container: Option<String>,
    /// Containers of this environment in any state.
    pub instances: usize,
}

impl Observation {
    pub fn new(
        environment: &str,
        container_port: u16,
        record: Option<String>,
        containers: &[LiveContainer],
    ) -> Self {
        let live = instance::newest_running(containers, environment);
        Self {
            environment: environment.to_string(),
            declared: declared_port(record.as_deref()),
            record,
            actual: live
                .map(|c| c.published_port_for(container_port))
                .unwrap_or_default(),
            container: live.map(|c| c.name.clone()),
            instances: containers
                .iter()
                .filter(|c| c.environment == environment)
                .count(),
        }
    }

    pub fn in_sync(&self) -> bool {
        ports_match(&self.declared, &self.actual)
    }
}

/// Container environments in config order; static ones have no port.
pub fn container_environments(config: &SwitchyardConfig) -> Vec<&str> {
    config
        .environments
        .iter()
        .filter(|(_, env)| env.kind == EnvironmentKind::Container)
        .map(|(name, _)| name.as_str())
        .collect()
}

/// Refuse environments that are not container based.
pub fn ensure_container(config: &SwitchyardConfig, environment: &str) -> Result<()> {
    let env = config.environment(environment)?;
    if env.kind != EnvironmentKind::Container {
        return Err(Error::UnsupportedEnvironmentType {
            environment: environment.to_string(),
            kind: env.kind.to_string(),
        });
    }
    Ok(())
}

/// Read every listed environment's record and the app's containers concurrently.
///
/// One listing serves all environments; each record is its own task. A failed
/// read only fails the environment it belongs to.
pub async fn observe(
    exec: &mut Executor,
    config: &SwitchyardConfig,
    environments: &[&str],
) -> Vec<(String, Result<Observation>)> {
    let timeout = Duration::from_secs(config.ssh.command_timeout);
    let list_cmd = instance::list_command(&config.app.name);

    let listing = exec.submit(HostRole::App, &list_cmd);
    let reads: Vec<(&str, String)> = environments
        .iter()
        .map(|env| {
            let task = exec.submit(HostRole::Proxy, &shell::read_file(&config.upstream_path(env)));
            (*env, task)
        })
        .collect();

    let containers = exec
        .wait(&listing, timeout)
        .await
        .and_then(|out| checked(HostRole::App, &list_cmd, out))
        .map(|stdout| instance::parse_ps(&stdout));

    if containers.is_err() {
        // nothing to compare the records against
        for (_, task) in &reads {
            if matches!(
                exec.poll(task),
                Some(TaskStatus::Pending | TaskStatus::Running)
            ) {
                exec.cancel(task);
            }
        }
    }

    let mut observations = Vec::with_capacity(reads.len());
    for (env, task) in reads {
        let read = exec.wait(&task, timeout).await;
        let observation = match (&containers, read) {
            (Err(e), _) => Err(Error::Other(anyhow!(
                "cannot list containers on app host: {}",
                e
            ))),
            (Ok(_), Err(e)) => Err(e),
            (Ok(containers), Ok(out)) => config
                .environment(env)
                .map_err(Error::from)
                .map(|cfg| {
                    let record = out.success().then_some(out.stdout);
                    Observation::new(env, cfg.container_port, record, containers)
                }),
        };
        if let Ok(obs) = &observation {
            debug!(
                "{}: declared '{}', actual '{}'",
                env, obs.declared, obs.actual
            );
        }
        observations.push((env.to_string(), observation));
    }
    observations
}

/// Bring one environment's record in line with what is running.
///
/// `force` rewrites and reloads even when both sides already agree.
pub async fn reconcile(
    exec: &Executor,
    config: &SwitchyardConfig,
    observation: Observation,
    force: bool,
) -> Result<SyncOutcome> {
    let environment = observation.environment.as_str();
    let Some(container) = observation.container.as_deref() else {
        return Err(Error::NoLiveInstance(environment.to_string()));
    };
    if observation.actual.is_empty() {
        return Err(Error::NoLiveInstance(environment.to_string()));
    }

    if observation.in_sync() && !force {
        return Ok(SyncOutcome::InSync {
            port: observation.actual,
        });
    }

    let port: u16 = observation.actual.parse().map_err(|_| {
        Error::Other(anyhow!(
            "{} publishes unparseable port '{}'",
            container,
            observation.actual
        ))
    })?;
    info!(
        "{}: upstream declares '{}', instance publishes {}; rewriting",
        environment, observation.declared, port
    );

    let ctx = DeployContext::new(config, environment)?;
    let upstream = Upstream::new(exec, config, environment);
    steps::apply_record(&upstream, port, observation.record.as_deref()).await?;
    let verified = steps::verify(&ctx, exec, &upstream, container).await?;

    Ok(SyncOutcome::Repaired {
        from: observation.declared,
        to: verified,
    })
}

/// Reconcile a single container environment.
pub async fn sync(
    exec: &mut Executor,
    config: &SwitchyardConfig,
    environment: &str,
    force: bool,
) -> Result<SyncOutcome> {
    ensure_container(config, environment)?;

    let (_, observation) = observe(exec, config, &[environment])
        .await
        .into_iter()
        .next()
        .ok_or_else(|| Error::Other(anyhow!("no observation for '{}'", environment)))?;

    reconcile(exec, config, observation?, force).await
}

/// Reconcile every container environment. One failure never stops the others.
pub async fn sync_all(
    exec: &mut Executor,
    config: &SwitchyardConfig,
    force: bool,
) -> Vec<(String, Result<SyncOutcome>)> {
    let environments = container_environments(config);
    let observations = observe(exec, config, &environments).await;

    // each environment owns its record; repairs run side by side
    let exec: &Executor = exec;
    join_all(
        observations
            .into_iter()
            .map(|(environment, observation)| async move {
                let outcome = match observation {
                    Ok(observation) => reconcile(exec, config, observation, force).await,
                    Err(e) => Err(e),
                };
                (environment, outcome)
            }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::sample;
    use crate::exec::fake::{fail, ok, FakeTransport};
    use crate::instance::fixtures::ps_row;
    use std::sync::Arc;
    use std::time::Instant;

    const PRODUCTION_RECORD: &str = "/etc/nginx/upstreams/testapp/production.conf";
    const STAGING_RECORD: &str = "/etc/nginx/upstreams/testapp/staging.conf";

    fn record(name: &str, port: u16) -> String {
        format!("upstream {} {{\n    server 10.0.0.5:{};\n}}\n", name, port)
    }

    /// Production runs on 30042; staging has only an exited instance.
    fn hosts() -> Arc<FakeTransport> {
        let fake = Arc::new(FakeTransport::new());
        let rows = [
            ps_row(
                "testapp-production-20261012-093000-000000",
                "production",
                "production-20261012-093000-000000",
                "running",
                "0.0.0.0:30042->3000/tcp, [::]:30042->3000/tcp",
            ),
            ps_row(
                "testapp-staging-20261011-170000-000000",
                "staging",
                "staging-20261011-170000-000000",
                "exited",
                "",
            ),
        ];
        fake.on(HostRole::App, "docker ps", ok(&rows.join("\n")));
        fake.on(HostRole::App, "docker port", ok("0.0.0.0:30042\n[::]:30042\n"));
        fake
    }

    /// One running instance per `(environment, listed port, port the runtime reports)`.
    fn running(instances: &[(&str, u16, u16)]) -> Arc<FakeTransport> {
        let fake = Arc::new(FakeTransport::new());
        let rows: Vec<String> = instances
            .iter()
            .map(|(env, listed, _)| {
                ps_row(
                    &format!("testapp-{}-20261012-093000-000000", env),
                    env,
                    &format!("{}-20261012-093000-000000", env),
                    "running",
                    &format!("0.0.0.0:{}->3000/tcp", listed),
                )
            })
            .collect();
        fake.on(HostRole::App, "docker ps", ok(&rows.join("\n")));
        for (env, _, reported) in instances {
            fake.on(
                HostRole::App,
                &format!("docker port 'testapp-{}-", env),
                ok(&format!("0.0.0.0:{}\n", reported)),
            );
        }
        fake
    }

    #[tokio::test]
    async fn repairs_drift_then_reports_in_sync() {
        let config = sample();
        let fake = hosts();
        fake.put_file(
            HostRole::Proxy,
            PRODUCTION_RECORD,
            &record("testapp_production", 30040),
        );
        let mut exec = Executor::new(fake.clone());

        let first = sync(&mut exec, &config, "production", false).await.unwrap();
        assert_eq!(
            first,
            SyncOutcome::Repaired {
                from: "30040".to_string(),
                to: "30042".to_string()
            }
        );
        assert_eq!(
            fake.file(HostRole::Proxy, PRODUCTION_RECORD),
            Some(record("testapp_production", 30042))
        );
        assert_eq!(fake.writes(HostRole::Proxy), 1);
        assert_eq!(fake.count_calls(HostRole::Proxy, "nginx -s reload"), 1);

        let second = sync(&mut exec, &config, "production", false).await.unwrap();
        assert_eq!(
            second,
            SyncOutcome::InSync {
                port: "30042".to_string()
            }
        );
        assert_eq!(fake.writes(HostRole::Proxy), 1);
        assert_eq!(fake.count_calls(HostRole::Proxy, "nginx -s reload"), 1);
        assert!(exec.live_tasks().is_empty());
    }

    #[tokio::test]
    async fn missing_record_is_drift() {
        let config = sample();
        let fake = hosts();
        let mut exec = Executor::new(fake.clone());

        let outcome = sync(&mut exec, &config, "production", false).await.unwrap();
        assert_eq!(outcome.to_string(), "repaired: <none> -> 30042");
        assert_eq!(
            declared_port(fake.file(HostRole::Proxy, PRODUCTION_RECORD).as_deref()),
            "30042"
        );
    }

    #[tokio::test]
    async fn force_rewrites_a_matching_record() {
        let config = sample();
        let fake = hosts();
        fake.put_file(
            HostRole::Proxy,
            PRODUCTION_RECORD,
            &record("testapp_production", 30042),
        );
        let mut exec = Executor::new(fake.clone());

        let outcome = sync(&mut exec, &config, "production", true).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Repaired { .. }));
        assert_eq!(fake.writes(HostRole::Proxy), 1);
        assert_eq!(fake.count_calls(HostRole::Proxy, "nginx -s reload"), 1);
    }

    #[tokio::test]
    async fn static_environments_are_refused_without_touching_hosts() {
        let config = sample();
        let fake = hosts();
        let mut exec = Executor::new(fake.clone());

        let err = sync(&mut exec, &config, "docs", false).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedEnvironmentType { .. }));
        assert!(fake.calls().is_empty());
        assert_eq!(container_environments(&config), vec!["production", "staging"]);
    }

    #[tokio::test]
    async fn environment_without_running_instance_is_left_alone() {
        let config = sample();
        let fake = hosts();
        let staging = record("testapp_staging", 31000);
        fake.put_file(HostRole::Proxy, STAGING_RECORD, &staging);
        let mut exec = Executor::new(fake.clone());

        let err = sync(&mut exec, &config, "staging", false).await.unwrap_err();
        assert!(matches!(err, Error::NoLiveInstance(ref env) if env == "staging"));
        assert_eq!(fake.file(HostRole::Proxy, STAGING_RECORD), Some(staging));
        assert_eq!(fake.writes(HostRole::Proxy), 0);
    }

    #[tokio::test]
    async fn one_failing_environment_does_not_stop_the_rest() {
        let config = sample();
        let fake = hosts();
        fake.put_file(
            HostRole::Proxy,
            PRODUCTION_RECORD,
            &record("testapp_production", 30040),
        );
        let mut exec = Executor::new(fake.clone());

        let results = sync_all(&mut exec, &config, false).await;

        let names: Vec<&str> = results.iter().map(|(env, _)| env.as_str()).collect();
        assert_eq!(names, vec!["production", "staging"]);
        assert!(matches!(results[0].1, Ok(SyncOutcome::Repaired { .. })));
        assert!(matches!(results[1].1, Err(Error::NoLiveInstance(_))));

        // one listing for the whole app; staging is read once and never written
        assert_eq!(fake.count_calls(HostRole::App, "docker ps"), 1);
        assert_eq!(fake.count_calls(HostRole::Proxy, STAGING_RECORD), 1);
    }

    #[tokio::test]
    async fn rejected_repair_restores_the_drifted_record() {
        let config = sample();
        let fake = hosts();
        let drifted = record("testapp_production", 30040);
        fake.put_file(HostRole::Proxy, PRODUCTION_RECORD, &drifted);
        fake.on(HostRole::Proxy, "nginx -t", fail(1, "nginx: [emerg]"));
        let mut exec = Executor::new(fake.clone());

        let err = sync(&mut exec, &config, "production", false).await.unwrap_err();
        assert!(matches!(err, Error::ConfigValidationFailed { .. }));
        assert_eq!(fake.file(HostRole::Proxy, PRODUCTION_RECORD), Some(drifted));
        assert_eq!(fake.count_calls(HostRole::Proxy, "nginx -s reload"), 0);
    }

    #[tokio::test]
    async fn unreachable_proxy_fails_every_environment_independently() {
        let config = sample();
        let fake = hosts();
        fake.set_unreachable(HostRole::Proxy);
        let mut exec = Executor::new(fake.clone());

        let results = sync_all(&mut exec, &config, false).await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, r)| matches!(r, Err(Error::Transport { host: HostRole::Proxy, .. }))));
    }

    #[tokio::test]
    async fn failed_listing_fails_every_environment_and_leaves_no_tasks() {
        let config = sample();
        let fake = hosts();
        fake.set_unreachable(HostRole::App);
        let mut exec = Executor::new(fake.clone());

        let results = sync_all(&mut exec, &config, false).await;
        assert_eq!(results.len(), 2);
        for (_, result) in &results {
            let err = result.as_ref().unwrap_err();
            assert!(err.to_string().contains("cannot list containers"));
        }
        assert!(exec.live_tasks().is_empty());
        assert_eq!(fake.writes(HostRole::Proxy), 0);
    }

    #[tokio::test]
    async fn drifted_environments_are_repaired_side_by_side() {
        let config = sample();
        let fake = running(&[("production", 30042, 30042), ("staging", 31000, 31000)]);
        fake.put_file(
            HostRole::Proxy,
            PRODUCTION_RECORD,
            &record("testapp_production", 30040),
        );
        fake.put_file(HostRole::Proxy, STAGING_RECORD, &record("testapp_staging", 31001));
        fake.on_slow(
            HostRole::Proxy,
            "nginx -s reload",
            Duration::from_millis(300),
            ok(""),
        );
        let mut exec = Executor::new(fake.clone());

        let started = Instant::now();
        let results = sync_all(&mut exec, &config, false).await;
        let elapsed = started.elapsed();

        assert_eq!(results.len(), 2);
        for (env, result) in &results {
            assert!(
                matches!(result, Ok(SyncOutcome::Repaired { .. })),
                "{}: {:?}",
                env,
                result
            );
        }
        assert_eq!(fake.count_calls(HostRole::Proxy, "nginx -s reload"), 2);
        assert!(elapsed < Duration::from_millis(550), "took {:?}", elapsed);
        assert_eq!(
            declared_port(fake.file(HostRole::Proxy, STAGING_RECORD).as_deref()),
            "31000"
        );
    }

    #[tokio::test]
    async fn disagreement_after_repair_is_reported_and_the_rewrite_kept() {
        let config = sample();
        // the listing shows 30042 but the runtime answers 30043 once asked directly
        let fake = running(&[("production", 30042, 30043)]);
        fake.put_file(
            HostRole::Proxy,
            PRODUCTION_RECORD,
            &record("testapp_production", 30040),
        );
        let mut exec = Executor::new(fake.clone());

        let err = sync(&mut exec, &config, "production", false).await.unwrap_err();

        match err {
            Error::VerificationMismatch {
                environment,
                declared,
                actual,
            } => {
                assert_eq!(environment, "production");
                assert_eq!(declared, "30042");
                assert_eq!(actual, "30043");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            fake.file(HostRole::Proxy, PRODUCTION_RECORD),
            Some(record("testapp_production", 30042))
        );
        assert_eq!(fake.writes(HostRole::Proxy), 1);
        assert_eq!(fake.count_calls(HostRole::Proxy, "nginx -s reload"), 1);
    }
}
