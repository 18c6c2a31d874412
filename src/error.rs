//! Error taxonomy shared by the cutover engine and the reconciler.

use std::time::Duration;

use thiserror::Error;

use crate::config::HostRole;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot reach {host} host: {message}")]
    Transport { host: HostRole, message: String },

    #[error("command failed on {host} host (exit {code}): {command}\n{stderr}")]
    Command {
        host: HostRole,
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("task {task} on {host} host timed out after {after:?}: {command}")]
    TimedOut {
        task: String,
        host: HostRole,
        command: String,
        after: Duration,
    },

    #[error("task {task} on {host} host was cancelled: {command}")]
    Cancelled {
        task: String,
        host: HostRole,
        command: String,
    },

    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error("no free port in {start}-{end} after {attempts} attempts")]
    PortExhausted { start: u16, end: u16, attempts: u32 },

    #[error("instance {instance} did not become healthy after {attempts} attempts ({last})")]
    HealthCheckFailed {
        instance: String,
        attempts: u32,
        last: String,
    },

    #[error("proxy rejected the configuration for '{environment}': {output}")]
    ConfigValidationFailed { environment: String, output: String },

    #[error("could not restore {path} after the proxy rejected the new record ({rejected}): {source}")]
    RestoreFailed {
        path: String,
        rejected: Box<Error>,
        #[source]
        source: Box<Error>,
    },

    #[error(
        "upstream for '{environment}' declares {} but the instance publishes {}",
        shown(.declared),
        shown(.actual)
    )]
    VerificationMismatch {
        environment: String,
        declared: String,
        actual: String,
    },

    #[error("environment '{environment}' is of type '{kind}'; only container environments have a port to reconcile")]
    UnsupportedEnvironmentType { environment: String, kind: String },

    #[error("no running instance found for environment '{0}'")]
    NoLiveInstance(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn shown(port: &str) -> &str {
    if port.is_empty() {
        "<none>"
    } else {
        port
    }
}
