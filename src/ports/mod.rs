//! Host port allocation for new instances.
//!
//! Candidates are drawn uniformly at random from the reserved range so that
//! overlapping deployments against the same host rarely pick the same port.
//! A candidate is accepted only when it is neither in the caller's exclusion
//! set nor currently listening on the host.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::{HostRole, PortsConfig};
use crate::error::{Error, Result};
use crate::exec::Executor;

const LISTENING_CMD: &str = "ss -Htln";

pub struct PortAllocator<R = StdRng> {
    range: RangeInclusive<u16>,
    max_attempts: u32,
    rng: R,
}

impl PortAllocator<StdRng> {
    pub fn from_config(config: &PortsConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }
}

impl<R: Rng> PortAllocator<R> {
    pub fn with_rng(config: &PortsConfig, rng: R) -> Self {
        Self {
            range: config.start..=config.end,
            max_attempts: config.max_attempts,
            rng,
        }
    }

    /// Pick a port on `host` that is not in `exclude` and not listening there.
    pub async fn allocate(
        &mut self,
        exec: &Executor,
        host: HostRole,
        exclude: &BTreeSet<u16>,
    ) -> Result<u16> {
        let listening = listening_ports(exec, host).await?;
        debug!(
            "{} ports excluded, {} listening on {}",
            exclude.len(),
            listening.len(),
            host
        );
        self.pick(exclude, &listening)
    }

    /// Draw candidates until one is free or the attempt budget runs out.
    pub fn pick(&mut self, exclude: &BTreeSet<u16>, listening: &BTreeSet<u16>) -> Result<u16> {
        for attempt in 1..=self.max_attempts {
            let candidate = self.rng.gen_range(self.range.clone());
            if exclude.contains(&candidate) || listening.contains(&candidate) {
                debug!("port {} taken (attempt {}/{})", candidate, attempt, self.max_attempts);
                continue;
            }
            return Ok(candidate);
        }

        Err(Error::PortExhausted {
            start: *self.range.start(),
            end: *self.range.end(),
            attempts: self.max_attempts,
        })
    }
}

pub async fn listening_ports(exec: &Executor, host: HostRole) -> Result<BTreeSet<u16>> {
    let stdout = exec.run_checked(host, LISTENING_CMD).await?;
    Ok(parse_listening(&stdout))
}

/// Parse `ss -Htln` output into the set of locally bound TCP ports.
pub fn parse_listening(output: &str) -> BTreeSet<u16> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .filter_map(|local| local.rsplit(':').next())
        .filter_map(|port| port.parse().ok())
        .collect()
}
