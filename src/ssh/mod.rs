pub mod exec;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{HostConfig, HostRole, HostsConfig, SwitchyardConfig};

pub struct SshSession {
    session: Session,
    host: String,
}

impl SshSession {
    pub async fn connect(host: &HostConfig, connect_timeout: Duration) -> Result<Self> {
        debug!("Connecting to {}@{}", host.user(), host.address);

        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Accept);
        builder.user(host.user().to_string());
        builder.connect_timeout(connect_timeout);

        if let Some(port) = host.port {
            builder.port(port);
        }

        let session = builder
            .connect(&host.address)
            .await
            .with_context(|| format!("Failed to connect to {}@{}", host.user(), host.address))?;

        Ok(Self {
            session,
            host: host.address.clone(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn close(self) -> Result<()> {
        self.session
            .close()
            .await
            .with_context(|| format!("Failed to close SSH session to {}", self.host))?;
        Ok(())
    }
}

/// One lazily filled slot per host role.
///
/// Connecting holds only the slot being filled: callers for the same role
/// share one connect, and a host that is slow to answer never delays the other.
struct SessionSlots<S> {
    app: Mutex<Option<Arc<S>>>,
    proxy: Mutex<Option<Arc<S>>>,
}

impl<S> SessionSlots<S> {
    fn new() -> Self {
        Self {
            app: Mutex::new(None),
            proxy: Mutex::new(None),
        }
    }

    fn slot(&self, role: HostRole) -> &Mutex<Option<Arc<S>>> {
        match role {
            HostRole::App => &self.app,
            HostRole::Proxy => &self.proxy,
        }
    }

    async fn get_or_connect<F, Fut>(&self, role: HostRole, connect: F) -> Result<Arc<S>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        let mut slot = self.slot(role).lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let session = Arc::new(connect().await?);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn clear(&self, role: HostRole) {
        self.slot(role).lock().await.take();
    }

    async fn take_all(&self) -> Vec<(HostRole, Arc<S>)> {
        let mut taken = Vec::new();
        for role in [HostRole::App, HostRole::Proxy] {
            if let Some(session) = self.slot(role).lock().await.take() {
                taken.push((role, session));
            }
        }
        taken
    }
}

/// One lazily-opened multiplexed session per host role, shared by all tasks.
pub struct SshTransport {
    hosts: HostsConfig,
    connect_timeout: Duration,
    sessions: SessionSlots<SshSession>,
}

impl SshTransport {
    pub fn new(config: &SwitchyardConfig) -> Self {
        Self {
            hosts: config.hosts.clone(),
            connect_timeout: Duration::from_secs(config.ssh.connect_timeout),
            sessions: SessionSlots::new(),
        }
    }

    async fn session(&self, role: HostRole) -> Result<Arc<SshSession>> {
        self.sessions
            .get_or_connect(role, || {
                SshSession::connect(self.hosts.get(role), self.connect_timeout)
            })
            .await
    }

    /// Forget a session after a transport failure so the next command reconnects.
    async fn drop_session(&self, role: HostRole) {
        self.sessions.clear(role).await;
    }

    pub async fn close(&self) -> Result<()> {
        for (role, session) in self.sessions.take_all().await {
            match Arc::try_unwrap(session) {
                Ok(session) => session.close().await?,
                Err(_) => debug!("Session to {} host still in use, leaving it to drop", role),
            }
        }
        Ok(())
    }
}
