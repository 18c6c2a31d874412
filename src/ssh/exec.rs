use async_trait::async_trait;
use tracing::debug;

use super::{SshSession, SshTransport};
use crate::config::HostRole;
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, Transport};

impl SshSession {
    /// Execute a command under `bash -c`, capturing exit code and output.
    pub async fn exec(&self, cmd: &str) -> std::result::Result<CommandOutput, openssh::Error> {
        debug!("[{}] exec: {}", self.host, cmd);

        let output = self
            .session
            .command("bash")
            .arg("-c")
            .arg(cmd)
            .output()
            .await?;

        Ok(CommandOutput {
            // killed by a signal: no code to report
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run(&self, host: HostRole, command: &str) -> Result<CommandOutput> {
        let session = self.session(host).await.map_err(|e| Error::Transport {
            host,
            message: format!("{:#}", e),
        })?;

        match session.exec(command).await {
            Ok(out) => Ok(out),
            Err(e) => {
                self.drop_session(host).await;
                Err(Error::Transport {
                    host,
                    message: format!("{} ({})", e, session.host()),
                })
            }
        }
    }
}
