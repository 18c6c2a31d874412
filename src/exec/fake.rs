//! In-memory [`Transport`] for tests.
//!
//! Understands the file snippets produced by [`super::shell`] (read, atomic
//! write, plain write, remove) against a per-host file table. Every other
//! command is answered by the first registered rule whose pattern it
//! contains, or by an empty success.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::shell;
use super::{CommandOutput, Transport};
use crate::config::HostRole;
use crate::error::{Error, Result};

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

struct Rule {
    host: HostRole,
    pattern: String,
    replies: VecDeque<CommandOutput>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct FakeState {
    files: BTreeMap<(HostRole, String), String>,
    rules: Vec<Rule>,
    calls: Vec<(HostRole, String)>,
    unreachable: HashSet<HostRole>,
    protected: HashSet<(HostRole, String)>,
}

#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every matching command with `reply`.
    pub fn on(&self, host: HostRole, pattern: &str, reply: CommandOutput) {
        self.add_rule(host, pattern, vec![reply], None);
    }

    /// Answer matching commands with `replies` in order; the last one repeats.
    pub fn on_sequence(&self, host: HostRole, pattern: &str, replies: Vec<CommandOutput>) {
        self.add_rule(host, pattern, replies, None);
    }

    pub fn on_slow(&self, host: HostRole, pattern: &str, delay: Duration, reply: CommandOutput) {
        self.add_rule(host, pattern, vec![reply], Some(delay));
    }

    fn add_rule(
        &self,
        host: HostRole,
        pattern: &str,
        replies: Vec<CommandOutput>,
        delay: Option<Duration>,
    ) {
        self.state.lock().unwrap().rules.push(Rule {
            host,
            pattern: pattern.to_string(),
            replies: replies.into(),
            delay,
        });
    }

    pub fn set_unreachable(&self, host: HostRole) {
        self.state.lock().unwrap().unreachable.insert(host);
    }

    /// Make removing `path` on `host` fail as if permission were denied.
    pub fn protect(&self, host: HostRole, path: &str) {
        self.state
            .lock()
            .unwrap()
            .protected
            .insert((host, path.to_string()));
    }

    pub fn put_file(&self, host: HostRole, path: &str, content: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((host, path.to_string()), content.to_string());
    }

    pub fn file(&self, host: HostRole, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(host, path.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<(HostRole, String)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, host: HostRole, pattern: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(h, c)| *h == host && c.contains(pattern))
            .count()
    }

    /// Number of heredoc writes issued to `host`.
    pub fn writes(&self, host: HostRole) -> usize {
        self.count_calls(host, shell::heredoc_marker())
    }

    fn respond(&self, host: HostRole, command: &str) -> Result<(CommandOutput, Option<Duration>)> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((host, command.to_string()));

        if state.unreachable.contains(&host) {
            return Err(Error::Transport {
                host,
                message: "connection refused".to_string(),
            });
        }

        let FakeState {
            files, protected, ..
        } = &mut *state;
        if let Some(out) = apply_file_op(files, protected, host, command) {
            return Ok((out, None));
        }

        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.host == host && command.contains(&r.pattern));

        match rule {
            Some(rule) => {
                let reply = if rule.replies.len() > 1 {
                    rule.replies.pop_front()
                } else {
                    rule.replies.front().cloned()
                };
                Ok((reply.unwrap_or_else(|| ok("")), rule.delay))
            }
            None => Ok((ok(""), None)),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn run(&self, host: HostRole, command: &str) -> Result<CommandOutput> {
        let (out, delay) = self.respond(host, command)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(out)
    }
}

fn apply_file_op(
    files: &mut BTreeMap<(HostRole, String), String>,
    protected: &HashSet<(HostRole, String)>,
    host: HostRole,
    command: &str,
) -> Option<CommandOutput> {
    let marker = shell::heredoc_marker();

    if command.contains(&format!("<<'{}'", marker)) {
        let mut lines = command.lines();
        let head = lines.next()?;
        let body: Vec<&str> = lines.take_while(|l| *l != marker).collect();
        // atomic writes end with `mv -f -- tmp dest`, plain ones with `cat > dest <<'EOF'`
        let words: Vec<&str> = head.split(' ').collect();
        let dest = match words.last()? {
            w if w.starts_with("<<") => words.get(words.len().checked_sub(2)?)?,
            w => w,
        };
        let path = shell::unquote(dest);
        files.insert((host, path), format!("{}\n", body.join("\n")));
        return Some(ok(""));
    }

    let plain = command.strip_prefix("sudo ").unwrap_or(command);
    let single_word = |rest: &&str| rest.starts_with('\'') && rest.ends_with('\'');

    if let Some(rest) = plain.strip_prefix("cat -- ").filter(single_word) {
        let path = shell::unquote(rest);
        return Some(match files.get(&(host, path.clone())) {
            Some(content) => ok(content),
            None => fail(1, &format!("cat: {}: No such file or directory", path)),
        });
    }

    if let Some(rest) = plain.strip_prefix("rm -f -- ").filter(single_word) {
        let key = (host, shell::unquote(rest));
        if protected.contains(&key) {
            return Some(fail(
                1,
                &format!("rm: cannot remove '{}': Operation not permitted", key.1),
            ));
        }
        files.remove(&key);
        return Some(ok(""));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emulates_atomic_writes_and_reads() {
        let fake = FakeTransport::new();
        let path = "/etc/nginx/upstreams/app/prod.conf";

        let missing = fake.run(HostRole::Proxy, &shell::read_file(path)).await.unwrap();
        assert_eq!(missing.exit_code, 1);

        fake.run(
            HostRole::Proxy,
            &shell::atomic_write(path, "line one\nline 'two'\n", true),
        )
        .await
        .unwrap();
        assert_eq!(
            fake.file(HostRole::Proxy, path).as_deref(),
            Some("line one\nline 'two'\n")
        );
        assert!(fake.file(HostRole::App, path).is_none());

        let read = fake.run(HostRole::Proxy, &shell::read_file(path)).await.unwrap();
        assert_eq!(read.stdout, "line one\nline 'two'\n");

        fake.run(HostRole::Proxy, &shell::remove_file(path, true))
            .await
            .unwrap();
        assert!(fake.file(HostRole::Proxy, path).is_none());
        assert_eq!(fake.writes(HostRole::Proxy), 1);
    }

    #[tokio::test]
    async fn sequences_advance_and_stick_on_last_reply() {
        let fake = FakeTransport::new();
        fake.on_sequence(HostRole::App, "curl", vec![fail(7, ""), fail(7, ""), ok("")]);

        let codes: Vec<i32> = futures::future::join_all(
            (0..4).map(|_| fake.run(HostRole::App, "curl -fsS http://127.0.0.1:1/")),
        )
        .await
        .into_iter()
        .map(|r| r.unwrap().exit_code)
        .collect();

        assert_eq!(codes, vec![7, 7, 0, 0]);
        assert_eq!(fake.count_calls(HostRole::App, "curl"), 4);
    }
}
