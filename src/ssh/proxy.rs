// ABOUTME: ProxyCommand / ProxyJump handling: command synthesis and the proxy subprocess transport.
// ABOUTME: The child runs in its own process group so a stuck proxy can be killed as a whole.

use super::error::{Error, Result};
use crate::config::expand_verbs;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Jump host port when the ProxyJump value has none.
const DEFAULT_JUMP_PORT: &str = "22";

/// Proxy setting resolved for a host, before verb expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDirective {
    /// Shell command whose stdin/stdout carry the SSH stream.
    Command(String),
    /// `[user@]host[:port]` of a jump host.
    Jump(String),
}

impl ProxyDirective {
    /// The shell command to run, with `%h`, `%p` and `%r` replaced by the
    /// destination's values.
    pub fn to_command(&self, user: &str, port: u16, hostname: &str) -> crate::error::Result<String> {
        let raw = match self {
            ProxyDirective::Command(command) => command.clone(),
            ProxyDirective::Jump(jump) => parse_proxy_jump(jump)?,
        };
        Ok(expand_verbs(&raw, user, &port.to_string(), hostname))
    }
}

/// Synthesize the `ssh -W` command equivalent to a ProxyJump value.
pub fn parse_proxy_jump(jump: &str) -> crate::error::Result<String> {
    let (destination, port) = match jump.split_once(':') {
        Some((destination, port)) => {
            if port.parse::<u16>().is_err() {
                return Err(crate::error::Error::InvalidProxyJump(jump.to_string()));
            }
            (destination, port)
        }
        None => (jump, DEFAULT_JUMP_PORT),
    };
    Ok(format!("ssh -l %r -W %h:%p  {destination} -p {port}"))
}

/// Transport over a proxy child's stdout (read side) and stdin (write side).
pub(crate) struct ProxyStream {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

/// Start `sh -c <command>` in `dir` as the leader of a new process group.
/// Stderr is inherited so proxy diagnostics reach the user.
pub(crate) fn spawn(command: &str, dir: &Path) -> Result<(Child, ProxyStream)> {
    let spawn_error = |source: io::Error| Error::ProxySpawn {
        command: command.to_string(),
        source,
    };

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .process_group(0)
        .spawn()
        .map_err(spawn_error)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_error(io::Error::other("stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_error(io::Error::other("stdout not captured")))?;

    tracing::debug!("Spawned proxy command {:?} (pid {:?})", command, child.id());
    Ok((child, ProxyStream { stdin, stdout }))
}

/// SIGKILL the child's whole process group, then reap the child.
pub(crate) async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            tracing::warn!("Failed to kill proxy process group {}: {}", pid, e);
        }
    }
    if let Err(e) = child.wait().await {
        tracing::warn!("Failed to reap proxy process: {}", e);
    }
}
