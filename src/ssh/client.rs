// ABOUTME: Connection establishment using russh: direct dial or through a proxy subprocess.
// ABOUTME: Owns the authenticated session handle and runs commands over it.

use super::auth::{self, Authenticate, KeyMaterial};
use super::error::{Error, Result};
use super::known_hosts::HostKeyVerifier;
use super::proxy::{self, ProxyDirective};
use futures::future::BoxFuture;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::Child;
use zeroize::Zeroizing;

/// Watchdog on handshake plus authentication through a proxy command.
pub const PROXY_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on [`Client::exec`].
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// How long `disconnect` waits for a proxy child to exit on its own.
const PROXY_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Byte stream an SSH session can run over.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn TransportStream>;

/// Replacement for the TCP dial of direct connections, given hostname and port.
pub type Dialer = Arc<dyn Fn(String, u16) -> BoxFuture<'static, io::Result<BoxedStream>> + Send + Sync>;

/// Everything needed to open one connection, fully resolved.
#[derive(Clone)]
pub struct DialConfig {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub keys: Vec<KeyMaterial>,
    pub password: Option<Zeroizing<String>>,
    pub auth_methods: Vec<Arc<dyn Authenticate>>,
    /// Empty means every host key is accepted.
    pub known_hosts: Vec<PathBuf>,
    pub use_agent: bool,
    pub agent_socket: Option<PathBuf>,
    pub proxy: Option<ProxyDirective>,
    /// Working directory of the proxy subprocess.
    pub proxy_dir: PathBuf,
    pub connect_timeout: Duration,
    pub proxy_timeout: Duration,
    pub dialer: Option<Dialer>,
    pub prompt_passphrase: bool,
}

impl DialConfig {
    /// Direct connection to `user@hostname:port` with no credentials yet.
    pub fn new(hostname: impl Into<String>, user: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            user: user.into(),
            port,
            keys: Vec::new(),
            password: None,
            auth_methods: Vec::new(),
            known_hosts: Vec::new(),
            use_agent: false,
            agent_socket: None,
            proxy: None,
            proxy_dir: PathBuf::from("/"),
            connect_timeout: crate::config::DEFAULT_CONNECT_TIMEOUT,
            proxy_timeout: PROXY_HANDSHAKE_TIMEOUT,
            dialer: None,
            prompt_passphrase: false,
        }
    }
}

impl std::fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialConfig")
            .field("hostname", &self.hostname)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("keys", &self.keys)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_methods", &self.auth_methods.len())
            .field("known_hosts", &self.known_hosts)
            .field("use_agent", &self.use_agent)
            .field("agent_socket", &self.agent_socket)
            .field("proxy", &self.proxy)
            .field("proxy_dir", &self.proxy_dir)
            .field("connect_timeout", &self.connect_timeout)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("dialer", &self.dialer.as_ref().map(|_| "<custom>"))
            .field("prompt_passphrase", &self.prompt_passphrase)
            .finish()
    }
}

/// Output from a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Open a connection described by `dial_config`.
///
/// Steps run strictly in order: decode keys, choose authentication methods,
/// build the host key verifier, resolve the proxy command, then connect and
/// authenticate. Any failure aborts the whole call.
pub async fn dial(dial_config: DialConfig) -> Result<Client> {
    let signers = auth::load_signers(&dial_config.keys, dial_config.prompt_passphrase)?;
    let methods = auth::select_methods(&dial_config, signers).await?;
    let verifier = HostKeyVerifier::new(
        &dial_config.hostname,
        dial_config.port,
        &dial_config.known_hosts,
    )?;
    let proxy_command = dial_config
        .proxy
        .as_ref()
        .map(|p| p.to_command(&dial_config.user, dial_config.port, &dial_config.hostname))
        .transpose()?;

    let ssh_config = Arc::new(client::Config::default());

    match proxy_command {
        None => {
            let connect = async {
                let stream = open_stream(&dial_config).await?;
                handshake(ssh_config, stream, verifier, &dial_config, methods).await
            };
            let handle = tokio::time::timeout(dial_config.connect_timeout, connect)
                .await
                .map_err(|_| Error::Timeout(dial_config.connect_timeout))??;

            tracing::info!(
                "Connected to {}@{}:{}",
                dial_config.user,
                dial_config.hostname,
                dial_config.port
            );
            Ok(Client::new(handle, None))
        }
        Some(command) => {
            let (mut child, stream) = proxy::spawn(&command, &dial_config.proxy_dir)?;
            let connect = handshake(ssh_config, stream, verifier, &dial_config, methods);

            tokio::select! {
                result = connect => {
                    let handle = result?;
                    tracing::info!(
                        "Connected to {}@{}:{} via proxy {:?}",
                        dial_config.user,
                        dial_config.hostname,
                        dial_config.port,
                        command
                    );
                    Ok(Client::new(handle, Some(child)))
                }
                _ = tokio::time::sleep(dial_config.proxy_timeout) => {
                    tracing::warn!(
                        "Proxy command {:?} timed out after {:?}, killing it",
                        command,
                        dial_config.proxy_timeout
                    );
                    proxy::kill_group(&mut child).await;
                    Err(Error::ProxyTimeout(dial_config.proxy_timeout))
                }
            }
        }
    }
}

async fn open_stream(dial_config: &DialConfig) -> Result<BoxedStream> {
    let host = dial_config.hostname.clone();
    let port = dial_config.port;

    let stream: BoxedStream = match &dial_config.dialer {
        Some(dialer) => dialer(host.clone(), port).await.map_err(|e| {
            Error::Connection(format!("custom dialer failed for {}:{}: {}", host, port, e))
        })?,
        None => {
            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| Error::Connection(format!("{}:{}: {}", host, port, e)))?;
            Box::new(tcp)
        }
    };
    Ok(stream)
}

async fn handshake<S>(
    ssh_config: Arc<client::Config>,
    stream: S,
    verifier: HostKeyVerifier,
    dial_config: &DialConfig,
    methods: Vec<auth::Method>,
) -> Result<Handle<HostKeyVerifier>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut handle = client::connect_stream(ssh_config, stream, verifier)
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => Error::HostKeyRejected {
                host: dial_config.hostname.clone(),
                port: dial_config.port,
            },
            other => Error::Protocol(other),
        })?;
    auth::authenticate(&mut handle, &dial_config.user, methods).await?;
    Ok(handle)
}

/// An authenticated SSH connection. For proxied connections it also owns
/// the proxy subprocess.
pub struct Client {
    handle: Handle<HostKeyVerifier>,
    proxy: Option<Child>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("handle", &"<russh::Handle>")
            .field("proxy_pid", &self.proxy.as_ref().and_then(Child::id))
            .finish()
    }
}

impl Client {
    fn new(handle: Handle<HostKeyVerifier>, proxy: Option<Child>) -> Self {
        Self { handle, proxy }
    }

    /// The underlying russh session handle.
    pub fn handle(&self) -> &Handle<HostKeyVerifier> {
        &self.handle
    }

    /// Process id of the proxy subprocess, if connected through one.
    pub fn proxy_pid(&self) -> Option<u32> {
        self.proxy.as_ref().and_then(Child::id)
    }

    /// Open a new session channel.
    pub async fn open_session(&self) -> Result<Channel<Msg>> {
        Ok(self.handle.channel_open_session().await?)
    }

    /// Execute a command on the remote host.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.exec_with_timeout(command, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Execute a command with a custom timeout.
    pub async fn exec_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        match tokio::time::timeout(timeout, self.exec_inner(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::CommandTimeout(timeout)),
        }
    }

    async fn exec_inner(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::CommandFailed(format!("failed to exec command: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        let mut got_eof = false;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                // ext 1 is stderr
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                    if got_eof {
                        break;
                    }
                }
                ChannelMsg::Eof => {
                    got_eof = true;
                    if exit_code.is_some() {
                        break;
                    }
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or(Error::ChannelClosed)?;
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Disconnect the session. A proxy child that does not exit shortly
    /// afterwards is killed with its process group.
    pub async fn disconnect(mut self) -> Result<()> {
        let result = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        if let Some(mut child) = self.proxy.take() {
            match tokio::time::timeout(PROXY_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("Proxy command exited: {}", status),
                Ok(Err(e)) => tracing::warn!("Failed to wait for proxy command: {}", e),
                Err(_) => proxy::kill_group(&mut child).await,
            }
        }

        result.map_err(Error::Protocol)
    }
}
