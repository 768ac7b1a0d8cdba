// ABOUTME: Authentication material and method selection for new connections.
// ABOUTME: Decodes keys (with a single passphrase re-prompt), queries the agent, runs methods in order.

use super::client::DialConfig;
use super::error::{Error, Result};
use super::known_hosts::HostKeyVerifier;
use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, ssh_key};
use russh::{AgentAuthError, CryptoVec, Signer};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixStream;
use zeroize::Zeroizing;

/// A caller-supplied authentication method, tried after the built-in ones.
#[async_trait]
pub trait Authenticate: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Attempt authentication as `user`. `Ok(false)` lets the next method run.
    async fn authenticate(&self, handle: &mut Handle<HostKeyVerifier>, user: &str) -> Result<bool>;
}

/// Raw private key bytes plus the passphrase to try first.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: Zeroizing<Vec<u8>>,
    path: Option<PathBuf>,
    passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("bytes", &"<redacted>")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl KeyMaterial {
    pub fn new(bytes: Zeroizing<Vec<u8>>, path: Option<PathBuf>) -> Self {
        Self {
            bytes,
            path,
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Option<Zeroizing<String>>) -> Self {
        self.passphrase = passphrase;
        self
    }

    /// File the key was read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn label(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "(inline key)".to_string(),
        }
    }
}

/// Decode every key into a signer. A key that cannot be decoded with its
/// passphrase gets one interactive re-prompt when `prompt` is set.
pub(crate) fn load_signers(keys: &[KeyMaterial], prompt: bool) -> Result<Vec<Arc<PrivateKey>>> {
    keys.iter()
        .map(|key| decode_key(key, prompt).map(Arc::new))
        .collect()
}

fn decode_key(key: &KeyMaterial, prompt: bool) -> Result<PrivateKey> {
    let parse_error = |reason: String| Error::KeyParse {
        key: key.label(),
        reason,
    };

    let text = std::str::from_utf8(&key.bytes)
        .map_err(|_| parse_error("key is not valid UTF-8".to_string()))?;

    let first = match decode_secret_key(text, key.passphrase.as_ref().map(|p| p.as_str())) {
        Ok(decoded) => return Ok(decoded),
        Err(e) => e,
    };
    if !prompt {
        return Err(parse_error(first.to_string()));
    }

    tracing::debug!("Key {} did not decode ({}), prompting", key.label(), first);
    let passphrase = rpassword::prompt_password(format!(
        "Enter passphrase for key '{}': ",
        key.label()
    ))
    .map(Zeroizing::new)
    .map_err(|e| parse_error(format!("failed to read passphrase: {e}")))?;

    decode_secret_key(text, Some(passphrase.as_str())).map_err(|e| parse_error(e.to_string()))
}

/// One entry of the ordered method list tried after the handshake.
pub(crate) enum Method {
    Agent {
        agent: AgentClient<UnixStream>,
        identities: Vec<ssh_key::PublicKey>,
    },
    PublicKeys(Vec<Arc<PrivateKey>>),
    Password(Zeroizing<String>),
    Custom(Arc<dyn Authenticate>),
}

impl Method {
    fn name(&self) -> &str {
        match self {
            Method::Agent { .. } => "agent",
            Method::PublicKeys(_) => "publickey",
            Method::Password(_) => "password",
            Method::Custom(method) => method.name(),
        }
    }
}

/// Build the method list: agent identities replace key signers when the
/// agent holds any, password and caller methods are always appended.
pub(crate) async fn select_methods(
    dial_config: &DialConfig,
    signers: Vec<Arc<PrivateKey>>,
) -> Result<Vec<Method>> {
    let mut methods = Vec::new();

    let agent = match (&dial_config.agent_socket, dial_config.use_agent) {
        (Some(socket), true) => Some(connect_agent(socket).await?),
        _ => None,
    };

    match agent {
        Some((agent, identities)) if !identities.is_empty() => {
            tracing::debug!("Using {} agent identities", identities.len());
            methods.push(Method::Agent { agent, identities });
        }
        _ if !signers.is_empty() => methods.push(Method::PublicKeys(signers)),
        _ => {}
    }

    if let Some(password) = &dial_config.password {
        methods.push(Method::Password(password.clone()));
    }

    methods.extend(dial_config.auth_methods.iter().cloned().map(Method::Custom));

    tracing::debug!(
        "Authentication methods: [{}]",
        methods.iter().map(Method::name).collect::<Vec<_>>().join(", ")
    );
    Ok(methods)
}

async fn connect_agent(
    socket: &Path,
) -> Result<(AgentClient<UnixStream>, Vec<ssh_key::PublicKey>)> {
    let mut agent = AgentClient::connect_uds(socket).await.map_err(|e| {
        Error::AgentUnavailable(format!("failed to connect to {}: {}", socket.display(), e))
    })?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| Error::AgentUnavailable(format!("failed to list agent keys: {}", e)))?;
    Ok((agent, identities))
}

/// Agent-backed signer whose future owns the key it signs for, keeping
/// the authentication future `Send`.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<UnixStream>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = std::result::Result<CryptoVec, Self::Error>> + Send {
        let key = key.clone();
        async move {
            self.agent
                .sign_request(&key, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Run each method in order until one succeeds.
pub(crate) async fn authenticate(
    handle: &mut Handle<HostKeyVerifier>,
    user: &str,
    methods: Vec<Method>,
) -> Result<()> {
    for method in methods {
        let name = method.name().to_string();
        let success = match method {
            Method::Agent {
                mut agent,
                identities,
            } => {
                let mut accepted = false;
                for key in identities {
                    let mut signer = AgentSigner { agent: &mut agent };
                    match handle
                        .authenticate_publickey_with(user, key, None, &mut signer)
                        .await
                    {
                        Ok(result) if result.success() => {
                            accepted = true;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!("Agent signing failed: {}", e),
                    }
                }
                accepted
            }
            Method::PublicKeys(keys) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let mut accepted = false;
                for key in keys {
                    let result = handle
                        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                        .await?;
                    if result.success() {
                        accepted = true;
                        break;
                    }
                }
                accepted
            }
            Method::Password(password) => handle
                .authenticate_password(user, password.as_str())
                .await?
                .success(),
            Method::Custom(method) => method.authenticate(handle, user).await?,
        };

        if success {
            tracing::debug!("Authenticated as {} via {}", user, name);
            return Ok(());
        }
        tracing::debug!("Authentication via {} rejected", name);
    }
    Err(Error::AuthenticationFailed)
}
