// ABOUTME: Builder for Config: ordered options applied to an accumulating settings value.
// ABOUTME: Options override resolved fields and manage the ssh_config source chain.

use super::Config;
use super::expand::expand_path;
use super::pattern::glob_match;
use super::store::{ConfigSource, SourceList};
use crate::error::{Error, Result};
use crate::ssh::{Authenticate, Dialer, PROXY_HANDSHAKE_TIMEOUT};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Default bound on dialing and authenticating a direct connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pattern used when identity material is registered without host patterns.
const HOST_ANY: &str = "*";

/// Key material registered through the builder, scoped to a host pattern.
#[derive(Clone)]
pub(crate) struct IdentitySpec {
    pub pattern: String,
    pub material: IdentityMaterial,
    pub passphrase: Option<Zeroizing<String>>,
}

#[derive(Clone)]
pub(crate) enum IdentityMaterial {
    Key(Zeroizing<Vec<u8>>),
    File(PathBuf),
}

impl IdentitySpec {
    pub fn matches(&self, host: &str) -> bool {
        glob_match(&self.pattern, host)
    }
}

/// Scalar overrides that take precedence over every config source.
#[derive(Debug, Clone, Default)]
pub(crate) struct Overrides {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub hostname: Option<String>,
}

/// The accumulating value options are applied to.
#[derive(Clone)]
pub(crate) struct Settings {
    pub sources: SourceList,
    pub overrides: Overrides,
    pub identities: Vec<IdentitySpec>,
    pub passphrase: Option<Zeroizing<String>>,
    pub use_agent: bool,
    pub agent_socket: Option<PathBuf>,
    pub known_hosts: Vec<PathBuf>,
    pub password: Option<Zeroizing<String>>,
    pub auth_methods: Vec<Arc<dyn Authenticate>>,
    pub dialer: Option<Dialer>,
    pub connect_timeout: Duration,
    pub proxy_timeout: Duration,
    pub prompt_passphrase: bool,
    pub home: PathBuf,
    pub cwd: PathBuf,
}

enum ConfigOption {
    User(String),
    Port(u16),
    Hostname(String),
    IdentityFile {
        path: String,
        passphrase: Option<Zeroizing<String>>,
        patterns: Vec<String>,
    },
    IdentityKey {
        key: Zeroizing<Vec<u8>>,
        passphrase: Option<Zeroizing<String>>,
        patterns: Vec<String>,
    },
    Passphrase(Zeroizing<String>),
    UnshiftConfigData(Vec<u8>),
    AppendConfigData(Vec<u8>),
    UnshiftConfigPath(String),
    AppendConfigPath(String),
    ClearConfig,
    UseAgent(bool),
    AgentSocket(PathBuf),
    KnownHosts(Vec<String>),
    Password(Zeroizing<String>),
    AuthMethod(Arc<dyn Authenticate>),
    Dialer(Dialer),
    ConnectTimeout(Duration),
    ProxyTimeout(Duration),
    PromptPassphrase(bool),
}

fn patterns_or_any(patterns: &[&str]) -> Vec<String> {
    if patterns.is_empty() {
        vec![HOST_ANY.to_string()]
    } else {
        patterns.iter().map(|p| p.to_string()).collect()
    }
}

impl ConfigOption {
    fn apply(self, settings: &mut Settings) -> Result<()> {
        match self {
            ConfigOption::User(user) => settings.overrides.user = Some(user),
            ConfigOption::Port(0) => {
                return Err(Error::InvalidPort {
                    host: "*".to_string(),
                    value: "0".to_string(),
                });
            }
            ConfigOption::Port(port) => settings.overrides.port = Some(port),
            ConfigOption::Hostname(hostname) => settings.overrides.hostname = Some(hostname),
            ConfigOption::IdentityFile {
                path,
                passphrase,
                patterns,
            } => {
                let path = expand_path(&path, &settings.cwd, &settings.home);
                for pattern in patterns {
                    settings.identities.push(IdentitySpec {
                        pattern,
                        material: IdentityMaterial::File(path.clone()),
                        passphrase: passphrase.clone(),
                    });
                }
            }
            ConfigOption::IdentityKey {
                key,
                passphrase,
                patterns,
            } => {
                for pattern in patterns {
                    settings.identities.push(IdentitySpec {
                        pattern,
                        material: IdentityMaterial::Key(key.clone()),
                        passphrase: passphrase.clone(),
                    });
                }
            }
            ConfigOption::Passphrase(passphrase) => settings.passphrase = Some(passphrase),
            ConfigOption::UnshiftConfigData(data) => {
                let source = ConfigSource::from_data(data, &settings.cwd);
                settings.sources.unshift(source);
            }
            ConfigOption::AppendConfigData(data) => {
                let source = ConfigSource::from_data(data, &settings.cwd);
                settings.sources.append(source);
            }
            ConfigOption::UnshiftConfigPath(path) => {
                let source = ConfigSource::from_path(&path, &settings.cwd, &settings.home)?;
                settings.sources.unshift(source);
            }
            ConfigOption::AppendConfigPath(path) => {
                let source = ConfigSource::from_path(&path, &settings.cwd, &settings.home)?;
                settings.sources.append(source);
            }
            ConfigOption::ClearConfig => settings.sources.clear(),
            ConfigOption::UseAgent(use_agent) => settings.use_agent = use_agent,
            ConfigOption::AgentSocket(path) => settings.agent_socket = Some(path),
            ConfigOption::KnownHosts(files) => {
                settings.known_hosts = files
                    .iter()
                    .map(|f| expand_path(f, &settings.cwd, &settings.home))
                    .collect();
            }
            ConfigOption::Password(password) => settings.password = Some(password),
            ConfigOption::AuthMethod(method) => settings.auth_methods.push(method),
            ConfigOption::Dialer(dialer) => settings.dialer = Some(dialer),
            ConfigOption::ConnectTimeout(timeout) => settings.connect_timeout = timeout,
            ConfigOption::ProxyTimeout(timeout) => settings.proxy_timeout = timeout,
            ConfigOption::PromptPassphrase(prompt) => settings.prompt_passphrase = prompt,
        }
        Ok(())
    }
}

/// Builds a [`Config`] from options applied in the order they were added.
///
/// The default ssh_config files (`~/.ssh/config`, `/etc/ssh/ssh_config`)
/// are loaded first when present; `clear_config` drops them. Every source is
/// decoded exactly once in [`build`](Self::build).
#[derive(Default)]
pub struct ConfigBuilder {
    options: Vec<ConfigOption>,
    home: Option<PathBuf>,
    cwd: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, option: ConfigOption) -> Self {
        self.options.push(option);
        self
    }

    /// Override the login user for every host.
    pub fn user(self, user: impl Into<String>) -> Self {
        self.push(ConfigOption::User(user.into()))
    }

    /// Override the port for every host.
    pub fn port(self, port: u16) -> Self {
        self.push(ConfigOption::Port(port))
    }

    /// Override the network hostname for every host.
    pub fn hostname(self, hostname: impl Into<String>) -> Self {
        self.push(ConfigOption::Hostname(hostname.into()))
    }

    /// Register a private key file for hosts matching `host_patterns`
    /// (all hosts when empty).
    pub fn identity_file(self, path: impl Into<String>, host_patterns: &[&str]) -> Self {
        self.push(ConfigOption::IdentityFile {
            path: path.into(),
            passphrase: None,
            patterns: patterns_or_any(host_patterns),
        })
    }

    pub fn identity_file_with_passphrase(
        self,
        path: impl Into<String>,
        passphrase: impl Into<String>,
        host_patterns: &[&str],
    ) -> Self {
        self.push(ConfigOption::IdentityFile {
            path: path.into(),
            passphrase: Some(Zeroizing::new(passphrase.into())),
            patterns: patterns_or_any(host_patterns),
        })
    }

    /// Register raw private key bytes for hosts matching `host_patterns`
    /// (all hosts when empty).
    pub fn identity_key(self, key: impl Into<Vec<u8>>, host_patterns: &[&str]) -> Self {
        self.push(ConfigOption::IdentityKey {
            key: Zeroizing::new(key.into()),
            passphrase: None,
            patterns: patterns_or_any(host_patterns),
        })
    }

    pub fn identity_key_with_passphrase(
        self,
        key: impl Into<Vec<u8>>,
        passphrase: impl Into<String>,
        host_patterns: &[&str],
    ) -> Self {
        self.push(ConfigOption::IdentityKey {
            key: Zeroizing::new(key.into()),
            passphrase: Some(Zeroizing::new(passphrase.into())),
            patterns: patterns_or_any(host_patterns),
        })
    }

    /// Passphrase for the identity file resolved from ssh_config.
    pub fn passphrase(self, passphrase: impl Into<String>) -> Self {
        self.push(ConfigOption::Passphrase(Zeroizing::new(passphrase.into())))
    }

    /// Alias of [`unshift_config_data`](Self::unshift_config_data).
    pub fn config_data(self, data: impl Into<Vec<u8>>) -> Self {
        self.unshift_config_data(data)
    }

    /// Add in-memory ssh_config data at the highest priority.
    pub fn unshift_config_data(self, data: impl Into<Vec<u8>>) -> Self {
        self.push(ConfigOption::UnshiftConfigData(data.into()))
    }

    /// Add in-memory ssh_config data at the lowest priority.
    pub fn append_config_data(self, data: impl Into<Vec<u8>>) -> Self {
        self.push(ConfigOption::AppendConfigData(data.into()))
    }

    /// Alias of [`unshift_config_path`](Self::unshift_config_path).
    pub fn config_path(self, path: impl Into<String>) -> Self {
        self.unshift_config_path(path)
    }

    /// Add an ssh_config file at the highest priority. The file must exist.
    pub fn unshift_config_path(self, path: impl Into<String>) -> Self {
        self.push(ConfigOption::UnshiftConfigPath(path.into()))
    }

    /// Add an ssh_config file at the lowest priority. The file must exist.
    pub fn append_config_path(self, path: impl Into<String>) -> Self {
        self.push(ConfigOption::AppendConfigPath(path.into()))
    }

    /// Drop every source registered so far, including the defaults.
    pub fn clear_config(self) -> Self {
        self.push(ConfigOption::ClearConfig)
    }

    /// Whether to authenticate through the SSH agent (default: true).
    pub fn use_agent(self, use_agent: bool) -> Self {
        self.push(ConfigOption::UseAgent(use_agent))
    }

    /// Agent socket to use instead of `SSH_AUTH_SOCK`.
    pub fn agent_socket(self, path: impl Into<PathBuf>) -> Self {
        self.push(ConfigOption::AgentSocket(path.into()))
    }

    /// Verify host keys against these known_hosts files. Without any,
    /// every host key is accepted.
    pub fn known_hosts<I, S>(self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(ConfigOption::KnownHosts(
            files.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn password(self, password: impl Into<String>) -> Self {
        self.push(ConfigOption::Password(Zeroizing::new(password.into())))
    }

    /// Append a caller-supplied authentication method, tried after the
    /// built-in ones.
    pub fn auth_method(self, method: impl Authenticate + 'static) -> Self {
        self.push(ConfigOption::AuthMethod(Arc::new(method)))
    }

    /// Replace the TCP dialer used for direct connections.
    pub fn dialer(self, dialer: Dialer) -> Self {
        self.push(ConfigOption::Dialer(dialer))
    }

    pub fn connect_timeout(self, timeout: Duration) -> Self {
        self.push(ConfigOption::ConnectTimeout(timeout))
    }

    /// Watchdog for handshakes through a proxy command (default: 30s).
    pub fn proxy_timeout(self, timeout: Duration) -> Self {
        self.push(ConfigOption::ProxyTimeout(timeout))
    }

    /// Whether to prompt on the terminal when a key fails to decrypt
    /// (default: true). Disable for headless use.
    pub fn prompt_passphrase(self, prompt: bool) -> Self {
        self.push(ConfigOption::PromptPassphrase(prompt))
    }

    /// Home directory used for `~` expansion instead of the current user's.
    pub fn home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Directory relative paths and in-memory sources are resolved against
    /// instead of the process working directory.
    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Apply every option in order, then load the ssh_config sources once.
    pub fn build(self) -> Result<Config> {
        let home = match self.home {
            Some(home) => home,
            None => dirs::home_dir().ok_or(Error::HomeDirUnavailable)?,
        };
        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()?,
        };

        let mut settings = Settings {
            sources: SourceList::defaults(&cwd, &home)?,
            overrides: Overrides::default(),
            identities: Vec::new(),
            passphrase: None,
            use_agent: true,
            agent_socket: std::env::var_os("SSH_AUTH_SOCK")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            known_hosts: Vec::new(),
            password: None,
            auth_methods: Vec::new(),
            dialer: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            proxy_timeout: PROXY_HANDSHAKE_TIMEOUT,
            prompt_passphrase: true,
            home,
            cwd,
        };

        for option in self.options {
            option.apply(&mut settings)?;
        }

        let store = settings.sources.load(&settings.home)?;
        Ok(Config { settings, store })
    }
}
