// ABOUTME: Host parameter resolution from layered ssh_config sources and overrides.
// ABOUTME: Turns a host alias into hostname, user, port, identities, and proxy directive.

mod defaults;
mod expand;
mod options;
mod parser;
mod pattern;
mod store;

pub use defaults::default_value;
pub use expand::{expand_path, expand_verbs};
pub use options::{ConfigBuilder, DEFAULT_CONNECT_TIMEOUT};
pub use parser::Document;
pub use pattern::glob_match;
pub use store::{ConfigSource, ConfigStore, DEFAULT_CONFIG_PATHS, SourceList, rewrite_includes};

use crate::error::{Error, Result};
use crate::ssh::{self, Client, DialConfig, KeyMaterial, ProxyDirective};
use options::{IdentityMaterial, Settings};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Resolved SSH client configuration: loaded ssh_config sources plus the
/// caller's overrides. Immutable once built.
pub struct Config {
    settings: Settings,
    store: ConfigStore,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("sources", &self.store.paths().collect::<Vec<_>>())
            .field("overrides", &self.settings.overrides)
            .field("identities", &self.settings.identities.len())
            .field("use_agent", &self.settings.use_agent)
            .field("known_hosts", &self.settings.known_hosts)
            .field("auth_methods", &self.settings.auth_methods.len())
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Config from the default ssh_config files only.
    pub fn new() -> Result<Self> {
        ConfigBuilder::new().build()
    }

    /// Origin paths of the loaded sources, highest priority first.
    pub fn source_paths(&self) -> impl Iterator<Item = &Path> {
        self.store.paths()
    }

    /// Value of `key` for `host`, honouring `User`, `Port` and `Hostname`
    /// overrides. Other keys come straight from the config sources.
    pub fn get(&self, host: &str, key: &str) -> String {
        match key.to_ascii_lowercase().as_str() {
            "user" => self.user(host),
            "port" => match self.settings.overrides.port {
                Some(port) => port.to_string(),
                None => self.store.get(host, key),
            },
            "hostname" => self.hostname(host),
            _ => self.store.get(host, key),
        }
    }

    pub fn user(&self, host: &str) -> String {
        match &self.settings.overrides.user {
            Some(user) => user.clone(),
            None => self.store.get(host, "User"),
        }
    }

    pub fn port(&self, host: &str) -> Result<u16> {
        if let Some(port) = self.settings.overrides.port {
            return Ok(port);
        }
        let value = self.store.get(host, "Port");
        match value.parse::<u16>() {
            Ok(port) if port > 0 => Ok(port),
            _ => Err(Error::InvalidPort {
                host: host.to_string(),
                value,
            }),
        }
    }

    /// Network hostname for `host`, falling back to the alias itself.
    pub fn hostname(&self, host: &str) -> String {
        if let Some(hostname) = &self.settings.overrides.hostname {
            return hostname.clone();
        }
        let hostname = self.store.get(host, "Hostname");
        if hostname.is_empty() {
            host.to_string()
        } else {
            hostname
        }
    }

    /// The `IdentityFile` from ssh_config, expanded to an existing path.
    ///
    /// Returns `None` when the file does not exist; agent or password
    /// authentication may still succeed.
    pub fn identity_file(&self, host: &str) -> Result<Option<PathBuf>> {
        let user = self.user(host);
        let port = self.port(host)?;
        let hostname = self.hostname(host);

        let (raw, base) = self.store.get_with_base(host, "IdentityFile");
        let raw = expand_verbs(&raw, &user, &port.to_string(), &hostname);
        let base = base.unwrap_or_else(|| self.settings.cwd.clone());
        let home = &self.settings.home;

        let mut path = expand_path(&raw, &base, home);
        let legacy = expand_path("~/.ssh/identity", &base, home);
        if path == legacy && !exists(&legacy) {
            path = expand_path("~/.ssh/id_rsa", &base, home);
        }

        if exists(&path) {
            Ok(Some(path))
        } else {
            tracing::debug!("IdentityFile {} for {} does not exist", path.display(), host);
            Ok(None)
        }
    }

    /// Key material for `host`: matching registered identities in
    /// registration order, then the ssh_config `IdentityFile`.
    pub fn identities(&self, host: &str) -> Result<Vec<KeyMaterial>> {
        let mut keys = Vec::new();

        for identity in self.settings.identities.iter().filter(|i| i.matches(host)) {
            let key = match &identity.material {
                IdentityMaterial::Key(bytes) => KeyMaterial::new(bytes.clone(), None),
                IdentityMaterial::File(path) => KeyMaterial::new(read_key(path)?, Some(path.clone())),
            };
            keys.push(key.with_passphrase(identity.passphrase.clone()));
        }

        if let Some(path) = self.identity_file(host)? {
            keys.push(
                KeyMaterial::new(read_key(&path)?, Some(path))
                    .with_passphrase(self.settings.passphrase.clone()),
            );
        }

        Ok(keys)
    }

    /// Raw proxy directive for `host` and the directory of the source that
    /// defined it. `ProxyCommand` takes precedence over `ProxyJump`.
    pub fn proxy(&self, host: &str) -> (Option<ProxyDirective>, Option<PathBuf>) {
        let (command, dir) = self.store.get_with_base(host, "ProxyCommand");
        if is_set(&command) {
            return (Some(ProxyDirective::Command(command)), dir);
        }
        let (jump, dir) = self.store.get_with_base(host, "ProxyJump");
        if is_set(&jump) {
            return (Some(ProxyDirective::Jump(jump)), dir);
        }
        (None, None)
    }

    /// Snapshot of everything needed to connect to `host`.
    pub fn dial_config(&self, host: &str) -> Result<DialConfig> {
        let settings = &self.settings;
        let (proxy, proxy_dir) = self.proxy(host);

        let dial_config = DialConfig {
            hostname: self.hostname(host),
            user: self.user(host),
            port: self.port(host)?,
            keys: self.identities(host)?,
            password: settings.password.clone(),
            auth_methods: settings.auth_methods.clone(),
            known_hosts: settings.known_hosts.clone(),
            use_agent: settings.use_agent,
            agent_socket: settings.agent_socket.clone(),
            proxy,
            proxy_dir: proxy_dir.unwrap_or_else(|| settings.cwd.clone()),
            connect_timeout: settings.connect_timeout,
            proxy_timeout: settings.proxy_timeout,
            dialer: settings.dialer.clone(),
            prompt_passphrase: settings.prompt_passphrase,
        };
        tracing::debug!(
            "Resolved {} to {}@{}:{} ({} key(s), proxy: {})",
            host,
            dial_config.user,
            dial_config.hostname,
            dial_config.port,
            dial_config.keys.len(),
            dial_config.proxy.is_some()
        );
        Ok(dial_config)
    }

    /// Resolve `host` and connect to it.
    pub async fn connect(&self, host: &str) -> ssh::Result<Client> {
        let dial_config = self.dial_config(host)?;
        ssh::dial(dial_config).await
    }
}

fn is_set(value: &str) -> bool {
    !value.is_empty() && !value.eq_ignore_ascii_case("none")
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn read_key(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    std::fs::read(path)
        .map(Zeroizing::new)
        .map_err(|source| Error::ReadIdentity {
            path: path.to_path_buf(),
            source,
        })
}
