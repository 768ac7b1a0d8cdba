// ABOUTME: Library root for sshc: ssh_config-driven SSH client connections.
// ABOUTME: Resolves host parameters from layered ssh_config sources, then dials with russh.

pub mod config;
pub mod error;
pub mod ssh;

pub use config::{Config, ConfigBuilder};

/// Build a [`Config`] from `builder` and connect to `host`.
pub async fn connect(host: &str, builder: ConfigBuilder) -> ssh::Result<ssh::Client> {
    let config = builder.build()?;
    config.connect(host).await
}
