// ABOUTME: Host key verification for outgoing connections.
// ABOUTME: Checks keys against caller-supplied known_hosts files, or accepts any key when none are given.

use super::error::{Error, Result};
use russh::client;
use russh::keys::known_hosts::check_known_hosts_path;
use russh::keys::ssh_key;
use std::path::PathBuf;

#[derive(Debug, Clone)]
enum Policy {
    /// No known_hosts files configured. Insecure.
    AcceptAny,
    KnownHosts(Vec<PathBuf>),
}

/// russh client handler that decides whether to trust the server's host key.
#[derive(Debug, Clone)]
pub struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: Policy,
}

impl HostKeyVerifier {
    /// Verifier for `host:port`. Every file in `known_hosts` must be readable.
    pub fn new(host: &str, port: u16, known_hosts: &[PathBuf]) -> Result<Self> {
        let policy = if known_hosts.is_empty() {
            Policy::AcceptAny
        } else {
            for path in known_hosts {
                std::fs::File::open(path).map_err(|source| Error::KnownHosts {
                    path: path.clone(),
                    source,
                })?;
            }
            Policy::KnownHosts(known_hosts.to_vec())
        };
        Ok(Self {
            host: host.to_string(),
            port,
            policy,
        })
    }

    fn verify(&self, key: &ssh_key::PublicKey) -> bool {
        let files = match &self.policy {
            Policy::AcceptAny => {
                tracing::warn!(
                    "No known_hosts configured: accepting host key for {}:{} without verification",
                    self.host,
                    self.port
                );
                return true;
            }
            Policy::KnownHosts(files) => files,
        };

        for path in files {
            match check_known_hosts_path(&self.host, self.port, key, path) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(russh::keys::Error::KeyChanged { .. }) => {
                    tracing::warn!(
                        "Host key for {}:{} does not match {}",
                        self.host,
                        self.port,
                        path.display()
                    );
                    return false;
                }
                Err(e) => tracing::warn!("Failed to check {}: {}", path.display(), e),
            }
        }

        tracing::warn!(
            "Host key for {}:{} not found in known_hosts",
            self.host,
            self.port
        );
        false
    }
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(self.verify(server_public_key))
    }
}
