// ABOUTME: In-process SSH server for integration tests.
// ABOUTME: Accepts one password and the fixture client keys, serving each connection on its own task.

use super::fixture;
use russh::keys::{PrivateKey, decode_secret_key, ssh_key};
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TEST_USER: &str = "tester";
pub const TEST_PASSWORD: &str = "correct horse";

fn host_key() -> PrivateKey {
    let text = std::fs::read_to_string(fixture("keys/host_ed25519")).expect("host key fixture");
    decode_secret_key(&text, None).expect("host key decodes")
}

/// Public half of the server's host key in OpenSSH format.
pub fn host_public_key() -> String {
    std::fs::read_to_string(fixture("keys/host_ed25519.pub"))
        .expect("host public key fixture")
        .trim()
        .to_string()
}

fn authorized_keys() -> Vec<ssh_key::PublicKey> {
    ["keys/id_ed25519.pub", "keys/id_ed25519_encrypted.pub"]
        .iter()
        .map(|name| {
            let text = std::fs::read_to_string(fixture(name)).expect("client key fixture");
            ssh_key::PublicKey::from_openssh(text.trim()).expect("client key parses")
        })
        .collect()
}

/// SSH server listening on an ephemeral localhost port.
pub struct TestServer {
    port: u16,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let port = listener.local_addr().expect("listener address").port();

        let config = Arc::new(server::Config {
            keys: vec![host_key()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    let handler = TestHandler::default();
                    if let Ok(session) = server::run_stream(config, socket, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        Self { port, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// known_hosts line trusting this server's host key.
    pub fn known_hosts_line(&self) -> String {
        format!("[127.0.0.1]:{} {}\n", self.port, host_public_key())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct TestHandler {
    // Channels stay open as long as the connection does.
    channels: Vec<Channel<Msg>>,
}

impl server::Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == TEST_USER && password == TEST_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let known = authorized_keys()
            .iter()
            .any(|key| key.key_data() == public_key.key_data());
        if user == TEST_USER && known {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.push(channel);
        Ok(true)
    }
}
