// ABOUTME: Integration tests for connection establishment.
// ABOUTME: Runs against an in-process SSH server; proxy tests spawn real shell subprocesses.

mod support;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use russh::client::Handle;
use sshc::config::{Config, ConfigBuilder};
use sshc::ssh::{
    Authenticate, BoxedStream, DialConfig, Dialer, Error, HostKeyVerifier, dial,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::fixture;
use support::ssh_server::{TEST_PASSWORD, TEST_USER, TestServer};

/// Builder resolving alias `test` to the in-process server, with no
/// agent, no prompting, and no user config.
fn builder(server: &TestServer) -> ConfigBuilder {
    support::init_tracing();
    Config::builder()
        .home_dir("/nonexistent-home")
        .clear_config()
        .config_data(format!(
            "Host test\n  Hostname 127.0.0.1\n  Port {}\n  User {}\n",
            server.port(),
            TEST_USER
        ))
        .use_agent(false)
        .prompt_passphrase(false)
}

fn fixture_str(name: &str) -> String {
    fixture(name).to_string_lossy().into_owned()
}

fn known_hosts_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

mod authentication {
    use super::*;

    #[tokio::test]
    async fn password_authentication_succeeds() {
        let server = TestServer::start().await;
        let config = builder(&server).password(TEST_PASSWORD).build().unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        assert!(client.proxy_pid().is_none());
        client.open_session().await.expect("session should open");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn key_file_authentication_succeeds() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .identity_file(fixture_str("keys/id_ed25519"), &[])
            .build()
            .unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn encrypted_key_with_passphrase_succeeds() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .identity_file_with_passphrase(
                fixture_str("keys/id_ed25519_encrypted"),
                "secret",
                &["test"],
            )
            .build()
            .unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn inline_key_succeeds() {
        let server = TestServer::start().await;
        let key = std::fs::read(fixture("keys/id_ed25519")).unwrap();
        let config = builder(&server).identity_key(key, &["te*"]).build().unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn wrong_passphrase_without_prompt_fails() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .identity_file_with_passphrase(fixture_str("keys/id_ed25519_encrypted"), "wrong", &[])
            .build()
            .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::KeyParse { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        let server = TestServer::start().await;
        let config = builder(&server).password("not it").build().unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed), "got {err:?}");
    }

    #[tokio::test]
    async fn unauthorized_key_falls_through_to_password() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .identity_file(fixture_str("keys/host_ed25519"), &[])
            .password(TEST_PASSWORD)
            .build()
            .unwrap();

        let client = config.connect("test").await.expect("password should be tried");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn no_credentials_fails_after_handshake() {
        let server = TestServer::start().await;
        let config = builder(&server).build().unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed), "got {err:?}");
    }

    struct StaticPassword;

    #[async_trait]
    impl Authenticate for StaticPassword {
        fn name(&self) -> &str {
            "static-password"
        }

        async fn authenticate(
            &self,
            handle: &mut Handle<HostKeyVerifier>,
            user: &str,
        ) -> sshc::ssh::Result<bool> {
            Ok(handle
                .authenticate_password(user, TEST_PASSWORD)
                .await?
                .success())
        }
    }

    #[tokio::test]
    async fn caller_method_runs_last() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .password("not it")
            .auth_method(StaticPassword)
            .build()
            .unwrap();

        let client = config.connect("test").await.expect("custom method should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }
}

mod agent {
    use super::*;

    #[tokio::test]
    async fn unreachable_agent_is_an_error() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .use_agent(true)
            .agent_socket("/nonexistent/agent.sock")
            .password(TEST_PASSWORD)
            .build()
            .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::AgentUnavailable(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn absent_agent_socket_is_not_an_error() {
        let server = TestServer::start().await;
        let config = temp_env::with_var_unset("SSH_AUTH_SOCK", || {
            builder(&server)
                .use_agent(true)
                .password(TEST_PASSWORD)
                .build()
                .unwrap()
        });

        let client = config.connect("test").await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }
}

mod host_keys {
    use super::*;

    #[tokio::test]
    async fn listed_host_key_is_accepted() {
        let server = TestServer::start().await;
        let known_hosts = known_hosts_file(&server.known_hosts_line());
        let config = builder(&server)
            .password(TEST_PASSWORD)
            .known_hosts([known_hosts.path().to_string_lossy().into_owned()])
            .build()
            .unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn unknown_host_key_is_rejected() {
        let server = TestServer::start().await;
        let other = std::fs::read_to_string(fixture("keys/id_ed25519.pub")).unwrap();
        let known_hosts =
            known_hosts_file(&format!("[127.0.0.1]:{} {}", server.port(), other.trim()));
        let config = builder(&server)
            .password(TEST_PASSWORD)
            .known_hosts([known_hosts.path().to_string_lossy().into_owned()])
            .build()
            .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::HostKeyRejected { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_known_hosts_file_is_an_error() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .password(TEST_PASSWORD)
            .known_hosts(["/nonexistent/known_hosts"])
            .build()
            .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::KnownHosts { .. }), "got {err:?}");
    }
}

mod transport {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut dial_config = DialConfig::new("127.0.0.1", TEST_USER, port);
        dial_config.password = Some(TEST_PASSWORD.to_string().into());

        let err = dial(dial_config).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn dial_config_connects_directly() {
        let server = TestServer::start().await;
        let mut dial_config = DialConfig::new("127.0.0.1", TEST_USER, server.port());
        dial_config.password = Some(TEST_PASSWORD.to_string().into());

        let client = dial(dial_config).await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn custom_dialer_replaces_tcp() {
        let server = TestServer::start().await;
        let port = server.port();
        let dialer: Dialer = Arc::new(
            move |_host: String, _port: u16| -> BoxFuture<'static, std::io::Result<BoxedStream>> {
                async move {
                    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;
                    Ok(Box::new(stream) as BoxedStream)
                }
                .boxed()
            },
        );
        let config = builder(&server)
            .hostname("unresolvable.invalid")
            .password(TEST_PASSWORD)
            .dialer(dialer)
            .build()
            .unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn stalled_dial_hits_connect_timeout() {
        let server = TestServer::start().await;
        let dialer: Dialer = Arc::new(
            |_host: String, _port: u16| -> BoxFuture<'static, std::io::Result<BoxedStream>> {
                futures::future::pending().boxed()
            },
        );
        let config = builder(&server)
            .password(TEST_PASSWORD)
            .dialer(dialer)
            .connect_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn top_level_connect_builds_and_dials() {
        let server = TestServer::start().await;
        let client = sshc::connect("test", builder(&server).password(TEST_PASSWORD))
            .await
            .expect("connection should succeed");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn exec_without_reply_times_out() {
        let server = TestServer::start().await;
        let config = builder(&server).password(TEST_PASSWORD).build().unwrap();
        let client = config.connect("test").await.expect("connection should succeed");

        let err = client
            .exec_with_timeout("true", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout(_)), "got {err:?}");

        client.disconnect().await.expect("disconnect should succeed");
    }
}

mod proxy {
    use super::*;

    fn proxied(server: &TestServer, proxy_command: &str) -> ConfigBuilder {
        builder(server)
            .config_data(format!("Host test\n  ProxyCommand {proxy_command}\n"))
            .password(TEST_PASSWORD)
    }

    fn process_exists(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    /// Alive and not a zombie waiting for its new parent to reap it.
    fn process_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !matches!(
                stat.rsplit_once(')').and_then(|(_, rest)| rest.trim_start().chars().next()),
                Some('Z') | Some('X')
            ),
            Err(_) => false,
        }
    }

    fn read_pid(path: &Path) -> i32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    #[tokio::test]
    async fn proxy_command_carries_the_session() {
        if !Path::new("/bin/bash").exists() {
            eprintln!("skipping: /bin/bash not available");
            return;
        }
        let server = TestServer::start().await;
        let config = proxied(
            &server,
            "/bin/bash -c 'exec 3<>/dev/tcp/%h/%p; cat <&3 & exec cat >&3'",
        )
        .build()
        .unwrap();

        let client = config.connect("test").await.expect("connection should succeed");
        assert!(client.proxy_pid().is_some());
        client.open_session().await.expect("session should open");
        client.disconnect().await.expect("disconnect should succeed");
    }

    #[tokio::test]
    async fn stuck_proxy_is_killed_on_timeout() {
        let server = TestServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let config = proxied(
            &server,
            &format!("echo $$ > {}; exec sleep 60", pid_file.display()),
        )
        .proxy_timeout(Duration::from_millis(500))
        .build()
        .unwrap();

        let started = Instant::now();
        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::ProxyTimeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = read_pid(&pid_file);
        assert!(!process_exists(pid), "proxy process {pid} still running");
    }

    #[tokio::test]
    async fn stuck_proxy_descendants_are_killed_with_it() {
        if !Path::new("/proc/self/stat").exists() {
            eprintln!("skipping: /proc not available");
            return;
        }
        let server = TestServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let config = proxied(
            &server,
            &format!("sleep 60 & echo $! > {}; wait", pid_file.display()),
        )
        .proxy_timeout(Duration::from_millis(500))
        .build()
        .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(matches!(err, Error::ProxyTimeout(_)), "got {err:?}");

        let pid = read_pid(&pid_file);
        let deadline = Instant::now() + Duration::from_secs(5);
        while process_running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!process_running(pid), "background process {pid} survived the kill");
    }

    #[tokio::test]
    async fn exiting_proxy_fails_without_waiting_for_watchdog() {
        let server = TestServer::start().await;
        let config = proxied(&server, "exit 1").build().unwrap();

        let started = Instant::now();
        let err = config.connect("test").await.unwrap_err();
        assert!(!matches!(err, Error::ProxyTimeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn malformed_proxy_jump_is_a_config_error() {
        let server = TestServer::start().await;
        let config = builder(&server)
            .config_data("Host test\n  ProxyJump jump:xxxxx\n")
            .password(TEST_PASSWORD)
            .build()
            .unwrap();

        let err = config.connect("test").await.unwrap_err();
        assert!(
            matches!(
                err,
                Error::Config(sshc::error::Error::InvalidProxyJump(_))
            ),
            "got {err:?}"
        );
    }
}
