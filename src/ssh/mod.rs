// ABOUTME: SSH connection establishment for resolved host parameters.
// ABOUTME: Supports agent, key, password, and custom authentication, known_hosts checks, and proxies.

mod auth;
mod client;
mod error;
mod known_hosts;
mod proxy;

pub use auth::{Authenticate, KeyMaterial};
pub use client::{
    BoxedStream, Client, CommandOutput, DEFAULT_COMMAND_TIMEOUT, DialConfig, Dialer,
    PROXY_HANDSHAKE_TIMEOUT, TransportStream, dial,
};
pub use error::{Error, Result};
pub use known_hosts::HostKeyVerifier;
pub use proxy::{ProxyDirective, parse_proxy_jump};
