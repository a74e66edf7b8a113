use std::time::Duration;

pub mod capsulate;
pub mod codec;
mod driver;
pub mod errors;
pub mod handshake;
pub mod io;
pub mod log;
mod registry;
mod relay;
pub mod request;
pub mod server;

pub use capsulate::{NegotiateError, NoAuthSubnegotiator, Subnegotiator};
pub use codec::{DstAddr, ReplyCode};
pub use errors::{Error, Result};
pub use handshake::Handshake;
pub use io::{IoStream, Outbound, TcpOutbound};
pub use log::{Level, LogEntry};
pub use registry::{Closer, TcpCloser};
pub use request::{AssociateRequest, BindRequest, ConnectRequest, Request, RequestMeta};
pub use server::Server;

/// Channel capacities and timer durations, constructed by the embedder.
/// Configuration *parsing* (files, env, CLI flags) is the host's job; this
/// crate only accepts the already-resolved values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bounded capacity shared by the handshake, request, and log channels.
    pub chan_cap: usize,
    /// Upper bound on waiting for an external accept/deny before a
    /// handshake or request auto-denies.
    pub auto_deny: Duration,
    /// Grace period between committing a failure reply and tearing down
    /// the TCP connection, giving the client a chance to read it.
    pub close_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chan_cap: 64,
            auto_deny: Duration::from_secs(30),
            close_grace: Duration::from_secs(3),
        }
    }
}
