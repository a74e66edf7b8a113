use std::error::Error as StdError;
use std::fmt;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::io::IoStream;

/// The outcome of a failed subnegotiation, classified the way the driver
/// needs to react to it (see the SUBNEGOTIATE transition table).
#[derive(Debug)]
pub enum NegotiateError {
    AuthFailed,
    Malformed,
    Other(Box<dyn StdError + Send + Sync>),
}

impl fmt::Display for NegotiateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiateError::AuthFailed => write!(f, "subnegotiation rejected the client"),
            NegotiateError::Malformed => write!(f, "malformed subnegotiation message"),
            NegotiateError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl StdError for NegotiateError {}

/// Drives the method-specific subnegotiation (authentication, or anything
/// else a method requires) and returns a capsulator used for every
/// subsequent control-channel byte on this connection. Implemented outside
/// this crate for every method other than 0x00 (no authentication).
///
/// On failure the stream is handed back alongside the error so the caller
/// can still apply its own close-grace delay instead of dropping it outright.
#[async_trait]
pub trait Subnegotiator: Send + Sync {
    async fn negotiate(&self, stream: TcpStream) -> Result<Box<dyn IoStream>, (TcpStream, NegotiateError)>;
}

/// Method 0x00 (NO AUTHENTICATION REQUIRED): the capsulator is the raw
/// stream, unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuthSubnegotiator;

#[async_trait]
impl Subnegotiator for NoAuthSubnegotiator {
    async fn negotiate(&self, stream: TcpStream) -> Result<Box<dyn IoStream>, (TcpStream, NegotiateError)> {
        Ok(Box::new(stream))
    }
}
