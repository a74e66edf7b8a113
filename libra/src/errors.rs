#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid version")]
    InvalidVersion,

    #[error("no acceptable methods")]
    NoAcceptableMethods,

    #[error("address type not supported")]
    AddressTypeNotSupported,

    #[error("domain name has zero length")]
    EmptyDomain,

    #[error("command not supported")]
    CommandNotSupported,

    #[error("subnegotiation rejected the client")]
    AuthFailed,

    #[error("handle already closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
