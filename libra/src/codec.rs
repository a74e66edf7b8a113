use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::Error;

// Socks Allowable Methods
pub const NO_AUTHENTICATION_REQUIRED: u8 = 0x00;
pub const GSSAPI: u8 = 0x01;
pub const USERNAME_AND_PASSWORD: u8 = 0x02;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xff;

// COMMANDs
pub const CONNECT: u8 = 0x01;
pub const BIND: u8 = 0x02;
pub const UDP_ASSOCIATE: u8 = 0x03;

// ADDR TYPEs
pub const DST_IPV4: u8 = 0x01;
pub const DST_DOMAIN: u8 = 0x03;
pub const DST_IPV6: u8 = 0x04;

// Socks Version
pub const SOCKS_VERSION: u8 = 0x05;

/// Maximum number of bytes a request/reply frame can occupy on the wire:
/// VER+CMD+RSV+ATYP (4) + domain len-prefix (1) + domain (255) + port (2).
pub const MAX_REQUEST_LEN: usize = 262;

/// SOCKS5 reply status codes (RFC 1928 S6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<ReplyCode> for u8 {
    fn from(value: ReplyCode) -> Self {
        value as u8
    }
}

/// The destination or bound address carried by a request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DstAddr {
    V4([u8; 4]),
    V6([u8; 16]),
    Domain(String),
}

impl DstAddr {
    fn atyp(&self) -> u8 {
        match self {
            DstAddr::V4(_) => DST_IPV4,
            DstAddr::V6(_) => DST_IPV6,
            DstAddr::Domain(_) => DST_DOMAIN,
        }
    }

    /// The canonical empty/placeholder address: IPv4 0.0.0.0.
    pub fn unspecified() -> Self {
        DstAddr::V4([0, 0, 0, 0])
    }
}

impl From<std::net::SocketAddr> for DstAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => DstAddr::V4(v4.ip().octets()),
            std::net::SocketAddr::V6(v6) => DstAddr::V6(v6.ip().octets()),
        }
    }
}

fn put_addr(dst: &mut BytesMut, addr: &DstAddr) {
    dst.put_u8(addr.atyp());
    match addr {
        DstAddr::V4(octets) => dst.put_slice(octets),
        DstAddr::V6(octets) => dst.put_slice(octets),
        DstAddr::Domain(name) => {
            dst.put_u8(name.len() as u8);
            dst.put_slice(name.as_bytes());
        }
    }
}

fn addr_len_hint(addr: &DstAddr) -> usize {
    match addr {
        DstAddr::V4(_) => 1 + 4,
        DstAddr::V6(_) => 1 + 16,
        DstAddr::Domain(name) => 1 + 1 + name.len(),
    }
}

/// Decodes the `VER | NMETHODS | METHODS[NMETHODS]` greeting.
///
/// `Decoder::Item` is the offered method list; the version octet is
/// validated but not surfaced (callers only ever need to know it was 5).
#[derive(Debug, Default)]
pub struct GreetingCodec;

impl Decoder for GreetingCodec {
    type Item = Vec<u8>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>, Error> {
        if src.len() < 2 {
            return Ok(None);
        }
        let version = src[0];
        let nmethods = src[1] as usize;
        if src.len() < 2 + nmethods {
            src.reserve(2 + nmethods - src.len());
            return Ok(None);
        }
        if version != SOCKS_VERSION {
            return Err(Error::InvalidVersion);
        }
        if nmethods == 0 {
            return Err(Error::NoAcceptableMethods);
        }
        src.advance(2);
        let methods = src.split_to(nmethods).to_vec();
        Ok(Some(methods))
    }
}

/// Encodes the `VER | METHOD` method-selection reply.
impl Encoder<u8> for GreetingCodec {
    type Error = Error;

    fn encode(&mut self, method: u8, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(2);
        dst.put_u8(SOCKS_VERSION);
        dst.put_u8(method);
        Ok(())
    }
}

/// Decodes a `VER | CMD | RSV | ATYP | DST.ADDR | DST.PORT` request and
/// encodes the reply of identical shape (the `CMD` slot carries `REP`).
#[derive(Debug, Default)]
pub struct RequestCodec;

/// `(CMD, destination address, destination port)`.
pub type RequestFrame = (u8, DstAddr, u16);

impl Decoder for RequestCodec {
    type Item = RequestFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        if src[0] != SOCKS_VERSION {
            return Err(Error::InvalidVersion);
        }
        let cmd = src[1];
        let atyp = src[3];
        let (addr_len, header_len) = match atyp {
            DST_IPV4 => (4usize, 4usize),
            DST_IPV6 => (16usize, 4usize),
            DST_DOMAIN => {
                if src.len() < 5 {
                    return Ok(None);
                }
                let len = src[4] as usize;
                if len == 0 {
                    return Err(Error::EmptyDomain);
                }
                (len, 5usize)
            }
            _ => return Err(Error::AddressTypeNotSupported),
        };
        let total = header_len + addr_len + 2;
        if total > MAX_REQUEST_LEN {
            return Err(Error::AddressTypeNotSupported);
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let addr = match atyp {
            DST_IPV4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&src[..4]);
                src.advance(4);
                DstAddr::V4(octets)
            }
            DST_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&src[..16]);
                src.advance(16);
                DstAddr::V6(octets)
            }
            DST_DOMAIN => {
                let name = String::from_utf8_lossy(&src[..addr_len]).into_owned();
                src.advance(addr_len);
                DstAddr::Domain(name)
            }
            _ => unreachable!("validated above"),
        };
        let port = u16::from_be_bytes([src[0], src[1]]);
        src.advance(2);
        Ok(Some((cmd, addr, port)))
    }
}

impl Encoder<RequestFrame> for RequestCodec {
    type Error = Error;

    fn encode(&mut self, item: RequestFrame, dst: &mut BytesMut) -> Result<(), Error> {
        let (cmd_or_rep, addr, port) = item;
        dst.reserve(4 + addr_len_hint(&addr) + 2);
        dst.put_u8(SOCKS_VERSION);
        dst.put_u8(cmd_or_rep);
        dst.put_u8(0); // RSV
        put_addr(dst, &addr);
        dst.put_u16(port);
        Ok(())
    }
}
