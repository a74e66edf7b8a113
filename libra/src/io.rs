use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::registry::{Closer, TcpCloser};

/// A bidirectional byte stream: the capsulator installed by subnegotiation,
/// or a raw connection before it.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> IoStream for T {}

/// An outbound connection handed to the driver by policy on accept. Beyond
/// being a plain stream, it must expose an independent [`Closer`] capability
/// so the registry can force it closed while the driver is suspended inside
/// a read or write on it (see [`crate::registry::Registry`]).
pub trait Outbound: AsyncRead + AsyncWrite + Unpin + Send {
    fn closer(&self) -> Arc<dyn Closer>;
}

/// Convenience [`Outbound`] wrapper around a plain [`TcpStream`], for
/// embedders whose outbound dialer produces ordinary TCP connections.
pub struct TcpOutbound {
    inner: TcpStream,
    closer: Arc<TcpCloser>,
}

impl TcpOutbound {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let closer = Arc::new(TcpCloser::for_stream(&stream)?);
        Ok(Self { inner: stream, closer })
    }
}

impl Outbound for TcpOutbound {
    fn closer(&self) -> Arc<dyn Closer> {
        self.closer.clone()
    }
}

impl AsyncRead for TcpOutbound {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpOutbound {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
