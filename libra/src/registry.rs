use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

/// A resource the registry can force-close independently of whatever task
/// currently owns it for reads and writes.
#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> io::Result<()>;
}

#[async_trait]
impl<T: Closer + ?Sized> Closer for Arc<T> {
    async fn close(&self) -> io::Result<()> {
        (**self).close().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleId(u64);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Listener,
    Connection,
}

struct Entry {
    kind: Kind,
    closer: Arc<dyn Closer>,
}

/// The process-wide set of owned closeable handles. Every TCP listener and
/// connection the core itself accepts or attaches is registered here so
/// that `close_all` can guarantee bounded cleanup regardless of which task
/// is currently suspended inside a read or write on the handle.
#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(&self, closer: Arc<dyn Closer>) -> HandleId {
        self.insert(Kind::Listener, closer)
    }

    pub fn register_connection(&self, closer: Arc<dyn Closer>) -> HandleId {
        self.insert(Kind::Connection, closer)
    }

    fn insert(&self, kind: Kind, closer: Arc<dyn Closer>) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(id, Entry { kind, closer });
        HandleId(id)
    }

    pub fn deregister(&self, id: HandleId) {
        self.handles.lock().unwrap().remove(&id.0);
    }

    /// Close a single handle. Idempotent: closing an already-removed id is a
    /// silent no-op.
    pub async fn close(&self, id: HandleId) {
        let closer = self.handles.lock().unwrap().remove(&id.0).map(|e| e.closer);
        if let Some(closer) = closer {
            report_close(closer.close().await);
        }
    }

    /// Close the listener only, leaving established connections registered
    /// and running.
    pub async fn close_listener_only(&self) {
        let listener = {
            let mut handles = self.handles.lock().unwrap();
            let id = handles
                .iter()
                .find(|(_, e)| e.kind == Kind::Listener)
                .map(|(id, _)| *id);
            id.and_then(|id| handles.remove(&id)).map(|e| e.closer)
        };
        if let Some(closer) = listener {
            report_close(closer.close().await);
        }
    }

    /// Close every handle registered at the moment this is called. Handles
    /// registered concurrently after the snapshot is taken are allowed to
    /// leak: the server is going down and no new accepts will occur.
    pub async fn close_all(&self) {
        let snapshot: Vec<(u64, Arc<dyn Closer>)> = {
            let handles = self.handles.lock().unwrap();
            handles.iter().map(|(id, e)| (*id, e.closer.clone())).collect()
        };
        for (id, closer) in snapshot {
            self.handles.lock().unwrap().remove(&id);
            report_close(closer.close().await);
        }
    }
}

fn report_close(result: io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::InvalidInput
            ) =>
        {
            info!(error = %e, "close on already-closed handle");
        }
        Err(e) => warn!(error = %e, "close failed"),
    }
}

/// Forces a TCP listener or connection closed via an independently
/// duplicated socket, so that calling `close` does not race the owner of
/// the original `tokio::net::TcpStream`/`TcpListener` value.
pub struct TcpCloser {
    sock: socket2::Socket,
}

impl TcpCloser {
    pub fn for_stream(stream: &tokio::net::TcpStream) -> io::Result<Self> {
        Ok(Self {
            sock: dup_raw(stream)?,
        })
    }

    pub fn for_listener(listener: &tokio::net::TcpListener) -> io::Result<Self> {
        Ok(Self {
            sock: dup_raw(listener)?,
        })
    }
}

#[async_trait]
impl Closer for TcpCloser {
    async fn close(&self) -> io::Result<()> {
        self.sock.shutdown(std::net::Shutdown::Both)
    }
}

#[cfg(unix)]
fn dup_raw<T: std::os::unix::io::AsRawFd>(handle: &T) -> io::Result<socket2::Socket> {
    use std::os::unix::io::{AsRawFd, FromRawFd};
    // SAFETY: `handle` owns the fd for its own lifetime; we immediately
    // `forget` our temporary view of it so dropping `tmp` never closes the
    // fd the caller still owns. `dup`'s returned socket is independently
    // owned and safe to keep past `handle`'s lifetime.
    let tmp = unsafe { socket2::Socket::from_raw_fd(handle.as_raw_fd()) };
    let dup = tmp.try_clone();
    std::mem::forget(tmp);
    dup
}

#[cfg(windows)]
fn dup_raw<T: std::os::windows::io::AsRawSocket>(handle: &T) -> io::Result<socket2::Socket> {
    use std::os::windows::io::{AsRawSocket, FromRawSocket};
    let tmp = unsafe { socket2::Socket::from_raw_socket(handle.as_raw_socket()) };
    let dup = tmp.try_clone();
    std::mem::forget(tmp);
    dup
}
