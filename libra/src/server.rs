use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::error;

use crate::driver;
use crate::handshake::Handshake;
use crate::log::LogEntry;
use crate::registry::{Registry, TcpCloser};
use crate::request::Request;
use crate::ServerConfig;

struct State {
    down: bool,
    addr: Option<SocketAddr>,
    handshake_tx: Option<mpsc::Sender<Arc<Handshake>>>,
    handshake_rx_taken: bool,
    request_tx: Option<mpsc::Sender<Request>>,
    request_rx_taken: bool,
    log_tx: Option<mpsc::Sender<LogEntry>>,
    log_rx_taken: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            down: false,
            addr: None,
            handshake_tx: None,
            handshake_rx_taken: false,
            request_tx: None,
            request_rx_taken: false,
            log_tx: None,
            log_rx_taken: false,
        }
    }
}

/// The embedder-facing proxy server: owns the listener, the closer
/// registry, and the three handoff channels. Everything that decides what
/// to do with a connection lives outside this type.
pub struct Server {
    state: Mutex<State>,
    registry: Registry,
    config: ServerConfig,
    started: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            registry: Registry::new(),
            config,
            started: AtomicBool::new(false),
        })
    }

    /// Bind and start accepting. Idempotent: calling `start` on an
    /// already-started server is a no-op.
    pub async fn start(self: &Arc<Self>, listen_addr: SocketAddr) -> std::io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = match TcpListener::bind(listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let bound = match listener.local_addr() {
            Ok(bound) => bound,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.state.lock().unwrap().addr = Some(bound);

        let closer = Arc::new(TcpCloser::for_listener(&listener)?);
        self.registry.register_listener(closer);

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote_addr)) => self.spawn_driver(stream, remote_addr),
                Err(e) => {
                    if self.is_down() {
                        return;
                    }
                    self.mark_down();
                    error!(error = %e, "accept failed");
                    self.registry.close_listener_only().await;
                    return;
                }
            }
        }
    }

    fn spawn_driver(self: &Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let closer = match TcpCloser::for_stream(&stream) {
            Ok(c) => Arc::new(c),
            Err(_) => return,
        };
        let handle_id = self.registry.register_connection(closer);
        let server = self.clone();
        tokio::spawn(async move {
            driver::drive(server.clone(), stream, remote_addr).await;
            server.registry.deregister(handle_id);
        });
    }

    /// Close the listener only; established connections keep running.
    pub async fn close(&self) {
        self.mark_down();
        self.registry.close_listener_only().await;
    }

    /// Close the listener and force every tracked connection closed.
    pub async fn close_all(&self) {
        self.mark_down();
        self.registry.close_all().await;
    }

    pub fn running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.is_down()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().addr
    }

    pub fn handshake_channel(&self) -> Option<mpsc::Receiver<Arc<Handshake>>> {
        let mut state = self.state.lock().unwrap();
        if state.handshake_rx_taken {
            return None;
        }
        state.handshake_rx_taken = true;
        let (tx, rx) = mpsc::channel(self.config.chan_cap);
        state.handshake_tx = Some(tx);
        Some(rx)
    }

    pub fn request_channel(&self) -> Option<mpsc::Receiver<Request>> {
        let mut state = self.state.lock().unwrap();
        if state.request_rx_taken {
            return None;
        }
        state.request_rx_taken = true;
        let (tx, rx) = mpsc::channel(self.config.chan_cap);
        state.request_tx = Some(tx);
        Some(rx)
    }

    pub fn log_channel(&self) -> Option<mpsc::Receiver<LogEntry>> {
        let mut state = self.state.lock().unwrap();
        if state.log_rx_taken {
            return None;
        }
        state.log_rx_taken = true;
        let (tx, rx) = mpsc::channel(self.config.chan_cap);
        state.log_tx = Some(tx);
        Some(rx)
    }

    pub(crate) fn handshake_sender(&self) -> Option<mpsc::Sender<Arc<Handshake>>> {
        self.state.lock().unwrap().handshake_tx.clone()
    }

    pub(crate) fn request_sender(&self) -> Option<mpsc::Sender<Request>> {
        self.state.lock().unwrap().request_tx.clone()
    }

    pub(crate) fn log_sender(&self) -> Option<mpsc::Sender<LogEntry>> {
        self.state.lock().unwrap().log_tx.clone()
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn mark_down(&self) {
        self.state.lock().unwrap().down = true;
    }

    fn is_down(&self) -> bool {
        self.state.lock().unwrap().down
    }
}
