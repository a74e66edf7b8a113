use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::capsulate::Subnegotiator;
use crate::codec::NO_ACCEPTABLE_METHODS;

pub(crate) struct HandshakeOutcome {
    pub method: u8,
    pub negotiator: Option<Arc<dyn Subnegotiator>>,
    pub timed_out: bool,
}

impl HandshakeOutcome {
    pub(crate) fn denied(timed_out: bool) -> Self {
        Self {
            method: NO_ACCEPTABLE_METHODS,
            negotiator: None,
            timed_out,
        }
    }
}

/// Handed out to policy once a greeting has been read. `methods` is the
/// client's offered method list; `accept`/`deny` are one-shot, guarded so
/// that the auto-deny timer racing a real accept never overrides it.
pub struct Handshake {
    pub methods: Vec<u8>,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    decision: Mutex<Option<oneshot::Sender<HandshakeOutcome>>>,
}

impl Handshake {
    pub(crate) fn new(
        methods: Vec<u8>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> (Arc<Self>, oneshot::Receiver<HandshakeOutcome>) {
        let (tx, rx) = oneshot::channel();
        let handshake = Arc::new(Self {
            methods,
            local_addr,
            remote_addr,
            decision: Mutex::new(Some(tx)),
        });
        (handshake, rx)
    }

    /// Accept with `method`, which must be one of the offered methods. A
    /// method not in `methods` is treated as a deny. A no-op once the
    /// handshake has already been decided.
    pub fn accept(&self, method: u8, negotiator: Arc<dyn Subnegotiator>) {
        if !self.methods.contains(&method) {
            self.deny();
            return;
        }
        self.resolve(HandshakeOutcome {
            method,
            negotiator: Some(negotiator),
            timed_out: false,
        });
    }

    /// Deny the handshake. A no-op once already decided.
    pub fn deny(&self) {
        self.resolve(HandshakeOutcome::denied(false));
    }

    pub(crate) fn auto_deny(&self) {
        self.resolve(HandshakeOutcome::denied(true));
    }

    fn resolve(&self, outcome: HandshakeOutcome) {
        if let Some(tx) = self.decision.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }
}
