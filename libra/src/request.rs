use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::codec::{DstAddr, ReplyCode};
use crate::io::Outbound;

/// Common fields every command-specific request carries, decorated by the
/// driver before handoff.
pub struct RequestMeta {
    pub dst_addr: DstAddr,
    pub dst_port: u16,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

pub(crate) struct ConnectOutcome {
    pub rep: ReplyCode,
    pub bound_addr: DstAddr,
    pub bound_port: u16,
    pub outbound: Option<Box<dyn Outbound>>,
}

impl ConnectOutcome {
    pub(crate) fn denied(rep: ReplyCode) -> Self {
        Self {
            rep,
            bound_addr: DstAddr::unspecified(),
            bound_port: 0,
            outbound: None,
        }
    }
}

/// A CONNECT request. `accept` transfers ownership of the outbound
/// connection to the driver; `deny` commits a failure reply with no
/// outbound handle.
pub struct ConnectRequest {
    pub meta: RequestMeta,
    decision: Mutex<Option<oneshot::Sender<ConnectOutcome>>>,
}

impl ConnectRequest {
    pub(crate) fn new(meta: RequestMeta) -> (Arc<Self>, oneshot::Receiver<ConnectOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                meta,
                decision: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn accept(&self, bound_addr: DstAddr, bound_port: u16, outbound: Box<dyn Outbound>) {
        self.resolve(ConnectOutcome {
            rep: ReplyCode::Succeeded,
            bound_addr,
            bound_port,
            outbound: Some(outbound),
        });
    }

    pub fn deny(&self, rep: ReplyCode, bound_addr: DstAddr, bound_port: u16) {
        self.resolve(ConnectOutcome {
            rep,
            bound_addr,
            bound_port,
            outbound: None,
        });
    }

    pub(crate) fn auto_deny(&self) {
        self.resolve(ConnectOutcome::denied(ReplyCode::GeneralFailure));
    }

    fn resolve(&self, outcome: ConnectOutcome) {
        if let Some(tx) = self.decision.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }
}

pub(crate) struct BindFirstOutcome {
    pub rep: ReplyCode,
    pub bound_addr: DstAddr,
    pub bound_port: u16,
}

impl BindFirstOutcome {
    pub(crate) fn denied(rep: ReplyCode) -> Self {
        Self {
            rep,
            bound_addr: DstAddr::unspecified(),
            bound_port: 0,
        }
    }
}

pub(crate) struct BindSecondOutcome {
    pub rep: ReplyCode,
    pub bound_addr: DstAddr,
    pub bound_port: u16,
    pub outbound: Option<Box<dyn Outbound>>,
}

impl BindSecondOutcome {
    pub(crate) fn denied(rep: ReplyCode) -> Self {
        Self {
            rep,
            bound_addr: DstAddr::unspecified(),
            bound_port: 0,
            outbound: None,
        }
    }
}

/// A BIND request. Both phases' channels are created together at
/// construction time so the embedder can never call `bind` before a second
/// phase receiver exists (which would otherwise race first-phase accept).
pub struct BindRequest {
    pub meta: RequestMeta,
    first: Mutex<Option<oneshot::Sender<BindFirstOutcome>>>,
    second: Mutex<Option<oneshot::Sender<BindSecondOutcome>>>,
}

impl BindRequest {
    pub(crate) fn new(
        meta: RequestMeta,
    ) -> (
        Arc<Self>,
        oneshot::Receiver<BindFirstOutcome>,
        oneshot::Receiver<BindSecondOutcome>,
    ) {
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        (
            Arc::new(Self {
                meta,
                first: Mutex::new(Some(first_tx)),
                second: Mutex::new(Some(second_tx)),
            }),
            first_rx,
            second_rx,
        )
    }

    /// Commit the first reply: the address the proxy is now listening on.
    pub fn accept(&self, bound_addr: DstAddr, bound_port: u16) {
        if let Some(tx) = self.first.lock().unwrap().take() {
            let _ = tx.send(BindFirstOutcome {
                rep: ReplyCode::Succeeded,
                bound_addr,
                bound_port,
            });
        }
    }

    pub fn deny(&self, rep: ReplyCode) {
        if let Some(tx) = self.first.lock().unwrap().take() {
            let _ = tx.send(BindFirstOutcome::denied(rep));
        }
    }

    pub(crate) fn auto_deny_first(&self) {
        self.deny(ReplyCode::GeneralFailure);
    }

    /// Commit the second reply once the peer has connected, transferring
    /// ownership of the outbound connection to the driver.
    pub fn bind(&self, bound_addr: DstAddr, bound_port: u16, outbound: Box<dyn Outbound>) {
        if let Some(tx) = self.second.lock().unwrap().take() {
            let _ = tx.send(BindSecondOutcome {
                rep: ReplyCode::Succeeded,
                bound_addr,
                bound_port,
                outbound: Some(outbound),
            });
        }
    }

    pub fn deny_second(&self, rep: ReplyCode) {
        if let Some(tx) = self.second.lock().unwrap().take() {
            let _ = tx.send(BindSecondOutcome::denied(rep));
        }
    }

    pub(crate) fn auto_deny_second(&self) {
        self.deny_second(ReplyCode::GeneralFailure);
    }
}

pub(crate) struct AssociateOutcome {
    pub rep: ReplyCode,
    pub bound_addr: DstAddr,
    pub bound_port: u16,
    pub notifier: Option<Box<dyn FnOnce() + Send>>,
}

impl AssociateOutcome {
    pub(crate) fn denied(rep: ReplyCode) -> Self {
        Self {
            rep,
            bound_addr: DstAddr::unspecified(),
            bound_port: 0,
            notifier: None,
        }
    }
}

/// An ASSOCIATE request. `notifier` fires exactly once, whenever the held
/// control connection stops being readable for any reason (client close or
/// a forced close via the registry).
pub struct AssociateRequest {
    pub meta: RequestMeta,
    decision: Mutex<Option<oneshot::Sender<AssociateOutcome>>>,
}

impl AssociateRequest {
    pub(crate) fn new(meta: RequestMeta) -> (Arc<Self>, oneshot::Receiver<AssociateOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                meta,
                decision: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub fn accept(
        &self,
        bound_addr: DstAddr,
        bound_port: u16,
        notifier: Box<dyn FnOnce() + Send>,
    ) {
        self.resolve(AssociateOutcome {
            rep: ReplyCode::Succeeded,
            bound_addr,
            bound_port,
            notifier: Some(notifier),
        });
    }

    pub fn deny(&self, rep: ReplyCode, bound_addr: DstAddr, bound_port: u16) {
        self.resolve(AssociateOutcome {
            rep,
            bound_addr,
            bound_port,
            notifier: None,
        });
    }

    pub(crate) fn auto_deny(&self) {
        self.resolve(AssociateOutcome::denied(ReplyCode::GeneralFailure));
    }

    fn resolve(&self, outcome: AssociateOutcome) {
        if let Some(tx) = self.decision.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }
}

/// A decoded request, tagged by command. Modeled as a sum rather than an
/// inheritance hierarchy since each command's one-shots differ in shape.
pub enum Request {
    Connect(Arc<ConnectRequest>),
    Bind(Arc<BindRequest>),
    Associate(Arc<AssociateRequest>),
}

impl Request {
    pub fn meta(&self) -> &RequestMeta {
        match self {
            Request::Connect(r) => &r.meta,
            Request::Bind(r) => &r.meta,
            Request::Associate(r) => &r.meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> RequestMeta {
        RequestMeta {
            dst_addr: DstAddr::V4([1, 2, 3, 4]),
            dst_port: 80,
            local_addr: "127.0.0.1:1080".parse().unwrap(),
            remote_addr: "127.0.0.1:9999".parse().unwrap(),
        }
    }

    struct NullOutbound;
    impl tokio::io::AsyncRead for NullOutbound {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }
    impl tokio::io::AsyncWrite for NullOutbound {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }
    impl Outbound for NullOutbound {
        fn closer(&self) -> Arc<dyn crate::registry::Closer> {
            struct NoopCloser;
            #[async_trait::async_trait]
            impl crate::registry::Closer for NoopCloser {
                async fn close(&self) -> std::io::Result<()> {
                    Ok(())
                }
            }
            Arc::new(NoopCloser)
        }
    }

    #[tokio::test]
    async fn connect_second_accept_after_deny_is_a_no_op() {
        let (req, rx) = ConnectRequest::new(meta());
        req.deny(ReplyCode::ConnectionRefused, DstAddr::unspecified(), 0);
        req.accept(DstAddr::unspecified(), 0, Box::new(NullOutbound));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.rep, ReplyCode::ConnectionRefused);
        assert!(outcome.outbound.is_none());
    }

    #[tokio::test]
    async fn bind_second_phase_independent_of_first() {
        let (req, first_rx, second_rx) = BindRequest::new(meta());
        req.accept(DstAddr::V4([1, 1, 1, 1]), 1111);
        let first = first_rx.await.unwrap();
        assert_eq!(first.rep, ReplyCode::Succeeded);
        assert_eq!(first.bound_port, 1111);

        req.bind(DstAddr::V4([2, 2, 2, 2]), 2222, Box::new(NullOutbound));
        let second = second_rx.await.unwrap();
        assert_eq!(second.bound_port, 2222);
        assert!(second.outbound.is_some());
    }

    #[tokio::test]
    async fn associate_notifier_delivered_on_accept() {
        let (req, rx) = AssociateRequest::new(meta());
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired_clone = fired.clone();
        req.accept(
            DstAddr::V4([0, 0, 0, 0]),
            5000,
            Box::new(move || fired_clone.store(true, std::sync::atomic::Ordering::SeqCst)),
        );
        let outcome = rx.await.unwrap();
        (outcome.notifier.unwrap())();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }
}
