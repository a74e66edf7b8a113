use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, error, info, warn};

use crate::capsulate::NegotiateError;
use crate::codec::{DstAddr, GreetingCodec, ReplyCode, RequestCodec, BIND, CONNECT, NO_ACCEPTABLE_METHODS, UDP_ASSOCIATE};
use crate::errors::Error;
use crate::handshake::{Handshake, HandshakeOutcome};
use crate::io::IoStream;
use crate::log::LogEntry;
use crate::relay::relay;
use crate::request::{
    AssociateOutcome, AssociateRequest, BindFirstOutcome, BindRequest, BindSecondOutcome,
    ConnectOutcome, ConnectRequest, Request, RequestMeta,
};
use crate::server::Server;
use crate::ServerConfig;

async fn read_frame<S, C>(framed: &mut Framed<S, C>) -> Result<C::Item, Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    C: Decoder<Error = Error>,
{
    match framed.next().await {
        Some(item) => item,
        None => Err(Error::Io(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        ))),
    }
}

async fn write_frame<S, C, Item>(framed: &mut Framed<S, C>, item: Item) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    C: Encoder<Item, Error = Error>,
{
    framed.send(item).await
}

/// Wait on `rx` bounded by `period`. On elapsed, invoke `on_timeout` (which
/// resolves the same one-shot via its auto-deny path) and await `rx` again
/// so the resolution just sent is observed rather than lost.
async fn await_decision<T>(
    rx: &mut tokio::sync::oneshot::Receiver<T>,
    period: std::time::Duration,
    on_timeout: impl FnOnce(),
) -> Option<T> {
    match tokio::time::timeout(period, &mut *rx).await {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(_canceled)) => None,
        Err(_elapsed) => {
            on_timeout();
            rx.await.ok()
        }
    }
}

fn log(server: &Server, entry: LogEntry) {
    crate::log::emit(server.log_sender().as_ref(), entry);
}

/// Drives a single accepted connection through the full protocol state
/// machine, from greeting to relay or hold, to close.
pub(crate) async fn drive(server: Arc<Server>, stream: TcpStream, remote_addr: SocketAddr) {
    let local_addr = match stream.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let config = server.config().clone();

    let mut greeting = Framed::new(stream, GreetingCodec);
    let methods = match read_frame(&mut greeting).await {
        Ok(methods) => methods,
        Err(e) => {
            debug!(%remote_addr, error = %e, "greeting read failed");
            return;
        }
    };

    let (handshake, mut hs_rx) = Handshake::new(methods, local_addr, remote_addr);
    let sent = match server.handshake_sender() {
        Some(tx) => tx.try_send(handshake.clone()).is_ok(),
        None => false,
    };

    let outcome = if sent {
        await_decision(&mut hs_rx, config.auto_deny, || handshake.auto_deny())
            .await
            .unwrap_or_else(|| HandshakeOutcome::denied(false))
    } else {
        HandshakeOutcome::denied(false)
    };

    if outcome.method == NO_ACCEPTABLE_METHODS || outcome.negotiator.is_none() {
        let _ = write_frame(&mut greeting, NO_ACCEPTABLE_METHODS).await;
        log(&server, LogEntry::new(crate::log::Level::Info, "no_acceptable_methods").with_endpoint(remote_addr));
        close_after_grace(greeting.into_inner(), config.close_grace).await;
        return;
    }
    let negotiator = outcome.negotiator.unwrap();
    if let Err(e) = write_frame(&mut greeting, outcome.method).await {
        debug!(%remote_addr, error = %e, "method reply write failed");
        return;
    }

    let stream = greeting.into_inner();
    let capsule: Box<dyn IoStream> = match negotiator.negotiate(stream).await {
        Ok(capsule) => capsule,
        Err((stream, NegotiateError::AuthFailed | NegotiateError::Malformed)) => {
            warn!(%remote_addr, "subnegotiation rejected client");
            log(&server, LogEntry::new(crate::log::Level::Warn, "subnegotiation_rejected").with_endpoint(remote_addr));
            close_after_grace(stream, config.close_grace).await;
            return;
        }
        Err((stream, NegotiateError::Other(e))) => {
            error!(%remote_addr, error = %e, "subnegotiation failed");
            log(&server, LogEntry::new(crate::log::Level::Error, "subnegotiation_failed").with_endpoint(remote_addr).with_cause(e));
            close_after_grace(stream, config.close_grace).await;
            return;
        }
    };

    let mut request_framed = Framed::new(capsule, RequestCodec);
    let (cmd, dst_addr, dst_port) = match read_frame(&mut request_framed).await {
        Ok(frame) => frame,
        Err(e) => {
            debug!(%remote_addr, error = %e, "request read failed");
            return;
        }
    };

    if !matches!(cmd, CONNECT | BIND | UDP_ASSOCIATE) {
        let _ = write_frame(
            &mut request_framed,
            (
                ReplyCode::CommandNotSupported.into(),
                DstAddr::unspecified(),
                0,
            ),
        )
        .await;
        close_after_grace(request_framed.into_inner(), config.close_grace).await;
        return;
    }

    let meta = RequestMeta {
        dst_addr,
        dst_port,
        local_addr,
        remote_addr,
    };

    match cmd {
        CONNECT => drive_connect(&server, request_framed, meta, &config).await,
        BIND => drive_bind(&server, request_framed, meta, &config).await,
        UDP_ASSOCIATE => drive_associate(&server, request_framed, meta, &config).await,
        _ => unreachable!("validated above"),
    }
}

async fn drive_connect(
    server: &Arc<Server>,
    mut framed: Framed<Box<dyn IoStream>, RequestCodec>,
    meta: RequestMeta,
    config: &ServerConfig,
) {
    let remote_addr = meta.remote_addr;
    let (req, mut rx) = ConnectRequest::new(meta);
    let sent = match server.request_sender() {
        Some(tx) => tx.try_send(Request::Connect(req.clone())).is_ok(),
        None => false,
    };

    let outcome = if sent {
        await_decision(&mut rx, config.auto_deny, || req.auto_deny())
            .await
            .unwrap_or_else(|| ConnectOutcome::denied(ReplyCode::GeneralFailure))
    } else {
        ConnectOutcome::denied(ReplyCode::GeneralFailure)
    };

    let ok = outcome.rep == ReplyCode::Succeeded && outcome.outbound.is_some();
    if write_frame(&mut framed, (outcome.rep.into(), outcome.bound_addr, outcome.bound_port))
        .await
        .is_err()
    {
        return;
    }
    if !ok {
        close_after_grace(framed.into_inner(), config.close_grace).await;
        return;
    }

    let outbound = outcome.outbound.unwrap();
    let outbound_closer = outbound.closer();
    let handle_id = server.registry().register_connection(outbound_closer);
    let inbound = framed.into_inner();
    if let Err(e) = relay(inbound, outbound).await {
        debug!(%remote_addr, error = %e, "relay ended");
    }
    server.registry().deregister(handle_id);
}

async fn drive_bind(
    server: &Arc<Server>,
    mut framed: Framed<Box<dyn IoStream>, RequestCodec>,
    meta: RequestMeta,
    config: &ServerConfig,
) {
    let remote_addr = meta.remote_addr;
    let (req, mut first_rx, mut second_rx) = BindRequest::new(meta);
    let sent = match server.request_sender() {
        Some(tx) => tx.try_send(Request::Bind(req.clone())).is_ok(),
        None => false,
    };

    let first = if sent {
        await_decision(&mut first_rx, config.auto_deny, || req.auto_deny_first())
            .await
            .unwrap_or_else(|| BindFirstOutcome::denied(ReplyCode::GeneralFailure))
    } else {
        BindFirstOutcome::denied(ReplyCode::GeneralFailure)
    };

    if write_frame(&mut framed, (first.rep.into(), first.bound_addr, first.bound_port))
        .await
        .is_err()
    {
        return;
    }
    if first.rep != ReplyCode::Succeeded {
        close_after_grace(framed.into_inner(), config.close_grace).await;
        return;
    }

    let second = await_decision(&mut second_rx, config.auto_deny, || req.auto_deny_second())
        .await
        .unwrap_or_else(|| BindSecondOutcome::denied(ReplyCode::GeneralFailure));

    let ok = second.rep == ReplyCode::Succeeded && second.outbound.is_some();
    if write_frame(&mut framed, (second.rep.into(), second.bound_addr, second.bound_port))
        .await
        .is_err()
    {
        return;
    }
    if !ok {
        close_after_grace(framed.into_inner(), config.close_grace).await;
        return;
    }

    let outbound = second.outbound.unwrap();
    let outbound_closer = outbound.closer();
    let handle_id = server.registry().register_connection(outbound_closer);
    let inbound = framed.into_inner();
    if let Err(e) = relay(inbound, outbound).await {
        debug!(%remote_addr, error = %e, "relay ended");
    }
    server.registry().deregister(handle_id);
}

async fn drive_associate(
    server: &Arc<Server>,
    mut framed: Framed<Box<dyn IoStream>, RequestCodec>,
    meta: RequestMeta,
    config: &ServerConfig,
) {
    let (req, mut rx) = AssociateRequest::new(meta);
    let sent = match server.request_sender() {
        Some(tx) => tx.try_send(Request::Associate(req.clone())).is_ok(),
        None => false,
    };

    let outcome = if sent {
        await_decision(&mut rx, config.auto_deny, || req.auto_deny())
            .await
            .unwrap_or_else(|| AssociateOutcome::denied(ReplyCode::GeneralFailure))
    } else {
        AssociateOutcome::denied(ReplyCode::GeneralFailure)
    };

    let ok = outcome.rep == ReplyCode::Succeeded && outcome.notifier.is_some();
    if write_frame(&mut framed, (outcome.rep.into(), outcome.bound_addr, outcome.bound_port))
        .await
        .is_err()
    {
        if let Some(notifier) = outcome.notifier {
            notifier();
        }
        return;
    }
    if !ok {
        close_after_grace(framed.into_inner(), config.close_grace).await;
        return;
    }

    let notifier = outcome.notifier.unwrap();
    let mut stream = framed.into_inner();
    let mut sink = [0u8; 1];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    notifier();
    info!("association control connection closed");
}

async fn close_after_grace<S>(mut stream: S, grace: std::time::Duration)
where
    S: tokio::io::AsyncWrite + Unpin,
{
    tokio::time::sleep(grace).await;
    let _ = stream.shutdown().await;
}
