use std::sync::Arc;
use std::time::Duration;

use libra::codec::{DstAddr, ReplyCode};
use libra::request::Request;
use libra::{NoAuthSubnegotiator, Server, ServerConfig, TcpOutbound};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_server(config: ServerConfig) -> (Arc<Server>, std::net::SocketAddr) {
    let server = Server::new(config);
    server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = server.addr().unwrap();
    (server, addr)
}

/// Accepts one connection, echoes exactly one read back, then drops the
/// connection — so the peer observes a clean EOF right after the echo.
async fn one_shot_echo_listener() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf).await {
                if n > 0 {
                    let _ = stream.write_all(&buf[..n]).await;
                }
            }
        }
    });
    addr
}

/// Accepts one connection and echoes every read back indefinitely.
async fn echo_listener() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (mut r, mut w) = stream.into_split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
    });
    addr
}

#[tokio::test]
async fn no_auth_connect_success_relays_and_closes_on_outbound_eof() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let mut handshake_rx = server.handshake_channel().unwrap();
    let mut request_rx = server.request_channel().unwrap();
    let echo_addr = one_shot_echo_listener().await;

    tokio::spawn(async move {
        let handshake = handshake_rx.recv().await.unwrap();
        handshake.accept(0x00, Arc::new(NoAuthSubnegotiator));

        let req = request_rx.recv().await.unwrap();
        if let Request::Connect(connect) = req {
            let outbound = TcpStream::connect(echo_addr).await.unwrap();
            let outbound = TcpOutbound::new(outbound).unwrap();
            connect.accept(DstAddr::V4([1, 2, 3, 4]), 5000, Box::new(outbound));
        }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0x13, 0x88]);

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn no_acceptable_methods_is_denied_and_closed_after_grace() {
    let config = ServerConfig {
        close_grace: Duration::from_millis(100),
        ..Default::default()
    };
    let (server, addr) = start_server(config).await;
    let mut handshake_rx = server.handshake_channel().unwrap();

    tokio::spawn(async move {
        let handshake = handshake_rx.recv().await.unwrap();
        handshake.deny();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xff]);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn request_auto_deny_replies_general_failure() {
    let config = ServerConfig {
        auto_deny: Duration::from_millis(150),
        ..Default::default()
    };
    let (server, addr) = start_server(config).await;
    let mut handshake_rx = server.handshake_channel().unwrap();
    let request_rx = server.request_channel().unwrap();
    // Hold the receiver alive without ever resolving the request, so the
    // driver's auto-deny timer is what produces the reply.
    std::mem::forget(request_rx);

    tokio::spawn(async move {
        let handshake = handshake_rx.recv().await.unwrap();
        handshake.accept(0x00, Arc::new(NoAuthSubnegotiator));
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(
        reply,
        [
            ReplyCode::GeneralFailure.into(),
            0x00,
            0x01,
            0,
            0,
            0,
            0,
            0,
            0
        ]
    );
}

#[tokio::test]
async fn unsupported_command_replies_and_closes() {
    let config = ServerConfig {
        close_grace: Duration::from_millis(100),
        ..Default::default()
    };
    let (server, addr) = start_server(config).await;
    let mut handshake_rx = server.handshake_channel().unwrap();

    tokio::spawn(async move {
        let handshake = handshake_rx.recv().await.unwrap();
        handshake.accept(0x00, Arc::new(NoAuthSubnegotiator));
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x09, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], u8::from(ReplyCode::CommandNotSupported));

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn bind_two_phase_commits_each_reply_independently() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let mut handshake_rx = server.handshake_channel().unwrap();
    let mut request_rx = server.request_channel().unwrap();
    let echo_addr = echo_listener().await;

    tokio::spawn(async move {
        let handshake = handshake_rx.recv().await.unwrap();
        handshake.accept(0x00, Arc::new(NoAuthSubnegotiator));

        let req = request_rx.recv().await.unwrap();
        if let Request::Bind(bind) = req {
            bind.accept(DstAddr::V4([10, 0, 0, 1]), 4000);
            let outbound = TcpStream::connect(echo_addr).await.unwrap();
            let outbound = TcpOutbound::new(outbound).unwrap();
            bind.bind(DstAddr::V4([10, 0, 0, 2]), 4001, Box::new(outbound));
        }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut first = [0u8; 10];
    client.read_exact(&mut first).await.unwrap();
    assert_eq!(first, [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x0f, 0xa0]);

    let mut second = [0u8; 10];
    client.read_exact(&mut second).await.unwrap();
    assert_eq!(second, [0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x0f, 0xa1]);

    client.write_all(b"bound").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"bound");
}

#[tokio::test]
async fn associate_notifier_fires_once_on_client_close() {
    let (server, addr) = start_server(ServerConfig::default()).await;
    let mut handshake_rx = server.handshake_channel().unwrap();
    let mut request_rx = server.request_channel().unwrap();
    let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let fired_clone = fired.clone();

    tokio::spawn(async move {
        let handshake = handshake_rx.recv().await.unwrap();
        handshake.accept(0x00, Arc::new(NoAuthSubnegotiator));

        let req = request_rx.recv().await.unwrap();
        if let Request::Associate(associate) = req {
            associate.accept(
                DstAddr::V4([0, 0, 0, 0]),
                5000,
                Box::new(move || {
                    fired_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            );
        }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], u8::from(ReplyCode::Succeeded));

    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
}
