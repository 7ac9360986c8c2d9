//! End-to-end tests over loopback for every transport

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use opwire::config::{NetworkConfig, QuicConfig, TransportKind};
use opwire::core::codec::PackCodec;
use opwire::core::packet::{OpCode, Pack};
use opwire::protocol::RateLimiter;
use opwire::service::{RunningServer, ServerBuilder, TcpClient, UdpClient};
use opwire::transport::quic;
use opwire::transport::tls::{TlsClientConfig, TlsServerConfig};
use tokio::io::AsyncWriteExt;

const ECHO: u16 = 1000;
const UPPER: u16 = 1001;
const SESSION: u16 = 1002;

/// Self-signed `localhost` pair in a fresh directory
struct CertDir {
    dir: PathBuf,
    tls: TlsServerConfig,
}

impl CertDir {
    fn new(tag: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("opwire-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let tls = TlsServerConfig::generate_self_signed(dir.join("cert.pem"), dir.join("key.pem")).unwrap();
        Self { dir, tls }
    }

    fn client(&self) -> TlsClientConfig {
        TlsClientConfig::new("localhost").with_root_cert_file(self.tls.cert_path())
    }
}

impl Drop for CertDir {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

fn config(transport: TransportKind, certs: Option<&CertDir>) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.server.transport = transport;
        c.server.worker_capacity = 64;
        c.server.shutdown_grace = Duration::from_millis(500);
        if let Some(certs) = certs {
            c.server.cert_file = Some(certs.tls.cert_path().to_path_buf());
            c.server.key_file = Some(certs.tls.key_path().to_path_buf());
        }
    })
}

async fn start(config: NetworkConfig) -> RunningServer {
    ServerBuilder::new(config)
        .with_default_middleware()
        .handle(ECHO, |ctx| {
            Box::pin(async move {
                let body = ctx.payload().to_vec();
                let _ = ctx.write(body).await;
            })
        })
        .handle(UPPER, |ctx| {
            Box::pin(async move {
                let body = ctx.payload().to_ascii_uppercase();
                let _ = ctx.write(body).await;
            })
        })
        .handle(SESSION, |ctx| {
            Box::pin(async move {
                // "<stream id or dgram>:<alpn>", or "none" off QUIC
                let body = match ctx.session_info() {
                    Some(info) => format!(
                        "{}:{}",
                        info.stream_id.map_or_else(|| "dgram".to_string(), |id| id.to_string()),
                        String::from_utf8_lossy(info.alpn.as_deref().unwrap_or_default()),
                    ),
                    None => "none".to_string(),
                };
                let _ = ctx.write(body).await;
            })
        })
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_tcp_request_ping_and_not_found() {
    let running = start(config(TransportKind::Tcp, None)).await;
    let mut client = TcpClient::connect(&running.local_addr().to_string()).await.unwrap();

    let reply = client.request(OpCode(ECHO), b"hello".to_vec()).await.unwrap();
    assert_eq!(reply.op_code(), OpCode::OK);
    assert_eq!(reply.payload, b"hello");

    let pong = client.ping().await.unwrap();
    assert_eq!(pong.op_code(), OpCode::PONG);
    assert!(pong.payload.is_empty());

    let missing = client.request(OpCode(4242), b"?".to_vec()).await.unwrap();
    assert_eq!(missing.op_code(), OpCode::NOT_FOUND);

    let session = client.request(OpCode(SESSION), Vec::new()).await.unwrap();
    assert_eq!(session.payload, b"none");

    let snapshot = running.metrics().snapshot();
    assert_eq!(snapshot.not_found, 1);
    assert!(snapshot.frames_received >= 3);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tcp_session_survives_many_requests() {
    let running = start(config(TransportKind::Tcp, None)).await;
    let mut client = TcpClient::connect(&running.local_addr().to_string()).await.unwrap();

    for i in 0..100u32 {
        let body = i.to_be_bytes().to_vec();
        let reply = client.request(OpCode(ECHO), body.clone()).await.unwrap();
        assert_eq!(reply.payload, body);
    }

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tcp_garbage_header_closes_session() {
    let running = start(config(TransportKind::Tcp, None)).await;
    let mut stream = tokio::net::TcpStream::connect(running.local_addr()).await.unwrap();

    // declared length 4 is below the header size
    stream
        .write_all(&[0, 0, 0, 4, 0, 0, 0, 1, 0x03, 0xe8, 0, 1])
        .await
        .unwrap();

    // the server drops the connection instead of answering
    let closed = PackCodec::stream().read_frame(&mut stream).await;
    assert!(matches!(closed, Ok(None) | Err(_)));
    assert_eq!(running.metrics().snapshot().decode_errors, 1);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tls_round_trip() {
    let certs = CertDir::new("tls");
    let running = start(config(TransportKind::Tcp, Some(&certs))).await;

    let mut client = TcpClient::connect_tls(&running.local_addr().to_string(), &certs.client())
        .await
        .unwrap();
    let reply = client.request(OpCode(UPPER), b"secure".to_vec()).await.unwrap();
    assert_eq!(reply.payload, b"SECURE");

    let pong = client.ping().await.unwrap();
    assert_eq!(pong.op_code(), OpCode::PONG);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tls_rejects_untrusted_client_setup() {
    let certs = CertDir::new("tls-untrusted");
    let other = CertDir::new("tls-other");
    let running = start(config(TransportKind::Tcp, Some(&certs))).await;

    let result = TcpClient::connect_tls(&running.local_addr().to_string(), &other.client()).await;
    assert!(result.is_err());

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_udp_request_and_ping() {
    let running = start(config(TransportKind::Udp, None)).await;
    let mut client = UdpClient::connect(running.local_addr())
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(2));

    let reply = client.request(OpCode(UPPER), b"datagram".to_vec()).await.unwrap();
    assert_eq!(reply.payload, b"DATAGRAM");

    let pong = client.request(OpCode::PING, Vec::new()).await.unwrap();
    assert_eq!(pong.op_code(), OpCode::PONG);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_udp_peers_get_their_own_replies() {
    let running = start(config(TransportKind::Udp, None)).await;
    let mut a = UdpClient::connect(running.local_addr()).await.unwrap().with_timeout(Duration::from_secs(2));
    let mut b = UdpClient::connect(running.local_addr()).await.unwrap().with_timeout(Duration::from_secs(2));

    let (ra, rb) = tokio::join!(
        a.request(OpCode(ECHO), b"from-a".to_vec()),
        b.request(OpCode(ECHO), b"from-b".to_vec()),
    );
    assert_eq!(ra.unwrap().payload, b"from-a");
    assert_eq!(rb.unwrap().payload, b"from-b");

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_udp_rate_limit_counts_each_peer_port_separately() {
    let running = ServerBuilder::new(config(TransportKind::Udp, None))
        .middleware_with(RateLimiter::new(1, Duration::from_secs(60)))
        .handle(ECHO, |ctx| {
            Box::pin(async move {
                let body = ctx.payload().to_vec();
                let _ = ctx.write(body).await;
            })
        })
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap();

    // both clients share 127.0.0.1 and differ only by source port
    let mut a = UdpClient::connect(running.local_addr()).await.unwrap().with_timeout(Duration::from_secs(2));
    let mut b = UdpClient::connect(running.local_addr()).await.unwrap().with_timeout(Duration::from_secs(2));

    let first_a = a.request(OpCode(ECHO), b"a1".to_vec()).await.unwrap();
    assert_eq!(first_a.op_code(), OpCode::OK);
    assert_eq!(first_a.payload, b"a1");

    let first_b = b.request(OpCode(ECHO), b"b1".to_vec()).await.unwrap();
    assert_eq!(first_b.op_code(), OpCode::OK);
    assert_eq!(first_b.payload, b"b1");

    let second_a = a.request(OpCode(ECHO), b"a2".to_vec()).await.unwrap();
    assert_eq!(second_a.op_code(), OpCode::SERVER_ERROR);
    assert_eq!(running.metrics().snapshot().rate_limited, 1);

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quic_streams_and_datagrams() {
    let certs = CertDir::new("quic");
    let running = start(config(TransportKind::Quic, Some(&certs))).await;
    let codec = PackCodec::stream();

    let (endpoint, connection) = quic::connect(running.local_addr(), &certs.client(), &QuicConfig::default())
        .await
        .unwrap();

    // two frames on one stream; both replies come back on the same stream
    let (mut send, mut recv) = connection.open_bi().await.unwrap();
    for (seq, body) in [(1u32, &b"one"[..]), (2, &b"two"[..])] {
        let frame = codec.encode(&mut Pack::new(OpCode(ECHO), seq, body)).unwrap();
        send.write_all(&frame).await.unwrap();
    }
    let mut replies = vec![
        codec.read_frame(&mut recv).await.unwrap().unwrap(),
        codec.read_frame(&mut recv).await.unwrap().unwrap(),
    ];
    replies.sort_by_key(Pack::sequence_id);
    assert_eq!(replies[0].payload, b"one");
    assert_eq!(replies[1].payload, b"two");

    // handlers see which sub-stream a pack came in on
    let session = codec.encode(&mut Pack::new(OpCode(SESSION), 3, &b""[..])).unwrap();
    send.write_all(&session).await.unwrap();
    let first = codec.read_frame(&mut recv).await.unwrap().unwrap();
    assert_eq!(first.payload, b"0:opwire");
    send.finish().unwrap();

    let (mut send2, mut recv2) = connection.open_bi().await.unwrap();
    let session = codec.encode(&mut Pack::new(OpCode(SESSION), 4, &b""[..])).unwrap();
    send2.write_all(&session).await.unwrap();
    let second = codec.read_frame(&mut recv2).await.unwrap().unwrap();
    assert_eq!(second.payload, b"4:opwire");
    send2.finish().unwrap();

    // datagrams share the router with streams
    let datagram = PackCodec::datagram()
        .encode(&mut Pack::new(OpCode(UPPER), 7, &b"quick"[..]))
        .unwrap();
    connection.send_datagram(datagram).unwrap();
    let reply: Bytes = tokio::time::timeout(Duration::from_secs(2), connection.read_datagram())
        .await
        .unwrap()
        .unwrap();
    let reply = PackCodec::datagram().decode_datagram(&reply).unwrap();
    assert_eq!(reply.sequence_id(), 7);
    assert_eq!(reply.payload, b"QUICK");

    let datagram = PackCodec::datagram()
        .encode(&mut Pack::new(OpCode(SESSION), 8, &b""[..]))
        .unwrap();
    connection.send_datagram(datagram).unwrap();
    let reply: Bytes = tokio::time::timeout(Duration::from_secs(2), connection.read_datagram())
        .await
        .unwrap()
        .unwrap();
    let reply = PackCodec::datagram().decode_datagram(&reply).unwrap();
    assert_eq!(reply.payload, b"dgram:opwire");

    connection.close(0u32.into(), b"done");
    endpoint.wait_idle().await;
    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_quic_client_rejects_unknown_certificate() {
    let certs = CertDir::new("quic-untrusted");
    let other = CertDir::new("quic-other");
    let running = start(config(TransportKind::Quic, Some(&certs))).await;

    let result = quic::connect(running.local_addr(), &other.client(), &QuicConfig::default()).await;
    assert!(result.is_err());

    running.shutdown().await.unwrap();
}

#[cfg(feature = "dtls")]
mod dtls {
    use std::sync::Arc;

    use webrtc_dtls::config::{Config, ExtendedMasterSecretType};
    use webrtc_dtls::conn::DTLSConn;
    use webrtc_util::conn::Conn;

    use super::*;

    #[tokio::test]
    async fn test_dtls_round_trip_and_bad_record() {
        let certs = CertDir::new("dtls");
        let running = start(config(TransportKind::Udp, Some(&certs))).await;

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(running.local_addr()).await.unwrap();
        let client_config = Config {
            insecure_skip_verify: true,
            server_name: "localhost".to_string(),
            extended_master_secret: ExtendedMasterSecretType::Require,
            ..Default::default()
        };
        let conn = DTLSConn::new(Arc::new(socket), client_config, true, None)
            .await
            .unwrap();

        let codec = PackCodec::datagram();
        let mut buf = vec![0u8; 2048];

        // a runt record is dropped; the session keeps reading
        conn.send(&[1, 2, 3]).await.unwrap();

        let frame = codec.encode(&mut Pack::new(OpCode(UPPER), 3, &b"dtls"[..])).unwrap();
        conn.send(&frame).await.unwrap();
        let len = tokio::time::timeout(Duration::from_secs(2), conn.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = codec.decode_datagram(&buf[..len]).unwrap();
        assert_eq!(reply.sequence_id(), 3);
        assert_eq!(reply.payload, b"DTLS");
        assert_eq!(running.metrics().snapshot().decode_errors, 1);

        conn.close().await.ok();
        running.shutdown().await.unwrap();
    }
}
