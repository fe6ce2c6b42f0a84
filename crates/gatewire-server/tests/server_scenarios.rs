//! End-to-end scenarios over real sockets on ephemeral ports.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use gatewire_client::{Reply, TcpClient, UdpClient};
use gatewire_core::{
    HandlerAttributes, HandlerError, PacketContext, PacketHandler, Pipeline, PipelineConfig,
    RatePolicy,
};
use gatewire_proto::{
    BufferPool, ControlReason, ControlType, IDENTIFIER_SIZE, Identifier, MAGIC, Packet, PayloadBuf,
};
use gatewire_server::{IpLimiterConfig, Server, ServerConfig, TcpListenerConfig, UdpListenerConfig};
use tokio::io::AsyncReadExt;

/// Echoes the payload uppercased.
struct EchoHandler;

#[async_trait::async_trait]
impl PacketHandler for EchoHandler {
    async fn handle(&self, ctx: PacketContext) -> Result<Vec<Packet>, HandlerError> {
        let upper: Vec<u8> = ctx.packet.payload().iter().map(u8::to_ascii_uppercase).collect();
        let payload = PayloadBuf::copy_from(&upper, &ctx.pool)
            .map_err(|e| HandlerError::Internal(e.to_string()))?;
        Ok(vec![Packet::new(ctx.packet.op_code(), ctx.packet.transport(), payload)])
    }
}

struct TestServer {
    server: Arc<Server>,
    tcp_addr: SocketAddr,
    udp_addr: Option<SocketAddr>,
    run_task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(max_per_ip: u32, with_udp: bool, register: impl FnOnce(&mut Pipeline)) -> Self {
        let pool = BufferPool::with_defaults();
        let mut pipeline = Pipeline::new(PipelineConfig::default(), pool);
        register(&mut pipeline);

        let config = ServerConfig {
            tcp: TcpListenerConfig {
                bind: "127.0.0.1:0".parse().unwrap(),
                max_simultaneous_accepts: 4,
                default_permission_level: 1,
                ..TcpListenerConfig::default()
            },
            udp: with_udp.then(|| UdpListenerConfig {
                bind: "127.0.0.1:0".parse().unwrap(),
                ..UdpListenerConfig::default()
            }),
            ip_limits: IpLimiterConfig {
                max_connections_per_ip: max_per_ip,
                ..IpLimiterConfig::default()
            },
        };

        let server = Arc::new(Server::bind(config, pipeline).await.unwrap());
        let tcp_addr = server.tcp().local_addr().unwrap();
        let udp_addr = server.udp().map(|u| u.local_addr().unwrap());

        let run_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server.run().await.unwrap();
            })
        };
        // Let the accept loops spin up
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self { server, tcp_addr, udp_addr, run_task }
    }

    async fn stop(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.run_task).await;
    }
}

fn expect_packet(reply: Reply) -> Packet {
    reply.into_packet().expect("expected an application packet")
}

#[tokio::test]
async fn s1_echo_round_trip() {
    let server = TestServer::start(32, false, |pipeline| {
        pipeline.register(HandlerAttributes::for_op(0x0001), Arc::new(EchoHandler));
    })
    .await;

    let mut client = TcpClient::connect(server.tcp_addr).await.unwrap();
    let request = client.packet(0x0001, b"HELLO").unwrap();

    // The 11-byte header prefix is bit-exact
    let wire = request.encode().unwrap();
    assert_eq!(&wire[0..4], &MAGIC.to_le_bytes());
    assert_eq!(&wire[4..6], &0x0001u16.to_le_bytes());
    assert_eq!(wire[8], 1); // TCP
    assert_eq!(&wire[9..11], &16u16.to_le_bytes());

    let reply = expect_packet(client.round_trip(&request).await.unwrap());
    assert_eq!(reply.op_code(), 0x0001);
    assert_eq!(reply.payload(), b"HELLO");
    assert_eq!(reply.payload().len(), 5);

    server.stop().await;
}

#[tokio::test]
async fn s2_rate_limited_burst() {
    let server = TestServer::start(32, false, |pipeline| {
        pipeline.register(
            HandlerAttributes::for_op(0x0010).rate_limited(RatePolicy::new(8, 8)),
            Arc::new(EchoHandler),
        );
    })
    .await;

    let mut client = TcpClient::connect(server.tcp_addr).await.unwrap();
    let request = client.packet(0x0010, b"x").unwrap();
    for _ in 0..100 {
        client.send(&request).await.unwrap();
    }

    let mut echoed = 0;
    let mut throttled = 0;
    for _ in 0..100 {
        match client.recv().await.unwrap() {
            Reply::Packet(_) => echoed += 1,
            Reply::Control(frame) => {
                assert_eq!(frame.control_type, ControlType::Throttle);
                assert_eq!(frame.reason, ControlReason::RateLimited);
                // Retry is reported in 100 ms steps: ~125 ms to the next token
                assert!(frame.arg1 <= 1);
                throttled += 1;
            },
        }
    }

    assert!((8..=12).contains(&echoed), "echoed {echoed}");
    assert_eq!(echoed + throttled, 100);

    server.stop().await;
}

#[tokio::test]
async fn s3_permission_denied() {
    let server = TestServer::start(32, false, |pipeline| {
        pipeline.register(
            HandlerAttributes::for_op(0xAA).require_permission(5),
            Arc::new(EchoHandler),
        );
    })
    .await;

    let mut client = TcpClient::connect(server.tcp_addr).await.unwrap();
    let request = client.packet(0xAA, b"").unwrap();

    let frame = client
        .round_trip(&request)
        .await
        .unwrap()
        .into_control()
        .expect("expected a control frame");
    assert_eq!(frame.control_type, ControlType::Fail);
    assert_eq!(frame.reason, ControlReason::Unauthenticated);
    assert_eq!(frame.arg0, 5);
    assert_eq!(frame.arg1, 1);
    assert_eq!(frame.arg2, 0xAA);

    server.stop().await;
}

#[tokio::test]
async fn s6_per_ip_connection_cap() {
    let server = TestServer::start(2, false, |pipeline| {
        pipeline.register(HandlerAttributes::for_op(0x0001), Arc::new(EchoHandler));
    })
    .await;

    let mut first = TcpClient::connect(server.tcp_addr).await.unwrap();
    let mut second = TcpClient::connect(server.tcp_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both admitted connections work
    for client in [&mut first, &mut second] {
        let request = client.packet(0x0001, b"ok").unwrap();
        let reply = expect_packet(client.round_trip(&request).await.unwrap());
        assert_eq!(reply.payload(), b"OK");
    }

    // The third connect is dropped at accept: clean close, no data
    let mut third = tokio::net::TcpStream::connect(server.tcp_addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), third.read(&mut buf))
        .await
        .expect("server should close the third connection");
    assert_eq!(read.unwrap(), 0, "expected EOF");

    server.stop().await;
}

#[tokio::test]
async fn udp_session_echo() {
    let server = TestServer::start(32, true, |pipeline| {
        pipeline.register(HandlerAttributes::for_op(0x0001), Arc::new(EchoHandler));
    })
    .await;
    let udp_addr = server.udp_addr.unwrap();

    let id = Identifier([7u8; IDENTIFIER_SIZE]);
    let client = UdpClient::bind(udp_addr, id).await.unwrap();

    // Sessions are registered out of band; an unknown identity is dropped
    let request = client.packet(0x0001, b"hello udp").unwrap();
    client.send(&request).await.unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(300), client.recv()).await;
    assert!(silent.is_err(), "unknown session must be dropped silently");

    // Register the session and replay
    let session = server
        .server
        .udp()
        .unwrap()
        .register_session(id, client.local_addr().unwrap());
    session.set_ready(1, Vec::new(), gatewire_crypto::CipherSuite::default());

    client.send(&request).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("expected an echo datagram")
        .unwrap();
    assert_eq!(expect_packet(reply).payload(), b"HELLO UDP");

    server.stop().await;
}

#[tokio::test]
async fn short_datagrams_are_dropped() {
    let server = TestServer::start(32, true, |_| {}).await;
    let udp_addr = server.udp_addr.unwrap();

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&[0u8; 10], udp_addr).await.unwrap();

    let mut buf = [0u8; 64];
    let silent =
        tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(silent.is_err());

    server.stop().await;
}

#[tokio::test]
async fn malformed_header_closes_connection() {
    let server = TestServer::start(32, false, |pipeline| {
        pipeline.register(HandlerAttributes::for_op(0x0001), Arc::new(EchoHandler));
    })
    .await;

    let client = TcpClient::connect(server.tcp_addr).await.unwrap();

    // Garbage magic number, written straight to the socket
    let mut raw = tokio::net::TcpStream::connect(server.tcp_addr).await.unwrap();
    let mut bogus = client.packet(0x0001, b"x").unwrap().encode().unwrap();
    bogus[0] ^= 0xFF;
    tokio::io::AsyncWriteExt::write_all(&mut raw, &bogus).await.unwrap();

    // The server answers with MALFORMED_PACKET (11-byte header plus the
    // 21-byte control payload) and closes
    let mut reply = [0u8; 32];
    tokio::time::timeout(Duration::from_secs(2), raw.read_exact(&mut reply))
        .await
        .expect("expected a reply")
        .unwrap();
    let packet = Packet::decode(&reply, client.pool()).unwrap();
    let frame = gatewire_proto::ControlFrame::from_packet(&packet).unwrap();
    assert_eq!(frame.control_type, ControlType::Fail);
    assert_eq!(frame.reason, ControlReason::MalformedPacket);

    let mut probe = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut probe))
        .await
        .expect("connection should close");
    assert_eq!(read.unwrap(), 0);

    server.stop().await;
}
