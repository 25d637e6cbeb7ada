use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use udpmux::datagram::memory_transport_pair;
use udpmux::udp::udp_message::Defragger;
use udpmux::{
    DatagramConfig, DatagramConn, DatagramError, DatagramTransport, SessionMetadata,
    TrafficCounters, UdpDispatcher, UdpMessage, UdpPacketConn, UdpSessionHandler,
};

const MAX_DATAGRAM_SIZE: usize = 256;

/// Writes every packet back to the session it came from.
struct EchoHandler {
    sessions: mpsc::UnboundedSender<SessionMetadata>,
}

#[async_trait]
impl UdpSessionHandler for EchoHandler {
    async fn new_packet_connection(
        &self,
        mut conn: UdpPacketConn,
        metadata: SessionMetadata,
    ) -> anyhow::Result<()> {
        self.sessions.send(metadata)?;
        while let Ok(packet) = conn.read_packet().await {
            conn.write_packet(&packet.payload, &packet.destination)
                .await?;
        }
        Ok(())
    }
}

struct Harness {
    client: Arc<DatagramConn>,
    server: Arc<DatagramConn>,
    dispatcher: Arc<UdpDispatcher>,
    dispatch_task: JoinHandle<Result<(), DatagramError>>,
    sessions: mpsc::UnboundedReceiver<SessionMetadata>,
}

fn start(config: DatagramConfig) -> Harness {
    let _ = pretty_env_logger::try_init();

    let (client_side, server_side) = memory_transport_pair(MAX_DATAGRAM_SIZE);
    let client = DatagramConn::start(client_side, &config, TrafficCounters::new()).unwrap();
    let counters = TrafficCounters::new();
    let server = DatagramConn::start(server_side, &config, counters.clone()).unwrap();

    let (tx, sessions) = mpsc::unbounded_channel();
    let dispatcher = Arc::new(
        UdpDispatcher::new(server.clone(), Arc::new(EchoHandler { sessions: tx }), config)
            .with_counters(counters),
    );
    let dispatch_task = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });

    Harness {
        client,
        server,
        dispatcher,
        dispatch_task,
        sessions,
    }
}

async fn send(client: &DatagramConn, message: UdpMessage) {
    for frame in message
        .encode_fragments(client.max_datagram_size())
        .unwrap()
    {
        client.send_datagram(frame).await.unwrap();
    }
}

async fn receive(client: &DatagramConn) -> UdpMessage {
    let frame = client
        .receive_datagram(&CancellationToken::new())
        .await
        .unwrap();
    UdpMessage::decode(&frame).unwrap()
}

#[tokio::test]
async fn test_echo_through_single_session() {
    let mut h = start(DatagramConfig::default());

    send(&h.client, UdpMessage::new(7, 0, "8.8.8.8:53", b"first")).await;
    send(&h.client, UdpMessage::new(7, 1, "8.8.8.8:53", b"second")).await;

    let reply = receive(&h.client).await;
    assert_eq!(reply.session_id, 7);
    assert_eq!(reply.destination, "8.8.8.8:53");
    assert_eq!(&reply.data[..], b"first");
    assert_eq!(&receive(&h.client).await.data[..], b"second");

    let metadata = h.sessions.recv().await.unwrap();
    assert_eq!(metadata.session_id, 7);
    assert_eq!(metadata.destination, "8.8.8.8:53");
    assert!(h.sessions.try_recv().is_err());
    assert_eq!(h.dispatcher.sessions().len(), 1);
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let mut h = start(DatagramConfig::default());

    send(&h.client, UdpMessage::new(1, 0, "1.1.1.1:53", b"one")).await;
    assert_eq!(&receive(&h.client).await.data[..], b"one");
    send(&h.client, UdpMessage::new(2, 0, "[::1]:5353", b"two")).await;
    let reply = receive(&h.client).await;
    assert_eq!(reply.session_id, 2);
    assert_eq!(reply.destination, "[::1]:5353");

    assert_eq!(h.sessions.recv().await.unwrap().session_id, 1);
    assert_eq!(h.sessions.recv().await.unwrap().session_id, 2);
    assert_eq!(h.dispatcher.counters().snapshot().active_sessions, 2);
}

#[tokio::test]
async fn test_fragmented_payload_round_trip() {
    let h = start(DatagramConfig::default());

    let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    let message = UdpMessage::new(9, 0, "8.8.8.8:53", &payload);
    assert!(message.encoded_len() > MAX_DATAGRAM_SIZE);
    send(&h.client, message).await;

    let mut defragger = Defragger::default();
    let reply = loop {
        if let Some(reply) = defragger.feed(receive(&h.client).await) {
            break reply;
        }
    };
    assert_eq!(reply.session_id, 9);
    assert_eq!(&reply.data[..], &payload[..]);
}

#[tokio::test]
async fn test_malformed_message_tears_down_connection() {
    let mut h = start(DatagramConfig::default());

    send(&h.client, UdpMessage::new(3, 0, "8.8.8.8:53", b"hello")).await;
    assert_eq!(&receive(&h.client).await.data[..], b"hello");
    h.sessions.recv().await.unwrap();

    // valid header, address length claims more bytes than present
    h.client
        .send_datagram(bytes::Bytes::from_static(&[0, 0, 0, 3, 0, 1, 0, 1, 20, b'x']))
        .await
        .unwrap();

    assert_eq!(
        h.dispatch_task.await.unwrap(),
        Err(DatagramError::Malformed("truncated address"))
    );
    assert!(h.dispatcher.cancel_token().is_cancelled());
    assert!(h.server.is_closed());
    assert_eq!(
        h.server.close_error(),
        DatagramError::Malformed("truncated address")
    );

    let err = h
        .client
        .receive_datagram(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DatagramError::ConnectionClosed(_)));
}

#[tokio::test]
async fn test_shutdown_closes_datagram_connection() {
    let h = start(DatagramConfig::default());

    send(&h.client, UdpMessage::new(4, 0, "8.8.8.8:53", b"ping")).await;
    assert_eq!(&receive(&h.client).await.data[..], b"ping");

    h.dispatcher.shutdown();
    assert_eq!(h.dispatch_task.await.unwrap(), Ok(()));
    assert!(h.server.is_closed());
    assert_eq!(
        h.server.close_error(),
        DatagramError::closed("udp dispatcher stopped")
    );
}

#[tokio::test]
async fn test_idle_session_is_recreated() {
    let mut h = start(DatagramConfig {
        udp_idle_timeout: Duration::from_millis(100),
        ..DatagramConfig::default()
    });

    send(&h.client, UdpMessage::new(5, 0, "8.8.8.8:53", b"a")).await;
    assert_eq!(&receive(&h.client).await.data[..], b"a");
    h.sessions.recv().await.unwrap();

    while !h.dispatcher.sessions().is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    send(&h.client, UdpMessage::new(5, 1, "8.8.8.8:53", b"b")).await;
    assert_eq!(&receive(&h.client).await.data[..], b"b");
    assert_eq!(h.sessions.recv().await.unwrap().session_id, 5);
}
