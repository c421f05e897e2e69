//! Session layer integration tests
//!
//! Each test runs real message channels on background tasks and talks to
//! them only through sessions, the way an application would.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use devbus_core::{ManagerConfig, ManagerError, MessageBus, RetransmitConfig, SessionConfig};
use devbus_protocol::{ClientId, Protocol, ResultCode, Version};
use devbus_session::{
    EstablishSessionInfo, LinkConditions, MemoryRouter, MessageChannel, ProtocolClient,
    ProtocolServer, Session, SessionState, StreamBus,
};

const TEST_PROTOCOL: Protocol = Protocol::EVENT;
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server that accepts every session and reports established ones
struct TestServer {
    min: Version,
    max: Version,
    established: mpsc::UnboundedSender<Arc<Session>>,
    updates: AtomicUsize,
    terminated: Mutex<Vec<ResultCode>>,
}

impl TestServer {
    fn new(min: Version, max: Version) -> (Arc<Self>, mpsc::UnboundedReceiver<Arc<Session>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            min,
            max,
            established: tx,
            updates: AtomicUsize::new(0),
            terminated: Mutex::new(Vec::new()),
        });
        (server, rx)
    }

    fn terminated(&self) -> Vec<ResultCode> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProtocolServer for TestServer {
    fn protocol(&self) -> Protocol {
        TEST_PROTOCOL
    }

    fn get_supported_version(&self, min: Version, max: Version) -> Option<Version> {
        let low = min.max(self.min);
        let high = max.min(self.max);
        (low <= high).then_some(high)
    }

    fn preferred_version(&self) -> Version {
        self.max
    }

    fn accept_session(&self, _session: &Arc<Session>) -> bool {
        true
    }

    fn session_established(&self, session: &Arc<Session>) {
        let _ = self.established.send(Arc::clone(session));
    }

    fn update_session(&self, _session: &Arc<Session>) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn session_terminated(&self, _session: &Arc<Session>, reason: ResultCode) {
        self.terminated.lock().unwrap().push(reason);
    }
}

struct TestClient {
    min: Version,
    max: Version,
    established: AtomicUsize,
}

impl TestClient {
    fn new(min: Version, max: Version) -> Self {
        Self {
            min,
            max,
            established: AtomicUsize::new(0),
        }
    }
}

impl ProtocolClient for TestClient {
    fn protocol(&self) -> Protocol {
        TEST_PROTOCOL
    }

    fn version_range(&self) -> (Version, Version) {
        (self.min, self.max)
    }

    fn session_established(&self, _session: &Arc<Session>) {
        self.established.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running message channel and the handle needed to stop it
struct Node {
    channel: Arc<MessageChannel>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ManagerError>>,
}

impl Node {
    fn start(bus: Arc<dyn MessageBus>, config: ManagerConfig) -> Self {
        init_tracing();
        let channel = Arc::new(MessageChannel::new(bus, config));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let channel = Arc::clone(&channel);
            let cancel = cancel.clone();
            async move { channel.run(cancel).await }
        });
        Self {
            channel,
            cancel,
            task,
        }
    }

    fn client_id(&self) -> ClientId {
        self.channel.bus().client_id()
    }

    async fn stop(self) {
        self.cancel.cancel();
        let result = timeout(WAIT, self.task)
            .await
            .expect("channel did not stop")
            .expect("channel task panicked");
        assert!(result.is_ok(), "channel failed: {:?}", result);
    }
}

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        session: SessionConfig {
            retransmit: RetransmitConfig {
                initial_rtt: Duration::from_millis(5),
                min_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                max_retransmits: 20,
                ..Default::default()
            },
            ..Default::default()
        },
        shutdown_timeout: Duration::from_secs(2),
        update_interval: Duration::from_millis(2),
        ..Default::default()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_end_to_end_message_exchange() {
    let router = MemoryRouter::new();
    let server_node = Node::start(Arc::new(router.connect()), fast_config());
    let client_node = Node::start(Arc::new(router.connect()), fast_config());

    let (server, mut established) = TestServer::new(1, 2);
    server_node
        .channel
        .manager()
        .register_protocol_server(server.clone())
        .unwrap();

    let client = TestClient::new(1, 2);
    let session = client_node
        .channel
        .manager()
        .connect_client(&client, server_node.client_id(), WAIT)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Established);
    assert_eq!(session.protocol_version(), 2);
    assert_eq!(client.established.load(Ordering::Relaxed), 1);

    let message: Vec<u8> = (0..100u8).collect();
    session.send(&message, WAIT).await.unwrap();

    let accepted = timeout(WAIT, established.recv()).await.unwrap().unwrap();
    assert_eq!(accepted.session_id(), session.session_id());
    assert_eq!(accepted.protocol_version(), 2);

    let received = accepted.receive_bytes(WAIT).await.unwrap();
    assert_eq!(&received[..], &message[..]);

    accepted.send(b"pong", WAIT).await.unwrap();
    let mut buf = [0u8; 16];
    let n = session.receive(&mut buf, WAIT).await.unwrap();
    assert_eq!(&buf[..n], b"pong");

    client_node.stop().await;
    server_node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_version_outside_client_range_fails() {
    let router = MemoryRouter::new();
    let server_node = Node::start(Arc::new(router.connect()), fast_config());
    let client_node = Node::start(Arc::new(router.connect()), fast_config());

    let (server, _established) = TestServer::new(4, 5);
    server_node
        .channel
        .manager()
        .register_protocol_server(server)
        .unwrap();

    let client = TestClient::new(1, 2);
    let result = client_node
        .channel
        .manager()
        .connect_client(&client, server_node.client_id(), WAIT)
        .await;
    assert!(matches!(result, Err(ManagerError::Session(_))));
    assert_eq!(client.established.load(Ordering::Relaxed), 0);

    client_node.stop().await;
    server_node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_closes_server_sessions() {
    let router = MemoryRouter::new();
    let server_node = Node::start(Arc::new(router.connect()), fast_config());
    let client_node = Node::start(Arc::new(router.connect()), fast_config());

    let (server, mut established) = TestServer::new(1, 1);
    server_node
        .channel
        .manager()
        .register_protocol_server(server.clone())
        .unwrap();

    let client = TestClient::new(1, 1);
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = client_node
            .channel
            .manager()
            .connect_client(&client, server_node.client_id(), WAIT)
            .await
            .unwrap();
        session.send(b"hello", WAIT).await.unwrap();
        sessions.push(session);
    }
    for _ in 0..3 {
        timeout(WAIT, established.recv()).await.unwrap().unwrap();
    }

    let closed = server_node
        .channel
        .manager()
        .unregister_protocol_server(TEST_PROTOCOL)
        .unwrap();
    assert_eq!(closed, 3);
    assert_eq!(server.terminated(), vec![ResultCode::EndOfStream; 3]);

    for session in &sessions {
        let reason = session.wait_for_disconnection(WAIT).await.unwrap();
        assert_eq!(reason, ResultCode::EndOfStream);
    }
    wait_until(|| server_node.channel.manager().is_empty()).await;

    client_node.stop().await;
    server_node.stop().await;
}

#[tokio::test]
async fn test_session_ids_stay_unique() {
    init_tracing();
    let router = MemoryRouter::new();
    let peer = router.connect();
    let bus = router.connect();

    let mut config = ManagerConfig::default();
    config.session.window_depth = 2;
    let channel = MessageChannel::new(Arc::new(bus), config);
    let manager = channel.manager();

    let mut ids = HashSet::new();
    let mut sessions = Vec::new();
    for _ in 0..10_000 {
        let info = EstablishSessionInfo::new(TEST_PROTOCOL, peer.client_id(), 1, 1);
        let session = manager.establish_session_for_client(info).unwrap();
        assert!(session.session_id().is_valid());
        assert!(ids.insert(session.session_id()));
        sessions.push(session);
    }
    assert_eq!(manager.session_count(), 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lossy_link_delivers_in_order() {
    let conditions = LinkConditions {
        drop_rate: 0.1,
        duplicate_rate: 0.05,
        reorder_rate: 0.1,
        seed: Some(42),
    };
    let router = MemoryRouter::with_conditions(conditions);
    let server_node = Node::start(Arc::new(router.connect()), fast_config());
    let client_node = Node::start(Arc::new(router.connect()), fast_config());

    let (server, mut established) = TestServer::new(1, 1);
    server_node
        .channel
        .manager()
        .register_protocol_server(server)
        .unwrap();

    let client = TestClient::new(1, 1);
    let session = client_node
        .channel
        .manager()
        .connect_client(&client, server_node.client_id(), WAIT)
        .await
        .unwrap();

    let sender = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            for i in 0..200u32 {
                session.send(&i.to_be_bytes(), WAIT).await.unwrap();
            }
        }
    });

    let accepted = timeout(WAIT, established.recv()).await.unwrap().unwrap();
    for expected in 0..200u32 {
        let payload = accepted
            .receive_bytes(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(&payload[..], &expected.to_be_bytes());
    }
    sender.await.unwrap();

    let stats = router.stats();
    assert!(stats.dropped > 0);

    client_node.stop().await;
    server_node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_shutdown_reports_success() {
    let router = MemoryRouter::new();
    let server_node = Node::start(Arc::new(router.connect()), fast_config());
    let client_node = Node::start(Arc::new(router.connect()), fast_config());

    let (server, mut established) = TestServer::new(1, 1);
    server_node
        .channel
        .manager()
        .register_protocol_server(server.clone())
        .unwrap();

    let client = TestClient::new(1, 1);
    let session = client_node
        .channel
        .manager()
        .connect_client(&client, server_node.client_id(), WAIT)
        .await
        .unwrap();
    session.send(b"last words", WAIT).await.unwrap();
    let accepted = timeout(WAIT, established.recv()).await.unwrap().unwrap();

    let client_manager = Arc::clone(client_node.channel.manager());
    client_node.stop().await;
    assert!(client_manager.is_empty());
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.termination_reason(), ResultCode::Success);

    // Data sent before the close is still readable, then end of stream
    let payload = accepted.receive_bytes(WAIT).await.unwrap();
    assert_eq!(&payload[..], b"last words");

    wait_until(|| server.terminated() == vec![ResultCode::Success]).await;
    assert!(server.updates.load(Ordering::Relaxed) > 0);

    server_node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_over_byte_stream() {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let server_node = Node::start(
        Arc::new(StreamBus::spawn(left, ClientId::new(1))),
        fast_config(),
    );
    let client_node = Node::start(
        Arc::new(StreamBus::spawn(right, ClientId::new(2))),
        fast_config(),
    );

    let (server, mut established) = TestServer::new(1, 3);
    server_node
        .channel
        .manager()
        .register_protocol_server(server)
        .unwrap();

    let client = TestClient::new(2, 3);
    let session = client_node
        .channel
        .manager()
        .connect_client(&client, ClientId::new(1), WAIT)
        .await
        .unwrap();
    assert_eq!(session.protocol_version(), 3);

    for i in 0..50u8 {
        session.send(&[i; 32], WAIT).await.unwrap();
    }
    let accepted = timeout(WAIT, established.recv()).await.unwrap().unwrap();
    for i in 0..50u8 {
        let payload = accepted.receive_bytes(WAIT).await.unwrap();
        assert_eq!(&payload[..], &[i; 32]);
    }

    client_node.stop().await;
    server_node.stop().await;
}
