//! Loopback soak test
//!
//! Two message channels share an in-process router with configurable link
//! impairments. Every session streams numbered payloads from client to
//! server, and the server side checks that each one arrives exactly once and
//! unmodified.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use devbus_core::config::serde_utils::duration_millis;
use devbus_core::{ManagerConfig, ManagerError, MessageBus};
use devbus_protocol::{ClientId, Protocol, ResultCode, Version, MAX_PAYLOAD_SIZE};
use devbus_session::{
    LinkConditions, LinkStats, MemoryRouter, MessageChannel, ProtocolClient, ProtocolServer,
    Session,
};

const SOAK_PROTOCOL: Protocol = Protocol::EVENT;
const SOAK_VERSION: Version = 1;

/// Bytes at the start of every payload holding its message index
const INDEX_SIZE: usize = 8;

/// Parameters of one soak run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoakConfig {
    /// Concurrent sessions
    pub sessions: usize,
    /// Messages sent on each session
    pub messages: u64,
    /// Size of every payload in bytes
    pub payload_size: usize,
    /// Impairments applied to the shared link
    pub link: LinkConditions,
    /// Limit for the whole run
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            sessions: 4,
            messages: 1000,
            payload_size: 256,
            link: LinkConditions::default(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl SoakConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sessions == 0 {
            anyhow::bail!("sessions must be at least 1");
        }
        if !(INDEX_SIZE..=MAX_PAYLOAD_SIZE).contains(&self.payload_size) {
            anyhow::bail!(
                "payload size must be between {} and {}, got {}",
                INDEX_SIZE,
                MAX_PAYLOAD_SIZE,
                self.payload_size
            );
        }
        if self.timeout.is_zero() {
            anyhow::bail!("timeout must be non-zero");
        }
        self.link.validate()?;
        Ok(())
    }
}

/// Outcome of one soak session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: u32,
    pub protocol_version: Version,
    pub messages: u64,
    pub bytes: u64,
    pub termination_reason: String,
}

/// Outcome of a soak run
#[derive(Debug, Clone, Serialize)]
pub struct SoakReport {
    pub sessions: Vec<SessionReport>,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub elapsed_secs: f64,
    pub link: LinkStats,
}

impl SoakReport {
    pub fn messages_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.total_messages as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

/// Fill a payload for message `index`
fn encode_payload(index: u64, size: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(size);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend((INDEX_SIZE..size).map(|offset| pattern_byte(index, offset)));
    payload
}

fn pattern_byte(index: u64, offset: usize) -> u8 {
    (index as u8).wrapping_mul(31).wrapping_add(offset as u8)
}

/// Check that `payload` is exactly what [`encode_payload`] produced for `index`
fn verify_payload(payload: &[u8], index: u64, size: usize) -> Result<()> {
    if payload.len() != size {
        anyhow::bail!(
            "message {} has {} bytes, expected {}",
            index,
            payload.len(),
            size
        );
    }

    let mut prefix = [0u8; INDEX_SIZE];
    prefix.copy_from_slice(&payload[..INDEX_SIZE]);
    let received = u64::from_be_bytes(prefix);
    if received != index {
        anyhow::bail!("expected message {}, got message {}", index, received);
    }

    let corrupt = payload[INDEX_SIZE..]
        .iter()
        .enumerate()
        .any(|(i, byte)| *byte != pattern_byte(index, i + INDEX_SIZE));
    if corrupt {
        anyhow::bail!("message {} is corrupted", index);
    }
    Ok(())
}

/// Accepts soak sessions and hands established ones to the verifier
struct SoakServer {
    established: mpsc::UnboundedSender<Arc<Session>>,
}

impl ProtocolServer for SoakServer {
    fn protocol(&self) -> Protocol {
        SOAK_PROTOCOL
    }

    fn get_supported_version(&self, min: Version, max: Version) -> Option<Version> {
        (min..=max).contains(&SOAK_VERSION).then_some(SOAK_VERSION)
    }

    fn preferred_version(&self) -> Version {
        SOAK_VERSION
    }

    fn accept_session(&self, session: &Arc<Session>) -> bool {
        tracing::debug!("Accepting {} from {}", session.session_id(), session.remote_client_id());
        true
    }

    fn session_established(&self, session: &Arc<Session>) {
        let _ = self.established.send(Arc::clone(session));
    }

    fn update_session(&self, _session: &Arc<Session>) {}

    fn session_terminated(&self, session: &Arc<Session>, reason: ResultCode) {
        tracing::debug!("{} terminated: {}", session.session_id(), reason);
    }
}

struct SoakClient;

impl ProtocolClient for SoakClient {
    fn protocol(&self) -> Protocol {
        SOAK_PROTOCOL
    }

    fn version_range(&self) -> (Version, Version) {
        (SOAK_VERSION, SOAK_VERSION)
    }
}

/// A message channel running on its own task
struct Node {
    channel: Arc<MessageChannel>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ManagerError>>,
}

impl Node {
    fn start(bus: Arc<dyn MessageBus>, config: ManagerConfig) -> Self {
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

    async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await.context("Message channel task failed")??;
        Ok(())
    }
}

/// Run a soak test and return its report
///
/// Fails on the first lost, duplicated, reordered or corrupted message, or
/// when the run does not finish within the configured timeout.
pub async fn run_soak(manager_config: ManagerConfig, soak: &SoakConfig) -> Result<SoakReport> {
    soak.validate()?;
    manager_config.validate()?;

    tracing::info!(
        "Soak: {} sessions x {} messages of {} bytes (drop {}, duplicate {}, reorder {})",
        soak.sessions,
        soak.messages,
        soak.payload_size,
        soak.link.drop_rate,
        soak.link.duplicate_rate,
        soak.link.reorder_rate
    );

    let router = MemoryRouter::with_conditions(soak.link.clone());
    let server = Node::start(Arc::new(router.connect()), manager_config.clone());
    let client = Node::start(Arc::new(router.connect()), manager_config);

    let (established_tx, established_rx) = mpsc::unbounded_channel();
    server
        .channel
        .manager()
        .register_protocol_server(Arc::new(SoakServer {
            established: established_tx,
        }))?;

    let started = Instant::now();
    let outcome = tokio::time::timeout(
        soak.timeout,
        exchange(&client, server.client_id(), established_rx, soak),
    )
    .await;
    let elapsed = started.elapsed();

    client.stop().await?;
    server.stop().await?;

    let sessions = match outcome {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("Soak did not finish within {:?}", soak.timeout),
    };

    let total_messages = sessions.iter().map(|s| s.messages).sum();
    let total_bytes = sessions.iter().map(|s| s.bytes).sum();
    Ok(SoakReport {
        sessions,
        total_messages,
        total_bytes,
        elapsed_secs: elapsed.as_secs_f64(),
        link: router.stats(),
    })
}

async fn exchange(
    client: &Node,
    server_id: ClientId,
    mut established: mpsc::UnboundedReceiver<Arc<Session>>,
    soak: &SoakConfig,
) -> Result<Vec<SessionReport>> {
    let manager = client.channel.manager();
    let mut sessions = Vec::with_capacity(soak.sessions);
    for _ in 0..soak.sessions {
        let session = manager
            .connect_client(&SoakClient, server_id, soak.timeout)
            .await
            .context("Failed to open soak session")?;
        sessions.push(session);
    }

    let senders: Vec<JoinHandle<Result<()>>> = sessions
        .iter()
        .map(|session| {
            let session = Arc::clone(session);
            let (messages, size, timeout) = (soak.messages, soak.payload_size, soak.timeout);
            tokio::spawn(async move {
                for index in 0..messages {
                    session
                        .send(&encode_payload(index, size), timeout)
                        .await
                        .with_context(|| format!("Send failed on {}", session.session_id()))?;
                }
                Ok(())
            })
        })
        .collect();

    let mut verifiers: Vec<JoinHandle<Result<SessionReport>>> = Vec::with_capacity(soak.sessions);
    for _ in 0..soak.sessions {
        let session = established
            .recv()
            .await
            .context("Server stopped accepting sessions")?;
        let (messages, size, timeout) = (soak.messages, soak.payload_size, soak.timeout);
        verifiers.push(tokio::spawn(async move {
            let mut bytes = 0u64;
            for index in 0..messages {
                let payload = session
                    .receive_bytes(timeout)
                    .await
                    .with_context(|| format!("Receive failed on {}", session.session_id()))?;
                verify_payload(&payload, index, size)
                    .with_context(|| format!("Bad delivery on {}", session.session_id()))?;
                bytes += payload.len() as u64;
            }
            Ok(SessionReport {
                session_id: session.session_id().as_u32(),
                protocol_version: session.protocol_version(),
                messages,
                bytes,
                termination_reason: String::new(),
            })
        }));
    }

    for sender in senders {
        sender.await.context("Sender task failed")??;
    }
    let mut reports = Vec::with_capacity(verifiers.len());
    for verifier in verifiers {
        reports.push(verifier.await.context("Verifier task failed")??);
    }

    for session in &sessions {
        session.close();
        let reason = session
            .wait_for_disconnection(soak.timeout)
            .await
            .with_context(|| format!("{} did not close", session.session_id()))?;
        let id = session.session_id().as_u32();
        if let Some(report) = reports.iter_mut().find(|r| r.session_id == id) {
            report.termination_reason = reason.to_string();
        }
    }

    reports.sort_by_key(|r| r.session_id);
    Ok(reports)
}

/// Load a soak configuration file, or defaults when `path` is `None`
pub fn load_soak_config(path: Option<&PathBuf>) -> Result<SoakConfig> {
    match path {
        Some(path) => devbus_core::config::load_config(path)
            .with_context(|| format!("Failed to load soak config: {:?}", path)),
        None => Ok(SoakConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let payload = encode_payload(42, 64);
        assert_eq!(payload.len(), 64);
        assert!(verify_payload(&payload, 42, 64).is_ok());
        assert!(verify_payload(&payload, 41, 64).is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let mut payload = encode_payload(3, 32);
        payload[20] ^= 0xFF;
        assert!(verify_payload(&payload, 3, 32).is_err());
        assert!(verify_payload(&payload[..31], 3, 32).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(SoakConfig::default().validate().is_ok());

        let tiny = SoakConfig {
            payload_size: 4,
            ..Default::default()
        };
        assert!(tiny.validate().is_err());

        let lossy = SoakConfig {
            link: LinkConditions {
                drop_rate: 1.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(lossy.validate().is_err());
    }

    #[test]
    fn test_config_parses_partial_toml() {
        let config: SoakConfig = toml::from_str("sessions = 2\n[link]\ndrop_rate = 0.2\n").unwrap();
        assert_eq!(config.sessions, 2);
        assert_eq!(config.link.drop_rate, 0.2);
        assert_eq!(config.messages, SoakConfig::default().messages);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_soak_over_clean_link() {
        let soak = SoakConfig {
            sessions: 2,
            messages: 50,
            payload_size: 32,
            timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let report = run_soak(ManagerConfig::default(), &soak).await.unwrap();

        assert_eq!(report.sessions.len(), 2);
        assert_eq!(report.total_messages, 100);
        assert_eq!(report.total_bytes, 3200);
        for session in &report.sessions {
            assert_eq!(session.protocol_version, SOAK_VERSION);
            assert_eq!(session.termination_reason, ResultCode::Success.to_string());
        }
        assert_eq!(report.link.dropped, 0);
    }
}
