//! In-process message bus with optional link impairment

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TryRecvError};

use devbus_core::{BusError, ConfigError, MessageBus};
use devbus_protocol::{ClientId, Frame};

use crate::session::lock;

/// Impairments applied to every frame crossing a [`MemoryRouter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConditions {
    /// Probability that a frame is lost
    pub drop_rate: f64,
    /// Probability that a delivered frame arrives twice
    pub duplicate_rate: f64,
    /// Probability that a frame is held back behind the next one
    pub reorder_rate: f64,
    /// Seed for reproducible runs; random when unset
    pub seed: Option<u64>,
}

impl Default for LinkConditions {
    fn default() -> Self {
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            seed: None,
        }
    }
}

impl LinkConditions {
    /// Check that every rate is a probability
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("drop_rate", self.drop_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("reorder_rate", self.reorder_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and 1, got {}",
                    name, rate
                )));
            }
        }
        Ok(())
    }

    pub fn is_lossless(&self) -> bool {
        self.drop_rate == 0.0 && self.duplicate_rate == 0.0 && self.reorder_rate == 0.0
    }
}

/// Counters kept by a [`MemoryRouter`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
}

/// Hub connecting [`MemoryBus`] endpoints in one process
pub struct MemoryRouter {
    endpoints: DashMap<ClientId, mpsc::UnboundedSender<Frame>>,
    conditions: LinkConditions,
    rng: Mutex<StdRng>,
    held: Mutex<Vec<Frame>>,
    next_client_id: AtomicU16,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    reordered: AtomicU64,
}

impl MemoryRouter {
    /// A router that delivers every frame exactly once, in order
    pub fn new() -> Arc<Self> {
        Self::with_conditions(LinkConditions::default())
    }

    /// A router that impairs traffic according to `conditions`
    ///
    /// Rates outside `0..=1` are clamped.
    pub fn with_conditions(conditions: LinkConditions) -> Arc<Self> {
        let rng = match conditions.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let conditions = LinkConditions {
            drop_rate: conditions.drop_rate.clamp(0.0, 1.0),
            duplicate_rate: conditions.duplicate_rate.clamp(0.0, 1.0),
            reorder_rate: conditions.reorder_rate.clamp(0.0, 1.0),
            seed: conditions.seed,
        };

        Arc::new(Self {
            endpoints: DashMap::new(),
            conditions,
            rng: Mutex::new(rng),
            held: Mutex::new(Vec::new()),
            next_client_id: AtomicU16::new(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
            reordered: AtomicU64::new(0),
        })
    }

    /// Attach a new endpoint with a fresh client id
    pub fn connect(self: &Arc<Self>) -> MemoryBus {
        let client_id = loop {
            let id = ClientId::new(self.next_client_id.fetch_add(1, Ordering::Relaxed));
            if id != ClientId::BROADCAST && !self.endpoints.contains_key(&id) {
                break id;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(client_id, tx);
        tracing::debug!("{} attached to memory router", client_id);

        MemoryBus {
            client_id,
            router: Arc::clone(self),
            incoming: tokio::sync::Mutex::new(rx),
            connected: AtomicBool::new(true),
        }
    }

    pub fn conditions(&self) -> &LinkConditions {
        &self.conditions
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            reordered: self.reordered.load(Ordering::Relaxed),
        }
    }

    fn route(&self, frame: &Frame) {
        let (lose, duplicate, hold) = {
            let mut rng = lock(&self.rng);
            (
                rng.gen_bool(self.conditions.drop_rate),
                rng.gen_bool(self.conditions.duplicate_rate),
                rng.gen_bool(self.conditions.reorder_rate),
            )
        };
        let released = std::mem::take(&mut *lock(&self.held));

        if lose {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Link dropped frame to {}", frame.header.dst_client_id);
        } else if hold {
            self.reordered.fetch_add(1, Ordering::Relaxed);
            lock(&self.held).push(frame.clone());
        } else {
            self.deliver(frame);
            if duplicate {
                self.duplicated.fetch_add(1, Ordering::Relaxed);
                self.deliver(frame);
            }
        }

        for frame in &released {
            self.deliver(frame);
        }
    }

    fn deliver(&self, frame: &Frame) {
        let dst = frame.header.dst_client_id;
        let targets: Vec<(ClientId, mpsc::UnboundedSender<Frame>)> = if dst == ClientId::BROADCAST {
            self.endpoints
                .iter()
                .filter(|entry| *entry.key() != frame.header.src_client_id)
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect()
        } else {
            match self.endpoints.get(&dst) {
                Some(sender) => vec![(dst, sender.clone())],
                None => {
                    tracing::trace!("No endpoint {} on memory router", dst);
                    return;
                }
            }
        };

        for (id, sender) in targets {
            if sender.send(frame.clone()).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                self.endpoints.remove(&id);
            }
        }
    }
}

impl std::fmt::Debug for MemoryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRouter")
            .field("endpoints", &self.endpoints.len())
            .field("conditions", &self.conditions)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One endpoint on a [`MemoryRouter`]
pub struct MemoryBus {
    client_id: ClientId,
    router: Arc<MemoryRouter>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn router(&self) -> &Arc<MemoryRouter> {
        &self.router
    }

    /// Leave the router; later calls fail with [`BusError::Disconnected`]
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.router.endpoints.remove(&self.client_id);
            tracing::debug!("{} detached from memory router", self.client_id);
        }
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn forward(&self, frame: &Frame) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.router.route(frame);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }

        let mut incoming = self.incoming.lock().await;
        if timeout.is_zero() {
            return match incoming.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(BusError::Disconnected),
            };
        }

        match tokio::time::timeout(timeout, incoming.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(BusError::Disconnected),
            Err(_) => Ok(None),
        }
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("client_id", &self.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}
