//! Fixed-depth sliding windows for both directions of a session
//!
//! Slots are addressed by `sequence % depth`. Neither window synchronizes
//! itself; the owning session wraps each one in its own lock and pairs it
//! with a counting semaphore.

use std::time::{Duration, Instant};

use devbus_core::config::SessionConfig;
use devbus_core::BusError;
use devbus_protocol::{Frame, Sequence, SessionMessage, WindowSize};

use super::retransmit::{RetransmitBackoff, RttEstimator};

fn slot_index(sequence: Sequence, depth: usize) -> usize {
    (sequence % depth as Sequence) as usize
}

/// A queued outgoing frame
#[derive(Debug)]
struct Outgoing {
    frame: Frame,
    /// Time of the latest transmission, `None` until first sent
    sent_at: Option<Instant>,
}

/// Result of processing a cumulative acknowledgement
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct AckOutcome {
    /// Slots released
    pub freed: usize,
    /// Frame to resend immediately after repeated duplicate acks
    pub fast_retransmit: Option<Sequence>,
}

/// Result of a retransmission pass
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Retransmit {
    /// Nothing has expired
    Idle,
    /// Frames resent this pass
    Sent(usize),
    /// The retransmit limit was reached without progress
    Exhausted,
}

/// Sending side: frames queued or in flight until the peer acknowledges them
#[derive(Debug)]
pub(crate) struct TransmitWindow {
    slots: Vec<Option<Outgoing>>,
    /// Sequence assigned to the next queued frame
    next_sequence: Sequence,
    /// Oldest sequence not yet acknowledged
    next_unacked: Sequence,
    /// Highest sequence transmitted at least once
    last_sent: Sequence,
    /// Consecutive acks that made no progress
    duplicate_acks: u32,
    /// Retransmission rounds since the last progress
    retransmit_rounds: u32,
    /// Receive slots the peer last advertised
    peer_available: WindowSize,
    rtt: RttEstimator,
    backoff: RetransmitBackoff,
    fast_retransmit_threshold: u32,
}

impl TransmitWindow {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            slots: (0..config.window_depth).map(|_| None).collect(),
            next_sequence: 1,
            next_unacked: 1,
            last_sent: 0,
            duplicate_acks: 0,
            retransmit_rounds: 0,
            peer_available: 1,
            rtt: RttEstimator::from_config(&config.retransmit),
            backoff: RetransmitBackoff::from_config(&config.retransmit),
            fast_retransmit_threshold: config.retransmit.fast_retransmit_threshold,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Frames queued but not yet acknowledged
    pub fn in_flight(&self) -> u64 {
        self.next_sequence - self.next_unacked
    }

    pub fn set_peer_available(&mut self, window: WindowSize) {
        self.peer_available = window;
    }

    /// Stamp `frame` with the next sequence number and queue it
    ///
    /// Returns `None` when every slot is occupied.
    pub fn enqueue(&mut self, mut frame: Frame) -> Option<Sequence> {
        if self.in_flight() >= self.depth() as u64 {
            return None;
        }

        let sequence = self.next_sequence;
        let index = slot_index(sequence, self.depth());
        if self.slots[index].is_some() {
            return None;
        }

        frame.header.sequence = sequence;
        self.slots[index] = Some(Outgoing {
            frame,
            sent_at: None,
        });
        self.next_sequence += 1;
        Some(sequence)
    }

    /// Release every frame up to and including `ack`
    pub fn acknowledge(&mut self, ack: Sequence, now: Instant) -> AckOutcome {
        let depth = self.depth();
        let upto = ack.min(self.last_sent);
        let mut rtt = self.rtt;
        let mut sequence = self.next_unacked;
        let mut freed = 0;

        while sequence <= upto {
            let index = slot_index(sequence, depth);
            let matches = self.slots[index]
                .as_ref()
                .is_some_and(|slot| slot.frame.header.sequence == sequence);
            if !matches {
                tracing::warn!("Transmit slot for sequence {} is inconsistent", sequence);
                break;
            }

            if let Some(slot) = self.slots[index].take() {
                if self.retransmit_rounds == 0 {
                    if let Some(sent_at) = slot.sent_at {
                        rtt.sample(now.saturating_duration_since(sent_at));
                    }
                }
            }
            freed += 1;
            sequence += 1;
        }

        if freed > 0 {
            self.rtt = rtt;
            self.retransmit_rounds = 0;
            self.duplicate_acks = 0;
            self.next_unacked = sequence;
            return AckOutcome {
                freed,
                fast_retransmit: None,
            };
        }

        self.duplicate_acks = self.duplicate_acks.saturating_add(1);
        let mut fast_retransmit = None;
        if self.duplicate_acks >= self.fast_retransmit_threshold {
            let candidate = self.next_unacked
                + Sequence::from(self.duplicate_acks - self.fast_retransmit_threshold);
            if candidate <= self.last_sent {
                fast_retransmit = Some(candidate);
            }
        }

        AckOutcome {
            freed: 0,
            fast_retransmit,
        }
    }

    /// Resend one in-flight frame immediately
    pub fn resend<F>(
        &mut self,
        sequence: Sequence,
        window: WindowSize,
        now: Instant,
        send: &mut F,
    ) -> Result<bool, BusError>
    where
        F: FnMut(&Frame) -> Result<(), BusError>,
    {
        if sequence < self.next_unacked || sequence > self.last_sent {
            return Ok(false);
        }

        let index = slot_index(sequence, self.depth());
        let Some(slot) = self.slots[index].as_mut() else {
            return Ok(false);
        };

        slot.frame.header.window_size = window;
        match send(&slot.frame) {
            Ok(()) => {
                slot.sent_at = Some(now);
                self.retransmit_rounds = 0;
                Ok(true)
            }
            Err(BusError::NotReady) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resend in-flight frames whose retransmit deadline has passed
    pub fn retransmit_expired<F>(
        &mut self,
        now: Instant,
        window: WindowSize,
        send: &mut F,
    ) -> Result<Retransmit, BusError>
    where
        F: FnMut(&Frame) -> Result<(), BusError>,
    {
        if self.next_unacked > self.last_sent {
            return Ok(Retransmit::Idle);
        }

        let timeout = self.backoff.timeout(self.rtt.estimate(), self.retransmit_rounds);
        let depth = self.depth();
        let mut count = 0;

        for sequence in self.next_unacked..=self.last_sent {
            let index = slot_index(sequence, depth);
            let Some(slot) = self.slots[index].as_mut() else {
                break;
            };

            let elapsed = slot
                .sent_at
                .map(|sent_at| now.saturating_duration_since(sent_at))
                .unwrap_or(Duration::ZERO);
            if elapsed <= timeout {
                break;
            }

            if count == 0 && self.backoff.exhausted(self.retransmit_rounds) {
                return Ok(Retransmit::Exhausted);
            }

            slot.frame.header.window_size = window;
            match send(&slot.frame) {
                Ok(()) => {
                    slot.sent_at = Some(now);
                    count += 1;
                    tracing::debug!(
                        "Retransmitted sequence {} (rtt {:?}, timeout {:?}, round {})",
                        sequence,
                        self.rtt.estimate(),
                        timeout,
                        self.retransmit_rounds
                    );
                }
                Err(BusError::NotReady) => break,
                Err(e) => return Err(e),
            }
        }

        if count > 0 {
            self.retransmit_rounds += 1;
            Ok(Retransmit::Sent(count))
        } else {
            Ok(Retransmit::Idle)
        }
    }

    /// Transmit queued frames that have never been sent, as far as the
    /// peer's advertised window allows
    pub fn transmit_new<F>(
        &mut self,
        now: Instant,
        window: WindowSize,
        send: &mut F,
    ) -> Result<usize, BusError>
    where
        F: FnMut(&Frame) -> Result<(), BusError>,
    {
        let depth = self.depth();
        let mut sent = 0;

        while self.last_sent + 1 < self.next_sequence && self.peer_available > 0 {
            let sequence = self.last_sent + 1;
            let index = slot_index(sequence, depth);
            let Some(slot) = self.slots[index].as_mut() else {
                tracing::warn!("Transmit window has no frame for sequence {}", sequence);
                break;
            };

            slot.frame.header.window_size = window;
            match send(&slot.frame) {
                Ok(()) => {
                    slot.sent_at = Some(now);
                    self.last_sent = sequence;
                    self.peer_available -= 1;
                    sent += 1;
                }
                Err(BusError::NotReady) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(sent)
    }

    /// Whether every transmitted frame was acknowledged
    ///
    /// With `include_queued`, frames queued but never sent also count as
    /// outstanding.
    pub fn is_drained(&self, include_queued: bool) -> bool {
        let acked = self.next_unacked > self.last_sent;
        if include_queued {
            acked && self.last_sent + 1 == self.next_sequence
        } else {
            acked
        }
    }

    pub fn snapshot(&self) -> TransmitSnapshot {
        TransmitSnapshot {
            depth: self.depth(),
            next_sequence: self.next_sequence,
            next_unacknowledged: self.next_unacked,
            last_sent: self.last_sent,
            retransmit_rounds: self.retransmit_rounds,
            round_trip_time: self.rtt.estimate(),
            peer_available: self.peer_available,
        }
    }
}

/// Outcome of writing an arriving frame into the receive window
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// Buffered; `ready` frames became readable in order
    Accepted { ready: usize, ack_now: bool },
    /// Already delivered; the peer needs another ack
    Duplicate,
    /// Beyond the window the peer may use
    OutOfWindow,
}

/// Receiving side: frames buffered until the application reads them
#[derive(Debug)]
pub(crate) struct ReceiveWindow {
    slots: Vec<Option<Frame>>,
    /// Next sequence the application will read
    next_unread: Sequence,
    /// Lowest sequence not yet received
    next_expected: Sequence,
    /// Lowest sequence not yet covered by an ack we sent
    last_unacked: Sequence,
    /// Availability advertised to the peer
    available: WindowSize,
    ack_threshold: u64,
}

impl ReceiveWindow {
    pub fn new(config: &SessionConfig) -> Self {
        let mut window = Self {
            slots: (0..config.window_depth).map(|_| None).collect(),
            next_unread: 1,
            next_expected: 1,
            last_unacked: 1,
            available: 0,
            ack_threshold: config.ack_threshold,
        };
        window.available = window.max_advertised();
        window
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Half the depth, leaving headroom for reordered arrivals
    fn max_advertised(&self) -> WindowSize {
        (self.depth() / 2).clamp(1, WindowSize::MAX as usize) as WindowSize
    }

    fn current_window(&self) -> WindowSize {
        let buffered = self.next_expected - self.next_unread;
        let free = (self.max_advertised() as u64).saturating_sub(buffered);
        free.max(1) as WindowSize
    }

    pub fn available(&self) -> WindowSize {
        self.available
    }

    /// Start expecting the peer's stream at `first`
    pub fn reset(&mut self, first: Sequence) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.next_unread = first;
        self.next_expected = first;
        self.last_unacked = first;
        self.available = self.max_advertised();
    }

    pub fn insert(&mut self, frame: &Frame) -> Arrival {
        let sequence = frame.header.sequence;
        let depth = self.depth();

        if sequence < self.next_expected {
            return Arrival::Duplicate;
        }
        if sequence - self.next_unread >= depth as u64 {
            return Arrival::OutOfWindow;
        }

        self.slots[slot_index(sequence, depth)] = Some(frame.clone());

        let mut ready = 0;
        while self.next_expected - self.next_unread < depth as u64 {
            let index = slot_index(self.next_expected, depth);
            let in_order = self.slots[index]
                .as_ref()
                .is_some_and(|buffered| buffered.header.sequence == self.next_expected);
            if !in_order {
                break;
            }
            self.next_expected += 1;
            ready += 1;
        }

        let ack_now = self.next_expected - self.last_unacked >= self.ack_threshold;
        Arrival::Accepted { ready, ack_now }
    }

    /// Whether received frames are waiting for an ack
    pub fn has_pending_ack(&self) -> bool {
        self.next_expected > self.last_unacked
    }

    /// Cover everything received so far; returns the cumulative ack sequence
    pub fn take_ack(&mut self) -> Sequence {
        self.last_unacked = self.next_expected;
        self.available = self.current_window();
        self.next_expected - 1
    }

    /// The next in-order frame, if one is readable
    pub fn peek(&self) -> Option<&Frame> {
        if self.next_unread < self.next_expected {
            self.slots[slot_index(self.next_unread, self.depth())].as_ref()
        } else {
            None
        }
    }

    /// Remove the next in-order frame
    pub fn pop(&mut self) -> Option<Frame> {
        if self.next_unread >= self.next_expected {
            return None;
        }
        let index = slot_index(self.next_unread, self.depth());
        let frame = self.slots[index].take()?;
        self.next_unread += 1;
        self.available = self.current_window();
        Some(frame)
    }

    /// Whether the next readable frame is the peer's Fin
    pub fn fin_is_next(&self) -> bool {
        self.peek()
            .is_some_and(|frame| frame.session_message() == Some(SessionMessage::Fin))
    }

    pub fn snapshot(&self) -> ReceiveSnapshot {
        ReceiveSnapshot {
            depth: self.depth(),
            next_unread: self.next_unread,
            next_expected: self.next_expected,
            last_unacknowledged: self.last_unacked,
            available: self.available,
        }
    }
}

/// Scalar state of a transmit window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmitSnapshot {
    pub depth: usize,
    pub next_sequence: Sequence,
    pub next_unacknowledged: Sequence,
    pub last_sent: Sequence,
    pub retransmit_rounds: u32,
    pub round_trip_time: Duration,
    pub peer_available: WindowSize,
}

/// Scalar state of a receive window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveSnapshot {
    pub depth: usize,
    pub next_unread: Sequence,
    pub next_expected: Sequence,
    pub last_unacknowledged: Sequence,
    pub available: WindowSize,
}

/// Both windows of a session at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub transmit: TransmitSnapshot,
    pub receive: ReceiveSnapshot,
}

impl WindowSnapshot {
    /// Whether neither window holds more sequences than its depth
    pub fn within_bounds(&self) -> bool {
        let tx = &self.transmit;
        let rx = &self.receive;
        tx.next_unacknowledged <= tx.next_sequence
            && tx.next_sequence - tx.next_unacknowledged <= tx.depth as u64
            && rx.next_unread <= rx.next_expected
            && rx.next_expected - rx.next_unread <= rx.depth as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use devbus_protocol::{ClientId, MessageHeader, SessionId};

    fn config(depth: usize) -> SessionConfig {
        SessionConfig {
            window_depth: depth,
            ..Default::default()
        }
    }

    fn frame(message: SessionMessage, sequence: Sequence, payload: &'static [u8]) -> Frame {
        let header = MessageHeader::session(
            ClientId::new(1),
            ClientId::new(2),
            message,
            SessionId::new(7),
            sequence,
        );
        Frame::new(header, Bytes::from_static(payload))
    }

    fn data(sequence: Sequence) -> Frame {
        frame(SessionMessage::Data, sequence, b"x")
    }

    fn collect_into(sent: &mut Vec<Sequence>) -> impl FnMut(&Frame) -> Result<(), BusError> + '_ {
        move |frame| {
            sent.push(frame.header.sequence);
            Ok(())
        }
    }

    #[test]
    fn test_enqueue_assigns_sequences_until_full() {
        let mut tx = TransmitWindow::new(&config(4));
        for expected in 1..=4 {
            assert_eq!(tx.enqueue(data(0)), Some(expected));
        }
        assert_eq!(tx.enqueue(data(0)), None);
        assert_eq!(tx.in_flight(), 4);
    }

    #[test]
    fn test_transmit_respects_peer_window() {
        let mut tx = TransmitWindow::new(&config(8));
        for _ in 0..5 {
            tx.enqueue(data(0));
        }
        tx.set_peer_available(3);

        let mut sent = Vec::new();
        let count = tx
            .transmit_new(Instant::now(), 10, &mut collect_into(&mut sent))
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(sent, vec![1, 2, 3]);
        assert_eq!(tx.snapshot().last_sent, 3);
    }

    #[test]
    fn test_transmit_stops_when_bus_not_ready() {
        let mut tx = TransmitWindow::new(&config(8));
        tx.enqueue(data(0));
        tx.enqueue(data(0));
        tx.set_peer_available(8);

        let mut send = |_: &Frame| Err(BusError::NotReady);
        assert_eq!(tx.transmit_new(Instant::now(), 1, &mut send).unwrap(), 0);
        assert_eq!(tx.snapshot().last_sent, 0);
    }

    #[test]
    fn test_ack_frees_only_sent_frames() {
        let mut tx = TransmitWindow::new(&config(8));
        for _ in 0..4 {
            tx.enqueue(data(0));
        }
        tx.set_peer_available(2);
        let mut sent = Vec::new();
        tx.transmit_new(Instant::now(), 1, &mut collect_into(&mut sent))
            .unwrap();

        // Acks beyond what was sent are clamped
        let outcome = tx.acknowledge(4, Instant::now());
        assert_eq!(outcome.freed, 2);
        assert_eq!(tx.snapshot().next_unacknowledged, 3);
        assert_eq!(tx.in_flight(), 2);
    }

    #[test]
    fn test_fast_retransmit_after_duplicate_acks() {
        let mut tx = TransmitWindow::new(&config(8));
        for _ in 0..4 {
            tx.enqueue(data(0));
        }
        tx.set_peer_available(8);
        let mut sent = Vec::new();
        tx.transmit_new(Instant::now(), 1, &mut collect_into(&mut sent))
            .unwrap();

        let now = Instant::now();
        assert_eq!(tx.acknowledge(1, now).freed, 1);
        assert_eq!(tx.acknowledge(1, now).fast_retransmit, None);
        assert_eq!(tx.acknowledge(1, now).fast_retransmit, None);
        assert_eq!(tx.acknowledge(1, now).fast_retransmit, Some(2));
        assert_eq!(tx.acknowledge(1, now).fast_retransmit, Some(3));
    }

    #[test]
    fn test_retransmit_backs_off_then_exhausts() {
        let mut cfg = config(4);
        cfg.retransmit.max_retransmits = 2;
        let mut tx = TransmitWindow::new(&cfg);
        tx.enqueue(data(0));
        tx.set_peer_available(4);

        let start = Instant::now();
        let mut sent = Vec::new();
        tx.transmit_new(start, 1, &mut collect_into(&mut sent))
            .unwrap();

        let mut send = |_: &Frame| Ok(());
        // First deadline is 2 * min_delay
        assert_eq!(
            tx.retransmit_expired(start + Duration::from_millis(150), 1, &mut send)
                .unwrap(),
            Retransmit::Idle
        );
        let first = start + Duration::from_millis(250);
        assert_eq!(
            tx.retransmit_expired(first, 1, &mut send).unwrap(),
            Retransmit::Sent(1)
        );
        // Second deadline doubles and is measured from the resend
        assert_eq!(
            tx.retransmit_expired(first + Duration::from_millis(300), 1, &mut send)
                .unwrap(),
            Retransmit::Idle
        );
        let second = first + Duration::from_millis(450);
        assert_eq!(
            tx.retransmit_expired(second, 1, &mut send).unwrap(),
            Retransmit::Sent(1)
        );
        assert_eq!(
            tx.retransmit_expired(second + Duration::from_secs(2), 1, &mut send)
                .unwrap(),
            Retransmit::Exhausted
        );
    }

    #[test]
    fn test_progress_resets_retransmit_rounds() {
        let mut tx = TransmitWindow::new(&config(4));
        tx.enqueue(data(0));
        tx.enqueue(data(0));
        tx.set_peer_available(4);
        let start = Instant::now();
        let mut send = |_: &Frame| Ok(());
        tx.transmit_new(start, 1, &mut send).unwrap();
        tx.retransmit_expired(start + Duration::from_secs(1), 1, &mut send)
            .unwrap();
        assert_eq!(tx.snapshot().retransmit_rounds, 1);

        tx.acknowledge(1, start + Duration::from_secs(1));
        assert_eq!(tx.snapshot().retransmit_rounds, 0);
        assert!(!tx.is_drained(true));
        tx.acknowledge(2, start + Duration::from_secs(1));
        assert!(tx.is_drained(true));
    }

    #[test]
    fn test_drained_can_ignore_queued_frames() {
        let mut tx = TransmitWindow::new(&config(4));
        tx.enqueue(data(0));
        assert!(tx.is_drained(false));
        assert!(!tx.is_drained(true));
    }

    #[test]
    fn test_receive_in_order() {
        let mut rx = ReceiveWindow::new(&config(8));
        assert_eq!(rx.available(), 4);

        assert_eq!(
            rx.insert(&data(1)),
            Arrival::Accepted {
                ready: 1,
                ack_now: false
            }
        );
        assert!(rx.has_pending_ack());
        assert_eq!(rx.take_ack(), 1);
        assert_eq!(rx.available(), 3);
        assert!(!rx.has_pending_ack());

        let popped = rx.pop().unwrap();
        assert_eq!(popped.header.sequence, 1);
        assert_eq!(rx.available(), 4);
    }

    #[test]
    fn test_receive_reorders() {
        let mut rx = ReceiveWindow::new(&config(8));
        assert_eq!(
            rx.insert(&data(2)),
            Arrival::Accepted {
                ready: 0,
                ack_now: false
            }
        );
        assert!(rx.peek().is_none());
        assert_eq!(
            rx.insert(&data(1)),
            Arrival::Accepted {
                ready: 2,
                ack_now: false
            }
        );
        assert_eq!(rx.pop().unwrap().header.sequence, 1);
        assert_eq!(rx.pop().unwrap().header.sequence, 2);
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_duplicate_not_rebuffered() {
        let mut rx = ReceiveWindow::new(&config(8));
        rx.insert(&data(1));
        assert_eq!(rx.insert(&data(1)), Arrival::Duplicate);
        assert_eq!(rx.pop().unwrap().header.sequence, 1);
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_out_of_window_dropped() {
        let mut rx = ReceiveWindow::new(&config(4));
        assert_eq!(rx.insert(&data(5)), Arrival::OutOfWindow);
        assert!(!rx.has_pending_ack());
    }

    #[test]
    fn test_early_ack_threshold() {
        let mut rx = ReceiveWindow::new(&config(16));
        for sequence in 1..5 {
            assert!(matches!(
                rx.insert(&data(sequence)),
                Arrival::Accepted { ack_now: false, .. }
            ));
        }
        assert_eq!(
            rx.insert(&data(5)),
            Arrival::Accepted {
                ready: 1,
                ack_now: true
            }
        );
    }

    #[test]
    fn test_advertised_window_never_zero() {
        let mut rx = ReceiveWindow::new(&config(4));
        rx.insert(&data(1));
        rx.insert(&data(2));
        rx.insert(&data(3));
        rx.take_ack();
        assert_eq!(rx.available(), 1);
    }

    #[test]
    fn test_fin_detection_after_reset() {
        let mut rx = ReceiveWindow::new(&config(8));
        rx.reset(10);
        rx.insert(&frame(SessionMessage::Fin, 10, b""));
        assert!(rx.fin_is_next());
        assert_eq!(rx.snapshot().next_expected, 11);
    }

    #[test]
    fn test_snapshot_bounds() {
        let tx = TransmitWindow::new(&config(4));
        let rx = ReceiveWindow::new(&config(4));
        let snapshot = WindowSnapshot {
            transmit: tx.snapshot(),
            receive: rx.snapshot(),
        };
        assert!(snapshot.within_bounds());
    }
}
