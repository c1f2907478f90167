//! Traffic Sink: consumes one inbound stream and keeps its counters current.
//!
//! TCP sinks only count bytes. UDP sinks additionally track sequence numbers
//! for loss, reordering and duplicates, estimate jitter, and answer the
//! sender's FIN with a [`ReceiverReport`].
//!
//! # Reorder window
//!
//! A gap in the sequence is counted as lost as soon as it is seen. The
//! tracker remembers which of the last `window` numbers below the highest one
//! are still missing; when one of them shows up late the loss is retracted
//! and the datagram is counted as out of order. Anything older than the window
//! is counted as `late` and the loss stands.

use crate::generator::until;
use crate::measurements::{SequenceCounts, StreamCounters, StreamEnd};
use crate::transport::{Received, TransportSession};
use crate::udp_packet::{self, Datagram, ReceiverReport, SenderTotals};
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Classification of one datagram's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Exactly the next expected number
    InOrder,
    /// Ahead of the expected number; this many datagrams counted lost
    Gap(u64),
    /// Filled an earlier gap inside the reorder window
    Reordered,
    /// Seen before
    Duplicate,
    /// Older than the reorder window
    Late,
}

/// Loss and reorder accounting over a stream's sequence numbers.
///
/// # Examples
///
/// ```
/// use rperf2::sink::SequenceTracker;
///
/// let mut tracker = SequenceTracker::new(3);
/// for seq in [1, 2, 4, 3, 5] {
///     tracker.observe(seq);
/// }
/// assert_eq!(tracker.counts().lost, 0);
/// assert_eq!(tracker.counts().out_of_order, 1);
/// ```
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    window: u32,
    highest: u64,
    // bit i set: highest - 1 - i has not arrived
    missing: u64,
    counts: SequenceCounts,
}

impl SequenceTracker {
    /// Creates a tracker; `window` is clamped to 1..=64.
    pub fn new(window: u32) -> Self {
        Self {
            window: window.clamp(1, 64),
            highest: 0,
            missing: 0,
            counts: SequenceCounts::default(),
        }
    }

    pub fn highest(&self) -> u64 {
        self.highest
    }

    pub fn counts(&self) -> SequenceCounts {
        self.counts
    }

    pub fn observe(&mut self, seq: u64) -> Arrival {
        if seq > self.highest {
            let gap = seq - self.highest - 1;
            self.slide(seq, gap);
            self.counts.received += 1;
            self.counts.lost += gap;
            return if gap == 0 {
                Arrival::InOrder
            } else {
                Arrival::Gap(gap)
            };
        }
        if seq == self.highest {
            self.counts.duplicates += 1;
            return Arrival::Duplicate;
        }

        let behind = self.highest - 1 - seq;
        if behind >= u64::from(self.window) {
            self.counts.late += 1;
            return Arrival::Late;
        }
        let bit = 1u64 << behind;
        if self.missing & bit != 0 {
            self.missing &= !bit;
            self.counts.lost -= 1;
            self.counts.out_of_order += 1;
            self.counts.received += 1;
            Arrival::Reordered
        } else {
            self.counts.duplicates += 1;
            Arrival::Duplicate
        }
    }

    /// Accounts for datagrams the sender reports beyond the highest seen.
    ///
    /// Returns the number of tail datagrams added to the loss. They stay
    /// inside the reorder window, so a straggler can still retract its loss.
    pub fn finish(&mut self, sent: u64) -> u64 {
        if sent <= self.highest {
            return 0;
        }
        let tail = sent - self.highest;
        self.slide(sent.saturating_add(1), tail);
        self.counts.lost += tail;
        tail
    }

    fn slide(&mut self, new_highest: u64, gap: u64) {
        let shift = new_highest - self.highest;
        let mut missing = if shift >= 64 { 0 } else { self.missing << shift };
        missing |= low_bits(gap);
        self.missing = missing & low_bits(u64::from(self.window));
        self.highest = new_highest;
    }
}

fn low_bits(n: u64) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// RFC 1889 interarrival jitter: `J += (|D| - J) / 16`.
#[derive(Debug, Clone, Default)]
pub struct JitterEstimator {
    jitter: f64,
    last_transit: Option<f64>,
}

impl JitterEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in one datagram and returns the estimate in seconds.
    ///
    /// Sender and receiver clocks need not agree: only differences between
    /// consecutive transit times are used, so a constant offset cancels out.
    pub fn update(&mut self, sent_secs: f64, arrival_secs: f64) -> f64 {
        let transit = arrival_secs - sent_secs;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
        self.jitter
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// What a datagram meant to the sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SinkEvent {
    Data(Arrival),
    /// End of stream; carries the sender's totals
    Fin(SenderTotals),
    /// Dropped and counted
    Malformed,
    /// Valid but not meant for a sink
    Ignored,
}

/// Receiving side of one UDP stream.
pub struct DatagramSink {
    tracker: SequenceTracker,
    jitter: JitterEstimator,
    counters: Arc<StreamCounters>,
    bytes: u64,
    first_arrival: Option<SystemTime>,
    last_arrival: Option<SystemTime>,
    sender_totals: Option<SenderTotals>,
}

impl DatagramSink {
    pub fn new(counters: Arc<StreamCounters>, reorder_window: u32) -> Self {
        Self {
            tracker: SequenceTracker::new(reorder_window),
            jitter: JitterEstimator::new(),
            counters,
            bytes: 0,
            first_arrival: None,
            last_arrival: None,
            sender_totals: None,
        }
    }

    pub fn on_datagram(&mut self, bytes: &[u8], arrival: SystemTime) -> SinkEvent {
        let datagram = match udp_packet::parse(bytes) {
            Ok(d) => d,
            Err(e) => {
                debug!("dropping datagram: {}", e);
                self.counters.add_malformed();
                return SinkEvent::Malformed;
            }
        };

        match datagram {
            Datagram::Data { header, .. } => {
                if header.sequence == 0 {
                    debug!("dropping datagram with sequence 0");
                    self.counters.add_malformed();
                    return SinkEvent::Malformed;
                }
                let kind = self.tracker.observe(header.sequence);
                self.bytes += bytes.len() as u64;
                self.counters.add_bytes(bytes.len() as u64);
                self.first_arrival.get_or_insert(arrival);
                self.last_arrival = Some(arrival);

                if matches!(kind, Arrival::InOrder | Arrival::Gap(_) | Arrival::Reordered) {
                    let j = self.jitter.update(header.sent_secs(), epoch_secs(arrival));
                    self.counters.set_jitter(j);
                }
                self.counters.publish_sequence(self.tracker.counts());
                SinkEvent::Data(kind)
            }
            Datagram::Fin { totals, .. } => {
                if totals.datagrams < self.tracker.highest() {
                    debug!(
                        "dropping FIN for {} datagrams after sequence {}",
                        totals.datagrams,
                        self.tracker.highest()
                    );
                    self.counters.add_malformed();
                    return SinkEvent::Malformed;
                }
                if self.sender_totals.is_none() {
                    self.close_with(totals, arrival);
                }
                SinkEvent::Fin(totals)
            }
            Datagram::Report { .. } => SinkEvent::Ignored,
        }
    }

    fn close_with(&mut self, totals: SenderTotals, arrival: SystemTime) {
        let tail = self.tracker.finish(totals.datagrams);
        if tail > 0 {
            debug!("{} datagrams lost at the end of the stream", tail);
        }
        let counts = self.tracker.counts();
        if counts.received.saturating_add(counts.lost) != totals.datagrams {
            warn!(
                "sender reports {} datagrams, receiver accounted for {} received + {} lost",
                totals.datagrams, counts.received, counts.lost
            );
        }
        self.counters.publish_sequence(counts);
        self.first_arrival.get_or_insert(arrival);
        self.last_arrival = Some(arrival);
        self.sender_totals = Some(totals);
    }

    pub fn sender_totals(&self) -> Option<SenderTotals> {
        self.sender_totals
    }

    pub fn counts(&self) -> SequenceCounts {
        self.tracker.counts()
    }

    /// The receiver's view so far, in the form sent back to the sender.
    pub fn report(&self) -> ReceiverReport {
        let counts = self.tracker.counts();
        let elapsed = match (self.first_arrival, self.last_arrival) {
            (Some(first), Some(last)) => last.duration_since(first).unwrap_or_default(),
            _ => Duration::ZERO,
        };
        ReceiverReport {
            bytes: self.bytes,
            datagrams: counts.received,
            lost: counts.lost,
            out_of_order: counts.out_of_order,
            duplicates: counts.duplicates,
            jitter_us: (self.jitter.jitter() * 1_000_000.0).round() as u64,
            elapsed_us: elapsed.as_micros() as u64,
        }
    }
}

fn epoch_secs(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// When a TCP sink gives up on its stream.
#[derive(Debug, Clone, Copy)]
pub struct TcpSinkLimits {
    /// Absolute end of the stream, if the client announced one
    pub deadline: Option<Instant>,
    /// Longest silence tolerated between reads
    pub idle_timeout: Duration,
}

/// Reads a TCP stream until the peer closes it.
pub async fn run_tcp_sink(
    session: &mut TransportSession,
    counters: &StreamCounters,
    buf_len: usize,
    limits: TcpSinkLimits,
    cancel: &CancellationToken,
) -> StreamEnd {
    let mut buf = vec![0u8; buf_len];
    let deadline = until(limits.deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            _ = &mut deadline => {
                return StreamEnd::Failed("stream ran past its announced duration".to_string())
            }
            read = time::timeout(limits.idle_timeout, session.receive(&mut buf)) => match read {
                Ok(Ok(Received::Data(n))) => counters.add_bytes(n as u64),
                Ok(Ok(Received::EndOfStream)) => return StreamEnd::Completed,
                Ok(Err(e)) => return StreamEnd::Failed(e.to_string()),
                Err(_) => {
                    return StreamEnd::Failed(format!(
                        "no data for {} ms",
                        limits.idle_timeout.as_millis()
                    ))
                }
            },
        }
    }
}

/// Final state of a UDP sink.
#[derive(Debug, Clone)]
pub struct UdpSinkOutcome {
    pub end: StreamEnd,
    pub report: ReceiverReport,
    pub sender_totals: Option<SenderTotals>,
}

/// Feeds datagrams routed to one peer into `sink` until the FIN arrives.
///
/// The server's dispatcher owns the socket and forwards each datagram with
/// its arrival time. The first FIN is answered here; retries after the sink
/// has returned are answered by the dispatcher from the returned report.
pub async fn run_udp_sink(
    mut sink: DatagramSink,
    mut rx: mpsc::Receiver<(Vec<u8>, SystemTime)>,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    idle_timeout: Duration,
    cancel: CancellationToken,
) -> UdpSinkOutcome {
    let end = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            next = time::timeout(idle_timeout, rx.recv()) => match next {
                Ok(Some((bytes, at))) => {
                    if let SinkEvent::Fin(totals) = sink.on_datagram(&bytes, at) {
                        send_report(&socket, peer, totals.datagrams.saturating_add(1), &sink.report()).await;
                        break StreamEnd::Completed;
                    }
                }
                Ok(None) => break StreamEnd::Cancelled,
                Err(_) => {
                    break StreamEnd::Failed(format!(
                        "no datagrams for {} ms",
                        idle_timeout.as_millis()
                    ))
                }
            },
        }
    };

    UdpSinkOutcome {
        end,
        report: sink.report(),
        sender_totals: sink.sender_totals(),
    }
}

/// Answers a FIN. Failures are logged; the sender retries its FIN.
pub async fn send_report(socket: &UdpSocket, peer: SocketAddr, sequence: u64, report: &ReceiverReport) {
    let bytes = udp_packet::encode_report(sequence, report);
    if let Err(e) = socket.send_to(&bytes, peer).await {
        warn!("failed to send report to {}: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp_packet::{encode_data, encode_fin, DatagramHeader};

    fn track(window: u32, seqs: &[u64]) -> SequenceCounts {
        let mut tracker = SequenceTracker::new(window);
        for &seq in seqs {
            tracker.observe(seq);
        }
        tracker.counts()
    }

    #[test]
    fn test_in_order_has_no_loss() {
        let counts = track(3, &(1..=1000).collect::<Vec<_>>());
        assert_eq!(counts.received, 1000);
        assert_eq!(counts.lost, 0);
        assert_eq!(counts.out_of_order, 0);
    }

    #[test]
    fn test_missing_datagram_is_lost() {
        let counts = track(3, &[1, 2, 4, 5]);
        assert_eq!(counts.lost, 1);
        assert_eq!(counts.out_of_order, 0);
    }

    #[test]
    fn test_late_arrival_retracts_loss() {
        let counts = track(3, &[1, 2, 4, 3, 5]);
        assert_eq!(counts.lost, 0);
        assert_eq!(counts.out_of_order, 1);
        assert_eq!(counts.received, 5);
    }

    #[test]
    fn test_arrival_classification() {
        let mut tracker = SequenceTracker::new(3);
        assert_eq!(tracker.observe(1), Arrival::InOrder);
        assert_eq!(tracker.observe(4), Arrival::Gap(2));
        assert_eq!(tracker.observe(2), Arrival::Reordered);
        assert_eq!(tracker.observe(2), Arrival::Duplicate);
        assert_eq!(tracker.observe(4), Arrival::Duplicate);
        assert_eq!(tracker.observe(1), Arrival::Duplicate);
        assert_eq!(tracker.counts().lost, 1);
    }

    #[test]
    fn test_older_than_window_is_late() {
        // 2 goes missing, then 6 more arrive: 2 is now 5 behind the window of 3
        let counts = track(3, &[1, 3, 4, 5, 6, 7, 2]);
        assert_eq!(counts.lost, 1);
        assert_eq!(counts.late, 1);
        assert_eq!(counts.out_of_order, 0);

        // a wider window still catches it
        let counts = track(8, &[1, 3, 4, 5, 6, 7, 2]);
        assert_eq!(counts.lost, 0);
        assert_eq!(counts.out_of_order, 1);
    }

    #[test]
    fn test_first_datagram_lost() {
        let counts = track(3, &[2, 3, 1]);
        assert_eq!(counts.lost, 0);
        assert_eq!(counts.out_of_order, 1);
    }

    #[test]
    fn test_tail_loss_from_sender_totals() {
        let mut tracker = SequenceTracker::new(3);
        for seq in 1..=8 {
            tracker.observe(seq);
        }
        assert_eq!(tracker.finish(10), 2);
        assert_eq!(tracker.counts().lost, 2);

        // a straggler from the tail still retracts
        assert_eq!(tracker.observe(10), Arrival::Reordered);
        assert_eq!(tracker.counts().lost, 1);
        assert_eq!(tracker.finish(10), 0);
    }

    #[test]
    fn test_jitter_constant_delay_is_zero() {
        let mut jitter = JitterEstimator::new();
        for i in 0..100 {
            let sent = 1000.0 + i as f64 * 0.01;
            jitter.update(sent, sent + 0.005);
        }
        assert!(jitter.jitter() < 1e-9);
    }

    #[test]
    fn test_jitter_smoothing() {
        let mut jitter = JitterEstimator::new();
        jitter.update(0.0, 0.010);
        // transit changes by 16 ms: J = 16/16 = 1 ms
        let j = jitter.update(1.0, 1.026);
        assert!((j - 0.001).abs() < 1e-9);
    }

    fn data(seq: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 100];
        encode_data(&mut buf, seq);
        buf
    }

    #[test]
    fn test_datagram_sink_counts_and_fin() {
        let counters = Arc::new(StreamCounters::new());
        let mut sink = DatagramSink::new(counters.clone(), 3);
        let now = SystemTime::now();

        for seq in [1, 2, 4, 5] {
            assert!(matches!(sink.on_datagram(&data(seq), now), SinkEvent::Data(_)));
        }
        let totals = SenderTotals {
            bytes: 600,
            datagrams: 6,
            elapsed_us: 1_000,
        };
        assert_eq!(sink.on_datagram(&encode_fin(7, &totals), now), SinkEvent::Fin(totals));

        let snap = counters.snapshot();
        assert_eq!(snap.bytes, 400);
        assert_eq!(snap.datagrams, 4);
        // 3 in the middle, 6 at the tail
        assert_eq!(snap.lost, 2);

        let report = sink.report();
        assert_eq!(report.datagrams, 4);
        assert_eq!(report.lost, 2);
        assert_eq!(sink.sender_totals(), Some(totals));
    }

    #[test]
    fn test_malformed_datagrams_are_counted() {
        let counters = Arc::new(StreamCounters::new());
        let mut sink = DatagramSink::new(counters.clone(), 3);
        let now = SystemTime::now();

        assert_eq!(sink.on_datagram(&[0u8; 5], now), SinkEvent::Malformed);
        assert_eq!(sink.on_datagram(&[0u8; DatagramHeader::SIZE], now), SinkEvent::Malformed);
        assert_eq!(sink.on_datagram(&data(0), now), SinkEvent::Malformed);
        assert!(matches!(sink.on_datagram(&data(1), now), SinkEvent::Data(Arrival::InOrder)));

        let snap = counters.snapshot();
        assert_eq!(snap.malformed, 3);
        assert_eq!(snap.datagrams, 1);
    }

    #[test]
    fn test_fin_behind_received_data_is_malformed() {
        let counters = Arc::new(StreamCounters::new());
        let mut sink = DatagramSink::new(counters.clone(), 3);
        let now = SystemTime::now();
        for seq in 1..=5 {
            sink.on_datagram(&data(seq), now);
        }

        let short = SenderTotals {
            bytes: 200,
            datagrams: 2,
            elapsed_us: 1,
        };
        assert_eq!(sink.on_datagram(&encode_fin(3, &short), now), SinkEvent::Malformed);
        assert_eq!(sink.sender_totals(), None);
        assert_eq!(counters.snapshot().malformed, 1);

        // the stream carries on and the real FIN still closes it
        let real = SenderTotals {
            bytes: 500,
            datagrams: 5,
            elapsed_us: 1,
        };
        assert_eq!(sink.on_datagram(&encode_fin(6, &real), now), SinkEvent::Fin(real));
        assert_eq!(sink.counts().lost, 0);
    }

    #[tokio::test]
    async fn test_udp_sink_answers_fin() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = client.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(16);

        let counters = Arc::new(StreamCounters::new());
        let task = tokio::spawn(run_udp_sink(
            DatagramSink::new(counters, 3),
            rx,
            server.clone(),
            peer,
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        for seq in 1..=3 {
            tx.send((data(seq), SystemTime::now())).await.unwrap();
        }
        let totals = SenderTotals {
            bytes: 300,
            datagrams: 3,
            elapsed_us: 10,
        };
        tx.send((encode_fin(4, &totals), SystemTime::now())).await.unwrap();

        let outcome = task.await.unwrap();
        assert_eq!(outcome.end, StreamEnd::Completed);
        assert_eq!(outcome.report.datagrams, 3);

        let mut buf = [0u8; 256];
        let n = client.recv(&mut buf).await.unwrap();
        match udp_packet::parse(&buf[..n]).unwrap() {
            Datagram::Report { report, .. } => assert_eq!(report.lost, 0),
            other => panic!("expected report, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_sink_idle_timeout() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (_tx, rx) = mpsc::channel(1);
        let outcome = run_udp_sink(
            DatagramSink::new(Arc::new(StreamCounters::new()), 3),
            rx,
            server,
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_secs(10),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome.end, StreamEnd::Failed(_)));
    }
}
