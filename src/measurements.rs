//! Measurement Engine: per-stream counters and their aggregation into
//! interval samples and final results.
//!
//! Data-path tasks (generators and sinks) only ever touch a stream's
//! [`StreamCounters`], which are plain atomics. The engine itself sits behind a
//! `parking_lot::Mutex` that is taken by the interval timer, by stream
//! registration and completion, and once at finalization; never per packet.

use crate::config::Protocol;
use crate::udp_packet::{ReceiverReport, SenderTotals};
use crate::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Live counters of one stream, updated lock-free by its data-path task.
///
/// Bytes and datagrams only grow. The loss figure is the receiver's current
/// estimate and shrinks when a late datagram retracts a previously counted gap.
#[derive(Debug, Default)]
pub struct StreamCounters {
    bytes: AtomicU64,
    datagrams: AtomicU64,
    lost: AtomicU64,
    out_of_order: AtomicU64,
    duplicates: AtomicU64,
    late: AtomicU64,
    malformed: AtomicU64,
    jitter_bits: AtomicU64,
}

/// Sequence accounting of a datagram receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceCounts {
    pub received: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub late: u64,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_datagrams(&self, n: u64) {
        self.datagrams.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes the receiver's sequence accounting. Only the owning sink writes these.
    pub fn publish_sequence(&self, counts: SequenceCounts) {
        self.datagrams.store(counts.received, Ordering::Relaxed);
        self.lost.store(counts.lost, Ordering::Relaxed);
        self.out_of_order.store(counts.out_of_order, Ordering::Relaxed);
        self.duplicates.store(counts.duplicates, Ordering::Relaxed);
        self.late.store(counts.late, Ordering::Relaxed);
    }

    /// Stores the current jitter estimate in seconds.
    pub fn set_jitter(&self, secs: f64) {
        self.jitter_bits.store(secs.to_bits(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            datagrams: self.datagrams.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            jitter_secs: f64::from_bits(self.jitter_bits.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of a stream's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub bytes: u64,
    pub datagrams: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub late: u64,
    pub malformed: u64,
    pub jitter_secs: f64,
}

/// Which end of the traffic this engine measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// Client running traffic generators
    Sender,
    /// Server running traffic sinks
    Receiver,
}

/// Lifecycle of a [`MeasurementEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Running,
    Finalizing,
    Done,
}

/// How a stream's data-path task ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEnd {
    /// Limit reached or peer closed the stream normally
    Completed,
    /// Transport failure or timeout; the stream's result is partial
    Failed(String),
    /// Stopped by an external signal
    Cancelled,
}

/// Completeness of a final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Complete,
    Partial(String),
}

impl StreamStatus {
    pub fn is_partial(&self) -> bool {
        matches!(self, StreamStatus::Partial(_))
    }
}

/// Traffic of one stream (or the aggregate) over one report interval.
///
/// Times are seconds since the session started. Datagram counts are only
/// present for UDP; loss and jitter only on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSample {
    /// Stream number; `None` for the aggregate of all streams
    pub stream_id: Option<usize>,
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub datagrams: Option<u64>,
    /// Change in the loss estimate; negative when late arrivals retracted gaps
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lost: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub out_of_order: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub jitter_ms: Option<f64>,
}

/// All samples taken at one interval boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    pub streams: Vec<IntervalSample>,
    /// Present when more than one stream contributed
    pub sum: Option<IntervalSample>,
}

/// Terminal summary of one stream, or of all streams of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    /// Stream number; `None` for the aggregate
    pub stream_id: Option<usize>,
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    pub datagrams: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub late: u64,
    pub malformed: u64,
    pub jitter_ms: f64,
    pub loss_percent: f64,
    pub status: StreamStatus,
    /// Receiver's view, as reported back to a UDP sender
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer: Option<ReceiverReport>,
    /// Sender's ground truth, as carried by the FIN a UDP receiver got
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sender_totals: Option<SenderTotals>,
}

impl FinalResult {
    /// Seconds this stream was measured.
    pub fn elapsed(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_partial(&self) -> bool {
        self.status.is_partial()
    }
}

/// Final results of a session: one per stream plus their aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub protocol: Protocol,
    pub side: Side,
    pub streams: Vec<FinalResult>,
    pub sum: FinalResult,
    pub partial: bool,
}

struct StreamSlot {
    id: usize,
    counters: Arc<StreamCounters>,
    joined_at: Duration,
    last: CounterSnapshot,
    ended: Option<(Duration, StreamEnd)>,
    peer: Option<ReceiverReport>,
    sender_totals: Option<SenderTotals>,
}

struct EngineInner {
    protocol: Protocol,
    side: Side,
    state: EngineState,
    started: Option<Instant>,
    last_sample: Duration,
    slots: Vec<StreamSlot>,
}

impl EngineInner {
    fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn slot_mut(&mut self, id: usize) -> Result<&mut StreamSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::State(format!("unknown stream {}", id)))
    }
}

/// Aggregates the streams of one session.
///
/// Cloning is cheap and every clone refers to the same session. The engine
/// moves through `Idle -> Running -> Finalizing -> Done`; `Done` is terminal.
///
/// # Examples
///
/// ```
/// use rperf2::measurements::{MeasurementEngine, Side, StreamEnd};
/// use rperf2::Protocol;
///
/// let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
/// let counters = engine.register_stream(1).unwrap();
/// engine.start().unwrap();
///
/// counters.add_bytes(1_000_000);
/// engine.finish_stream(1, StreamEnd::Completed).unwrap();
///
/// let result = engine.finalize().unwrap();
/// assert_eq!(result.sum.bytes, 1_000_000);
/// assert!(engine.finalize().is_err());
/// ```
#[derive(Clone)]
pub struct MeasurementEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl MeasurementEngine {
    pub fn new(protocol: Protocol, side: Side) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EngineInner {
                protocol,
                side,
                state: EngineState::Idle,
                started: None,
                last_sample: Duration::ZERO,
                slots: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    pub fn protocol(&self) -> Protocol {
        self.inner.lock().protocol
    }

    /// Time since [`start`](Self::start), zero before it.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed()
    }

    /// Adds a stream and returns the counters its data-path task updates.
    ///
    /// Streams may join while the engine is running; their results are then
    /// measured from the moment they joined.
    pub fn register_stream(&self, id: usize) -> Result<Arc<StreamCounters>> {
        let mut inner = self.inner.lock();
        match inner.state {
            EngineState::Idle | EngineState::Running => {}
            state => {
                return Err(Error::State(format!(
                    "cannot add stream {} to a session in state {:?}",
                    id, state
                )))
            }
        }
        if inner.slots.iter().any(|s| s.id == id) {
            return Err(Error::State(format!("stream {} already registered", id)));
        }

        let counters = Arc::new(StreamCounters::new());
        let joined_at = inner.elapsed();
        inner.slots.push(StreamSlot {
            id,
            counters: counters.clone(),
            joined_at,
            last: CounterSnapshot::default(),
            ended: None,
            peer: None,
            sender_totals: None,
        });
        debug!("stream {} registered at {:?}", id, joined_at);
        Ok(counters)
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Idle {
            return Err(Error::State(format!(
                "cannot start a session in state {:?}",
                inner.state
            )));
        }
        inner.state = EngineState::Running;
        inner.started = Some(Instant::now());
        inner.last_sample = Duration::ZERO;
        Ok(())
    }

    /// Takes the interval sample since the previous call.
    ///
    /// Streams that ended before the interval began are skipped. Fails unless
    /// the engine is running.
    pub fn sample(&self) -> Result<IntervalReport> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != EngineState::Running {
            return Err(Error::State(format!(
                "no samples accepted in state {:?}",
                inner.state
            )));
        }

        let now = inner.elapsed();
        let start = inner.last_sample;
        let (protocol, side) = (inner.protocol, inner.side);
        let mut streams = Vec::with_capacity(inner.slots.len());
        for slot in inner.slots.iter_mut() {
            if matches!(&slot.ended, Some((at, _)) if *at <= start) {
                continue;
            }
            let snap = slot.counters.snapshot();
            streams.push(interval_sample(
                Some(slot.id),
                start,
                now,
                &slot.last,
                &snap,
                protocol,
                side,
            ));
            slot.last = snap;
        }
        inner.last_sample = now;

        let sum = if streams.len() > 1 {
            Some(sum_samples(&streams, start, now))
        } else {
            None
        };
        Ok(IntervalReport { streams, sum })
    }

    /// Records how a stream ended. Only the first call per stream counts.
    pub fn finish_stream(&self, id: usize, end: StreamEnd) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, EngineState::Finalizing | EngineState::Done) {
            return Err(Error::State(format!(
                "stream {} finished after the session was finalized",
                id
            )));
        }
        let at = inner.elapsed();
        let slot = inner.slot_mut(id)?;
        if slot.ended.is_none() {
            debug!("stream {} ended at {:?}: {:?}", id, at, end);
            slot.ended = Some((at, end));
        }
        Ok(())
    }

    /// Attaches the receiver's report to a sending stream.
    pub fn set_peer_report(&self, id: usize, report: ReceiverReport) -> Result<()> {
        self.inner.lock().slot_mut(id)?.peer = Some(report);
        Ok(())
    }

    /// Attaches the sender's FIN totals to a receiving stream.
    pub fn set_sender_totals(&self, id: usize, totals: SenderTotals) -> Result<()> {
        self.inner.lock().slot_mut(id)?.sender_totals = Some(totals);
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Streams registered but not yet finished.
    pub fn active_streams(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.ended.is_none())
            .count()
    }

    /// Computes the final results and moves the engine to `Done`.
    ///
    /// Streams that never reported an end are marked partial.
    pub fn finalize(&self) -> Result<SessionResult> {
        let mut guard = self.inner.lock();
        if matches!(guard.state, EngineState::Finalizing | EngineState::Done) {
            return Err(Error::State("session already finalized".to_string()));
        }
        guard.state = EngineState::Finalizing;

        let inner = &*guard;
        let now = inner.elapsed();
        let streams: Vec<FinalResult> = inner
            .slots
            .iter()
            .map(|slot| final_result(slot, now, inner.protocol, inner.side))
            .collect();
        let sum = aggregate(&streams, inner.protocol, inner.side);
        let partial = sum.is_partial();
        let result = SessionResult {
            protocol: inner.protocol,
            side: inner.side,
            streams,
            sum,
            partial,
        };

        guard.state = EngineState::Done;
        Ok(result)
    }
}

fn bits_per_second(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}

fn loss_percent(lost: u64, received: u64) -> f64 {
    let total = lost + received;
    if total == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / total as f64
    }
}

fn interval_sample(
    stream_id: Option<usize>,
    start: Duration,
    end: Duration,
    prev: &CounterSnapshot,
    now: &CounterSnapshot,
    protocol: Protocol,
    side: Side,
) -> IntervalSample {
    let bytes = now.bytes - prev.bytes;
    let udp = protocol == Protocol::Udp;
    let receiving = udp && side == Side::Receiver;
    IntervalSample {
        stream_id,
        start: start.as_secs_f64(),
        end: end.as_secs_f64(),
        bytes,
        bits_per_second: bits_per_second(bytes, (end - start).as_secs_f64()),
        datagrams: udp.then(|| now.datagrams - prev.datagrams),
        lost: receiving.then(|| now.lost as i64 - prev.lost as i64),
        out_of_order: receiving.then(|| now.out_of_order.saturating_sub(prev.out_of_order)),
        jitter_ms: receiving.then(|| now.jitter_secs * 1000.0),
    }
}

fn sum_samples(streams: &[IntervalSample], start: Duration, end: Duration) -> IntervalSample {
    let bytes = streams.iter().map(|s| s.bytes).sum();
    let total = |f: fn(&IntervalSample) -> Option<u64>| -> Option<u64> {
        streams.iter().map(f).sum::<Option<u64>>()
    };
    let jitters: Vec<f64> = streams.iter().filter_map(|s| s.jitter_ms).collect();
    IntervalSample {
        stream_id: None,
        start: start.as_secs_f64(),
        end: end.as_secs_f64(),
        bytes,
        bits_per_second: bits_per_second(bytes, (end - start).as_secs_f64()),
        datagrams: total(|s| s.datagrams),
        lost: streams.iter().map(|s| s.lost).sum::<Option<i64>>(),
        out_of_order: total(|s| s.out_of_order),
        jitter_ms: (!jitters.is_empty()).then(|| jitters.iter().sum::<f64>() / jitters.len() as f64),
    }
}

fn final_result(slot: &StreamSlot, now: Duration, protocol: Protocol, side: Side) -> FinalResult {
    let snap = slot.counters.snapshot();
    let (end, status) = match &slot.ended {
        Some((at, StreamEnd::Completed)) => (*at, StreamStatus::Complete),
        Some((at, StreamEnd::Failed(reason))) => (*at, StreamStatus::Partial(reason.clone())),
        Some((at, StreamEnd::Cancelled)) => (*at, StreamStatus::Partial("cancelled".to_string())),
        None => (now, StreamStatus::Partial("stream did not finish".to_string())),
    };
    let start = slot.joined_at.as_secs_f64();
    let end = end.max(slot.joined_at).as_secs_f64();
    let receiving = protocol == Protocol::Udp && side == Side::Receiver;

    FinalResult {
        stream_id: Some(slot.id),
        start,
        end,
        bytes: snap.bytes,
        bits_per_second: bits_per_second(snap.bytes, end - start),
        datagrams: snap.datagrams,
        lost: snap.lost,
        out_of_order: snap.out_of_order,
        duplicates: snap.duplicates,
        late: snap.late,
        malformed: snap.malformed,
        jitter_ms: if receiving { snap.jitter_secs * 1000.0 } else { 0.0 },
        loss_percent: if receiving {
            loss_percent(snap.lost, snap.datagrams)
        } else {
            0.0
        },
        status,
        peer: slot.peer,
        sender_totals: slot.sender_totals,
    }
}

/// Sums per-stream results.
///
/// Bandwidth is the sum of the per-stream figures, so the aggregate always
/// equals what the individual streams report.
fn aggregate(streams: &[FinalResult], protocol: Protocol, side: Side) -> FinalResult {
    let sum = |f: fn(&FinalResult) -> u64| -> u64 { streams.iter().map(f).sum() };
    let incomplete = streams.iter().filter(|s| s.is_partial()).count();
    let status = if incomplete == 0 {
        StreamStatus::Complete
    } else {
        StreamStatus::Partial(format!("{} of {} streams incomplete", incomplete, streams.len()))
    };
    let receiving = protocol == Protocol::Udp && side == Side::Receiver;
    let lost = sum(|s| s.lost);
    let datagrams = sum(|s| s.datagrams);

    FinalResult {
        stream_id: None,
        start: if streams.is_empty() {
            0.0
        } else {
            streams.iter().map(|s| s.start).fold(f64::INFINITY, f64::min)
        },
        end: streams.iter().map(|s| s.end).fold(0.0, f64::max),
        bytes: sum(|s| s.bytes),
        bits_per_second: streams.iter().map(|s| s.bits_per_second).sum(),
        datagrams,
        lost,
        out_of_order: sum(|s| s.out_of_order),
        duplicates: sum(|s| s.duplicates),
        late: sum(|s| s.late),
        malformed: sum(|s| s.malformed),
        jitter_ms: if receiving && !streams.is_empty() {
            streams.iter().map(|s| s.jitter_ms).sum::<f64>() / streams.len() as f64
        } else {
            0.0
        },
        loss_percent: if receiving {
            loss_percent(lost, datagrams)
        } else {
            0.0
        },
        status,
        peer: None,
        sender_totals: None,
    }
}

/// Samples `engine` on every interval boundary until `cancel` fires or the
/// engine stops accepting samples.
///
/// Boundaries are wall-clock driven and independent of traffic, so reports
/// for one session arrive in increasing time order.
pub async fn run_interval_timer<F>(
    engine: MeasurementEngine,
    period: Duration,
    cancel: CancellationToken,
    mut on_report: F,
) where
    F: FnMut(IntervalReport),
{
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match engine.sample() {
                Ok(report) => on_report(report),
                Err(e) => {
                    debug!("interval timer stopping: {}", e);
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.sample().is_err());

        engine.register_stream(1).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.start().is_err());

        engine.finalize().unwrap();
        assert_eq!(engine.state(), EngineState::Done);
        assert!(matches!(engine.sample(), Err(Error::State(_))));
        assert!(matches!(engine.finalize(), Err(Error::State(_))));
        assert!(engine.register_stream(2).is_err());
        assert!(engine.finish_stream(1, StreamEnd::Completed).is_err());
    }

    #[test]
    fn test_duplicate_and_unknown_streams() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        engine.register_stream(1).unwrap();
        assert!(engine.register_stream(1).is_err());
        assert!(engine.finish_stream(7, StreamEnd::Completed).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_deltas() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        let a = engine.register_stream(1).unwrap();
        let b = engine.register_stream(2).unwrap();
        engine.start().unwrap();

        a.add_bytes(1_000_000);
        b.add_bytes(500_000);
        time::advance(Duration::from_secs(1)).await;
        let first = engine.sample().unwrap();
        assert_eq!(first.streams.len(), 2);
        assert_eq!(first.streams[0].bytes, 1_000_000);
        assert_eq!(first.streams[0].bits_per_second, 8_000_000.0);
        let sum = first.sum.unwrap();
        assert_eq!(sum.bytes, 1_500_000);
        assert_eq!(sum.stream_id, None);
        assert_eq!(sum.datagrams, None);

        a.add_bytes(250_000);
        time::advance(Duration::from_secs(1)).await;
        let second = engine.sample().unwrap();
        assert_eq!(second.streams[0].bytes, 250_000);
        assert_eq!(second.streams[1].bytes, 0);
        assert_eq!(second.streams[0].start, 1.0);
        assert_eq!(second.streams[0].end, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_streams_leave_later_intervals() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        engine.register_stream(1).unwrap();
        engine.register_stream(2).unwrap();
        engine.start().unwrap();

        time::advance(Duration::from_millis(500)).await;
        engine.finish_stream(2, StreamEnd::Completed).unwrap();
        time::advance(Duration::from_millis(500)).await;
        assert_eq!(engine.sample().unwrap().streams.len(), 2);

        time::advance(Duration::from_secs(1)).await;
        let report = engine.sample().unwrap();
        assert_eq!(report.streams.len(), 1);
        assert!(report.sum.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_receiver_loss_can_be_retracted() {
        let engine = MeasurementEngine::new(Protocol::Udp, Side::Receiver);
        let c = engine.register_stream(1).unwrap();
        engine.start().unwrap();

        c.publish_sequence(SequenceCounts {
            received: 10,
            lost: 2,
            ..Default::default()
        });
        time::advance(Duration::from_secs(1)).await;
        assert_eq!(engine.sample().unwrap().streams[0].lost, Some(2));

        c.publish_sequence(SequenceCounts {
            received: 12,
            lost: 1,
            out_of_order: 1,
            ..Default::default()
        });
        time::advance(Duration::from_secs(1)).await;
        let sample = engine.sample().unwrap().streams.remove(0);
        assert_eq!(sample.lost, Some(-1));
        assert_eq!(sample.out_of_order, Some(1));
        assert_eq!(sample.datagrams, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sum_equals_aggregate() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        let counters: Vec<_> = (1..=3).map(|id| engine.register_stream(id).unwrap()).collect();
        engine.start().unwrap();

        for (i, c) in counters.iter().enumerate() {
            c.add_bytes(1_000_000 * (i as u64 + 1));
            time::advance(Duration::from_millis(300)).await;
            engine.finish_stream(i + 1, StreamEnd::Completed).unwrap();
        }

        let result = engine.finalize().unwrap();
        let per_stream: f64 = result.streams.iter().map(|s| s.bits_per_second).sum();
        assert!((per_stream - result.sum.bits_per_second).abs() < 1e-6);
        assert_eq!(result.sum.bytes, 6_000_000);
        assert!((result.sum.end - 0.9).abs() < 1e-9);
        assert!(!result.partial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stream_marks_session_partial() {
        let engine = MeasurementEngine::new(Protocol::Udp, Side::Receiver);
        let ok = engine.register_stream(1).unwrap();
        let bad = engine.register_stream(2).unwrap();
        engine.start().unwrap();

        ok.publish_sequence(SequenceCounts {
            received: 90,
            lost: 10,
            ..Default::default()
        });
        ok.set_jitter(0.002);
        bad.publish_sequence(SequenceCounts {
            received: 100,
            ..Default::default()
        });
        time::advance(Duration::from_secs(1)).await;
        engine.finish_stream(1, StreamEnd::Completed).unwrap();
        engine
            .finish_stream(2, StreamEnd::Failed("connection reset".to_string()))
            .unwrap();

        let result = engine.finalize().unwrap();
        assert!(result.partial);
        assert_eq!(result.streams[0].status, StreamStatus::Complete);
        assert_eq!(
            result.streams[1].status,
            StreamStatus::Partial("connection reset".to_string())
        );
        assert_eq!(result.streams[0].loss_percent, 10.0);
        assert_eq!(result.streams[0].jitter_ms, 2.0);
        assert_eq!(result.sum.lost, 10);
        assert_eq!(result.sum.loss_percent, 5.0);
    }

    #[test]
    fn test_unfinished_stream_is_partial() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        engine.register_stream(1).unwrap();
        engine.start().unwrap();
        let result = engine.finalize().unwrap();
        assert!(result.streams[0].is_partial());
        assert!(result.partial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_timer_delivers_in_order() {
        let engine = MeasurementEngine::new(Protocol::Tcp, Side::Sender);
        let c = engine.register_stream(1).unwrap();
        engine.start().unwrap();
        c.add_bytes(10);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let timer = tokio::spawn(run_interval_timer(
            engine.clone(),
            Duration::from_millis(100),
            cancel.clone(),
            move |report| {
                let _ = tx.send(report);
            },
        ));

        time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        timer.await.unwrap();

        let mut ends = Vec::new();
        while let Ok(report) = rx.try_recv() {
            ends.push(report.streams[0].end);
        }
        assert_eq!(ends.len(), 3);
        assert!(ends.windows(2).all(|w| w[0] < w[1]));
    }
}
