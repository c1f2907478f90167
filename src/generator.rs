//! Traffic Generator: drives one outbound stream until its limit.
//!
//! Each send is sized to the configured buffer and paced by a [`Pacer`]. The
//! loop stops on the time or byte limit, on a send failure, or on
//! cancellation; a pacing sleep never delays a stop. UDP streams then send a
//! FIN carrying the sender's totals and wait for the receiver's report; that
//! wait is a separate step so it never counts towards the stream's time.

use crate::config::{Config, Protocol};
use crate::measurements::{StreamCounters, StreamEnd};
use crate::token_bucket::Pacer;
use crate::transport::{Received, TransportSession};
use crate::udp_packet::{self, Datagram, DatagramHeader, ReceiverReport, SenderTotals};
use log::{debug, warn};
use std::io;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// How long each FIN waits for the receiver's report.
pub const REPORT_WAIT: Duration = Duration::from_millis(250);

/// Result of one generator run.
#[derive(Debug, Clone)]
pub struct GeneratorOutcome {
    pub end: StreamEnd,
    /// What was actually sent
    pub totals: SenderTotals,
}

impl GeneratorOutcome {
    /// Whether a UDP stream still owes its receiver a FIN.
    pub fn needs_fin(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Udp && !matches!(self.end, StreamEnd::Failed(_))
    }
}

/// Resolves at `deadline`, or never when there is none.
pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Runs the send loop on `session` according to `config`.
pub async fn run_generator(
    session: &mut TransportSession,
    config: &Config,
    counters: &StreamCounters,
    cancel: &CancellationToken,
) -> GeneratorOutcome {
    let protocol = session.protocol();
    let len = config.buffer_len();
    let byte_limit = config.limit.bytes();
    let started = Instant::now();
    let stop = until(config.limit.duration().map(|d| started + d));
    tokio::pin!(stop);

    let mut pacer = Pacer::new(config.pacing_rate(), config.pacing_tick());
    let mut buf = pattern(len);
    let mut sent = 0u64;
    let mut seq = 0u64;

    let end = loop {
        let n = match byte_limit {
            Some(limit) if sent >= limit => break StreamEnd::Completed,
            Some(limit) => chunk_len(protocol, len, limit - sent),
            None => len,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            _ = &mut stop => break StreamEnd::Completed,
            res = send_one(session, &mut pacer, &mut buf[..n], protocol, seq + 1) => match res {
                Ok(written) => {
                    sent += written;
                    counters.add_bytes(written);
                    if protocol == Protocol::Udp {
                        seq += 1;
                        counters.add_datagrams(1);
                    }
                }
                Err(e) => {
                    warn!("send to {} failed: {}", session.peer_addr(), e);
                    break StreamEnd::Failed(e.to_string());
                }
            },
        }
    };

    let totals = SenderTotals {
        bytes: sent,
        datagrams: seq,
        elapsed_us: started.elapsed().as_micros() as u64,
    };
    debug!(
        "generator to {} stopped after {} bytes: {:?}",
        session.peer_addr(),
        sent,
        end
    );

    if protocol == Protocol::Tcp && !matches!(end, StreamEnd::Failed(_)) {
        if let Err(e) = session.shutdown().await {
            debug!("shutdown of {} failed: {}", session.peer_addr(), e);
        }
    }

    GeneratorOutcome { end, totals }
}

async fn send_one(
    session: &mut TransportSession,
    pacer: &mut Pacer,
    buf: &mut [u8],
    protocol: Protocol,
    seq: u64,
) -> io::Result<u64> {
    pacer.acquire(buf.len()).await;
    if protocol == Protocol::Udp {
        udp_packet::encode_data(buf, seq);
    }
    let n = session.send(buf).await?;
    Ok(n as u64)
}

/// Length of the next send when `remaining` bytes are left under a byte limit.
fn chunk_len(protocol: Protocol, len: usize, remaining: u64) -> usize {
    let n = remaining.min(len as u64) as usize;
    match protocol {
        Protocol::Tcp => n,
        Protocol::Udp => n.max(DatagramHeader::SIZE),
    }
}

/// iperf-style payload: repeating ASCII digits.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'0' + (i % 10) as u8).collect()
}

/// Sends the FIN up to `burst` times and returns the first report received.
///
/// After cancellation the burst goes out back to back without waiting.
pub async fn exchange_fin(
    session: &mut TransportSession,
    outcome: &GeneratorOutcome,
    burst: u32,
) -> Option<ReceiverReport> {
    let totals = &outcome.totals;
    let fin = udp_packet::encode_fin(totals.datagrams + 1, totals);
    if outcome.end == StreamEnd::Cancelled {
        for _ in 0..burst {
            if session.send(&fin).await.is_err() {
                break;
            }
        }
        return None;
    }

    let mut buf = vec![0u8; DatagramHeader::SIZE + ReceiverReport::SIZE + 64];
    for attempt in 1..=burst {
        if let Err(e) = session.send(&fin).await {
            debug!("FIN {} to {} failed: {}", attempt, session.peer_addr(), e);
        }
        let wait = Instant::now() + REPORT_WAIT;
        loop {
            match time::timeout_at(wait, session.receive(&mut buf)).await {
                Ok(Ok(Received::Data(n))) => {
                    if let Ok(Datagram::Report { report, .. }) = udp_packet::parse(&buf[..n]) {
                        debug!("report from {} after {} FIN(s)", session.peer_addr(), attempt);
                        return Some(report);
                    }
                }
                Ok(Ok(Received::EndOfStream)) | Err(_) => break,
                Ok(Err(e)) => {
                    debug!("waiting for report: {}", e);
                    time::sleep_until(wait).await;
                    break;
                }
            }
        }
    }
    warn!(
        "no report from {} after {} FIN datagrams",
        session.peer_addr(),
        burst
    );
    None
}
