//! Reporting: renders banners, interval samples and final results.
//!
//! Producers hand events to a [`Reporter`], a bounded queue drained by a
//! single task ([`run_reporter_task`]) that owns the output sink, so lines from
//! concurrent sessions never interleave. Interval reports are offered with
//! `try_send` and dropped when the queue is full; the data path never waits
//! on output.

use crate::config::{Mode, OutputFormat, Protocol};
use crate::measurements::{FinalResult, IntervalReport, IntervalSample, SessionResult, Side, StreamStatus};
use crate::{Error, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Capacity of the report queue.
pub const REPORT_QUEUE_CAPACITY: usize = 256;

/// CSV stream id of an aggregate row.
pub const CSV_SUM_ID: i64 = -1;

/// What a session is doing, printed once when it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Banner {
    pub mode: Mode,
    pub protocol: Protocol,
    /// Target host (client) or bind address (server)
    pub host: String,
    pub port: u16,
    pub buffer_len: usize,
    pub window: Option<usize>,
    pub bandwidth: Option<u64>,
}

/// Endpoints of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub stream_id: usize,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

/// One unit of output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    Banner(Banner),
    Connected(Connection),
    Interval(IntervalReport),
    Final(SessionResult),
}

/// Producer handle of the report queue. Clones share the queue.
///
/// # Examples
///
/// ```
/// use rperf2::report::{run_reporter_task, Reporter};
/// use rperf2::OutputFormat;
///
/// # async fn example() {
/// let (reporter, receiver) = Reporter::new();
/// let task = tokio::spawn(run_reporter_task(receiver, OutputFormat::Human, tokio::io::stdout()));
/// // ... hand the reporter to a session ...
/// drop(reporter);
/// task.await.unwrap().unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct Reporter {
    sender: mpsc::Sender<ReportEvent>,
    dropped: Arc<AtomicU64>,
}

impl Reporter {
    pub fn new() -> (Self, mpsc::Receiver<ReportEvent>) {
        Self::with_capacity(REPORT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ReportEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Offers an interval report without waiting. Returns false if it was dropped.
    pub fn interval(&self, report: IntervalReport) -> bool {
        match self.sender.try_send(ReportEvent::Interval(report)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("report output is falling behind; dropping interval reports");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queues an event, waiting for room. Not for use on the data path.
    pub async fn send(&self, event: ReportEvent) {
        if self.sender.send(event).await.is_err() {
            warn!("report output closed; event discarded");
        }
    }

    /// Interval reports dropped so far because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains the report queue into `out` until every [`Reporter`] is dropped.
pub async fn run_reporter_task<W>(
    mut receiver: mpsc::Receiver<ReportEvent>,
    format: OutputFormat,
    mut out: W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut formatter = Formatter::new(format);
    while let Some(event) = receiver.recv().await {
        let text = formatter.render(&event);
        if !text.is_empty() {
            out.write_all(text.as_bytes()).await?;
            out.flush().await?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Columns {
    Transfer,
    Datagrams,
}

/// Turns events into text in one output format.
pub struct Formatter {
    format: OutputFormat,
    connections: HashMap<usize, Connection>,
    columns: Option<Columns>,
}

impl Formatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            connections: HashMap::new(),
            columns: None,
        }
    }

    pub fn render(&mut self, event: &ReportEvent) -> String {
        if let ReportEvent::Connected(conn) = event {
            self.connections.insert(conn.stream_id, *conn);
        }
        match self.format {
            OutputFormat::Json => match serde_json::to_string(event) {
                Ok(line) => line + "\n",
                Err(e) => {
                    warn!("failed to encode report: {}", e);
                    String::new()
                }
            },
            OutputFormat::Csv => self.render_csv(event),
            OutputFormat::Human => self.render_human(event),
        }
    }

    fn render_human(&mut self, event: &ReportEvent) -> String {
        match event {
            ReportEvent::Banner(banner) => human_banner(banner),
            ReportEvent::Connected(c) => format!(
                "[{:>3}] local {} port {} connected with {} port {}\n",
                c.stream_id,
                c.local.ip(),
                c.local.port(),
                c.peer.ip(),
                c.peer.port()
            ),
            ReportEvent::Interval(report) => {
                let mut out = String::new();
                let receiving = report.streams.iter().any(|s| s.jitter_ms.is_some());
                self.column_header(&mut out, receiving);
                for sample in report.streams.iter().chain(report.sum.iter()) {
                    out.push_str(&human_interval(sample));
                }
                out
            }
            ReportEvent::Final(result) => {
                let mut out = String::new();
                let receiving = result.protocol == Protocol::Udp && result.side == Side::Receiver;
                self.column_header(&mut out, receiving);
                for stream in &result.streams {
                    out.push_str(&human_final(stream, receiving));
                    if let Some(peer) = &stream.peer {
                        let id = id_label(stream.stream_id);
                        out.push_str(&format!("[{:>3}] Sent {} datagrams\n", id, stream.datagrams));
                        out.push_str(&format!("[{:>3}] Server Report:\n", id));
                        let secs = peer.elapsed().as_secs_f64();
                        out.push_str(&format!(
                            "[{:>3}] {:4.2}-{:4.2} sec  {}  {}{}\n",
                            id,
                            0.0,
                            secs,
                            format_bytes(peer.bytes),
                            format_bits(bits_per_second(peer.bytes, secs)),
                            datagram_columns(peer.jitter_ms(), peer.lost as i64, peer.datagrams)
                        ));
                        if peer.out_of_order > 0 {
                            out.push_str(&format!(
                                "[{:>3}] {} datagrams received out-of-order\n",
                                id, peer.out_of_order
                            ));
                        }
                    }
                }
                if result.streams.len() > 1 {
                    out.push_str(&human_final(&result.sum, receiving));
                }
                out
            }
        }
    }

    fn column_header(&mut self, out: &mut String, receiving: bool) {
        let columns = if receiving {
            Columns::Datagrams
        } else {
            Columns::Transfer
        };
        if self.columns == Some(columns) {
            return;
        }
        self.columns = Some(columns);
        out.push_str("[ ID] Interval       Transfer     Bandwidth");
        if receiving {
            out.push_str("        Jitter   Lost/Total Datagrams");
        }
        out.push('\n');
    }

    fn render_csv(&self, event: &ReportEvent) -> String {
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        match event {
            ReportEvent::Banner(_) | ReportEvent::Connected(_) => String::new(),
            ReportEvent::Interval(report) => {
                let first = report.streams.first().and_then(|s| s.stream_id);
                report
                    .streams
                    .iter()
                    .chain(report.sum.iter())
                    .map(|s| {
                        let endpoints = self.endpoints(s.stream_id.or(first), s.stream_id.is_none());
                        csv_interval_row(s, &endpoints, &timestamp)
                    })
                    .collect()
            }
            ReportEvent::Final(result) => {
                let first = result.streams.first().and_then(|s| s.stream_id);
                let mut out = String::new();
                for stream in &result.streams {
                    let endpoints = self.endpoints(stream.stream_id, false);
                    out.push_str(&csv_final_row(stream, result.protocol, &endpoints, &timestamp));
                }
                if result.streams.len() > 1 {
                    let endpoints = self.endpoints(first, true);
                    out.push_str(&csv_final_row(&result.sum, result.protocol, &endpoints, &timestamp));
                }
                out
            }
        }
    }

    /// Local and remote endpoint of a row; aggregate rows carry port 0.
    fn endpoints(&self, stream_id: Option<usize>, aggregate: bool) -> CsvEndpoints {
        let conn = stream_id.and_then(|id| self.connections.get(&id));
        let mut endpoints = match conn {
            Some(c) => CsvEndpoints {
                local: c.local.ip().to_string(),
                local_port: c.local.port(),
                remote: c.peer.ip().to_string(),
                remote_port: c.peer.port(),
            },
            None => CsvEndpoints::default(),
        };
        if aggregate {
            endpoints.local_port = 0;
            endpoints.remote_port = 0;
        }
        endpoints
    }
}

/// Address columns of a CSV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvEndpoints {
    pub local: String,
    pub local_port: u16,
    pub remote: String,
    pub remote_port: u16,
}

impl Default for CsvEndpoints {
    fn default() -> Self {
        Self {
            local: "0.0.0.0".to_string(),
            local_port: 0,
            remote: "0.0.0.0".to_string(),
            remote_port: 0,
        }
    }
}

fn human_banner(banner: &Banner) -> String {
    let rule = "-".repeat(60);
    let proto = match banner.protocol {
        Protocol::Tcp => "TCP",
        Protocol::Udp => "UDP",
    };
    let mut out = format!("{}\n", rule);
    match banner.mode {
        Mode::Server => out.push_str(&format!("Server listening on {} port {}\n", proto, banner.port)),
        Mode::Client => {
            out.push_str(&format!(
                "Client connecting to {}, {} port {}\n",
                banner.host, proto, banner.port
            ));
            if banner.protocol == Protocol::Udp {
                out.push_str(&format!("Sending {} byte datagrams\n", banner.buffer_len));
                if let Some(rate) = banner.bandwidth {
                    out.push_str(&format!("Target rate {}\n", format_bits(rate as f64)));
                }
            }
        }
    }
    if let Some(window) = banner.window {
        let label = match banner.protocol {
            Protocol::Tcp => "TCP window size",
            Protocol::Udp => "UDP buffer size",
        };
        out.push_str(&format!("{}: {}\n", label, format_bytes(window as u64)));
    }
    out.push_str(&format!("{}\n", rule));
    out
}

fn id_label(stream_id: Option<usize>) -> String {
    match stream_id {
        Some(id) => id.to_string(),
        None => "SUM".to_string(),
    }
}

fn human_interval(sample: &IntervalSample) -> String {
    let mut line = format!(
        "[{:>3}] {:4.2}-{:4.2} sec  {}  {}",
        id_label(sample.stream_id),
        sample.start,
        sample.end,
        format_bytes(sample.bytes),
        format_bits(sample.bits_per_second)
    );
    if let (Some(jitter), Some(lost), Some(datagrams)) = (sample.jitter_ms, sample.lost, sample.datagrams) {
        line.push_str(&datagram_columns(jitter, lost, datagrams));
    }
    line.push('\n');
    line
}

fn human_final(result: &FinalResult, receiving: bool) -> String {
    let id = id_label(result.stream_id);
    let mut line = format!(
        "[{:>3}] {:4.2}-{:4.2} sec  {}  {}",
        id,
        result.start,
        result.end,
        format_bytes(result.bytes),
        format_bits(result.bits_per_second)
    );
    if receiving {
        line.push_str(&datagram_columns(result.jitter_ms, result.lost as i64, result.datagrams));
    }
    if let StreamStatus::Partial(reason) = &result.status {
        line.push_str(&format!("  (partial: {})", reason));
    }
    line.push('\n');
    if receiving && result.out_of_order > 0 {
        line.push_str(&format!(
            "[{:>3}] {} datagrams received out-of-order\n",
            id, result.out_of_order
        ));
    }
    line
}

fn datagram_columns(jitter_ms: f64, lost: i64, received: u64) -> String {
    let total = received as i64 + lost;
    let percent = if total > 0 {
        lost.max(0) as f64 * 100.0 / total as f64
    } else {
        0.0
    };
    format!("  {:6.3} ms {:4}/{:5} ({:.2}%)", jitter_ms, lost, total, percent)
}

fn bits_per_second(bytes: u64, secs: f64) -> f64 {
    if secs > 0.0 {
        bytes as f64 * 8.0 / secs
    } else {
        0.0
    }
}

fn scaled(value: f64, base: f64, units: &[&str]) -> String {
    let mut value = value;
    let mut unit = 0;
    while value >= base && unit + 1 < units.len() {
        value /= base;
        unit += 1;
    }
    if value < 9.995 {
        format!("{:4.2} {}", value, units[unit])
    } else if value < 99.95 {
        format!("{:4.1} {}", value, units[unit])
    } else {
        format!("{:4.0} {}", value, units[unit])
    }
}

/// Formats a byte count with binary prefixes, iperf style.
///
/// ```
/// use rperf2::report::format_bytes;
///
/// assert_eq!(format_bytes(1_048_576), "1.00 MBytes");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes as f64, 1024.0, &["Bytes", "KBytes", "MBytes", "GBytes", "TBytes"])
}

/// Formats a rate with decimal prefixes, iperf style.
///
/// ```
/// use rperf2::report::format_bits;
///
/// assert_eq!(format_bits(941_000_000.0), " 941 Mbits/sec");
/// ```
pub fn format_bits(bits_per_second: f64) -> String {
    scaled(
        bits_per_second,
        1000.0,
        &["bits/sec", "Kbits/sec", "Mbits/sec", "Gbits/sec", "Tbits/sec"],
    )
}

fn csv_id(stream_id: Option<usize>) -> i64 {
    stream_id.map(|id| id as i64).unwrap_or(CSV_SUM_ID)
}

fn csv_prefix(endpoints: &CsvEndpoints, timestamp: &str, id: i64, start: f64, end: f64) -> String {
    format!(
        "{},{},{},{},{},{},{}-{}",
        timestamp,
        endpoints.local,
        endpoints.local_port,
        endpoints.remote,
        endpoints.remote_port,
        id,
        start,
        end
    )
}

fn csv_interval_row(sample: &IntervalSample, endpoints: &CsvEndpoints, timestamp: &str) -> String {
    let mut row = csv_prefix(endpoints, timestamp, csv_id(sample.stream_id), sample.start, sample.end);
    row.push_str(&format!(",{},{}", sample.bytes, sample.bits_per_second));
    if let (Some(jitter), Some(lost), Some(datagrams)) = (sample.jitter_ms, sample.lost, sample.datagrams) {
        let total = datagrams as i64 + lost;
        let percent = if total > 0 {
            lost.max(0) as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        row.push_str(&format!(
            ",{},{},{},{},{}",
            jitter,
            lost,
            total,
            percent,
            sample.out_of_order.unwrap_or(0)
        ));
    }
    row.push('\n');
    row
}

/// Renders a final result as one iperf2-style CSV row.
///
/// Columns: timestamp, local address, local port, remote address, remote
/// port, stream id (`-1` for the aggregate), `start-end`, bytes, bits per
/// second; UDP rows add jitter (ms), lost, total datagrams, loss percent and
/// out-of-order; every row ends with `complete` or `partial`. Numbers use the
/// shortest representation that parses back to the same value.
pub fn csv_final_row(
    result: &FinalResult,
    protocol: Protocol,
    endpoints: &CsvEndpoints,
    timestamp: &str,
) -> String {
    let mut row = csv_prefix(endpoints, timestamp, csv_id(result.stream_id), result.start, result.end);
    row.push_str(&format!(",{},{}", result.bytes, result.bits_per_second));
    if protocol == Protocol::Udp {
        row.push_str(&format!(
            ",{},{},{},{},{}",
            result.jitter_ms,
            result.lost,
            result.datagrams + result.lost,
            result.loss_percent,
            result.out_of_order
        ));
    }
    let status = if result.is_partial() { "partial" } else { "complete" };
    row.push_str(&format!(",{}\n", status));
    row
}

/// Datagram columns of a parsed CSV row.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvDatagrams {
    pub jitter_ms: f64,
    pub lost: u64,
    pub total: u64,
    pub loss_percent: f64,
    pub out_of_order: u64,
}

/// A final-result row read back from CSV.
#[derive(Debug, Clone, PartialEq)]
pub struct CsvFinalRow {
    pub timestamp: String,
    pub endpoints: CsvEndpoints,
    pub stream_id: i64,
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    pub datagrams: Option<CsvDatagrams>,
    pub partial: bool,
}

/// Parses a row written by [`csv_final_row`].
pub fn parse_csv_final(line: &str) -> Result<CsvFinalRow> {
    let fields: Vec<&str> = line.trim_end().split(',').collect();
    if fields.len() != 10 && fields.len() != 15 {
        return Err(Error::Parse(format!(
            "expected 10 or 15 CSV fields, got {}",
            fields.len()
        )));
    }
    let (start, end) = fields[6]
        .split_once('-')
        .ok_or_else(|| Error::Parse(format!("bad interval '{}'", fields[6])))?;

    let datagrams = if fields.len() == 15 {
        Some(CsvDatagrams {
            jitter_ms: field(fields[9])?,
            lost: field(fields[10])?,
            total: field(fields[11])?,
            loss_percent: field(fields[12])?,
            out_of_order: field(fields[13])?,
        })
    } else {
        None
    };
    let partial = match fields[fields.len() - 1] {
        "complete" => false,
        "partial" => true,
        other => return Err(Error::Parse(format!("bad status '{}'", other))),
    };

    Ok(CsvFinalRow {
        timestamp: fields[0].to_string(),
        endpoints: CsvEndpoints {
            local: fields[1].to_string(),
            local_port: field(fields[2])?,
            remote: fields[3].to_string(),
            remote_port: field(fields[4])?,
        },
        stream_id: field(fields[5])?,
        start: field(start)?,
        end: field(end)?,
        bytes: field(fields[7])?,
        bits_per_second: field(fields[8])?,
        datagrams,
        partial,
    })
}

fn field<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::Parse(format!("bad CSV field '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp_packet::ReceiverReport;

    fn udp_result() -> FinalResult {
        FinalResult {
            stream_id: Some(1),
            start: 0.0,
            end: 10.003517,
            bytes: 1_311_240,
            bits_per_second: 1_048_623.1592271436,
            datagrams: 892,
            lost: 3,
            out_of_order: 1,
            duplicates: 0,
            late: 0,
            malformed: 0,
            jitter_ms: 0.012345678901234567,
            loss_percent: 0.33519553072625696,
            status: StreamStatus::Complete,
            peer: None,
            sender_totals: None,
        }
    }

    #[test]
    fn test_unit_scaling() {
        assert_eq!(format_bytes(512), " 512 Bytes");
        assert_eq!(format_bytes(1536), "1.50 KBytes");
        assert_eq!(format_bytes(50 * 1024 * 1024), "50.0 MBytes");
        assert_eq!(format_bits(1_000_000.0), "1.00 Mbits/sec");
        assert_eq!(format_bits(36_200_000_000.0), "36.2 Gbits/sec");
    }

    #[test]
    fn test_csv_round_trip() {
        let result = udp_result();
        let endpoints = CsvEndpoints {
            local: "::1".to_string(),
            local_port: 5001,
            remote: "::1".to_string(),
            remote_port: 40000,
        };
        let row = csv_final_row(&result, Protocol::Udp, &endpoints, "20260101120000");
        let parsed = parse_csv_final(&row).unwrap();

        assert_eq!(parsed.endpoints, endpoints);
        assert_eq!(parsed.stream_id, 1);
        assert_eq!(parsed.start, result.start);
        assert_eq!(parsed.end, result.end);
        assert_eq!(parsed.bytes, result.bytes);
        assert_eq!(parsed.bits_per_second, result.bits_per_second);
        let d = parsed.datagrams.unwrap();
        assert_eq!(d.jitter_ms, result.jitter_ms);
        assert_eq!(d.lost, result.lost);
        assert_eq!(d.total - d.lost, result.datagrams);
        assert_eq!(d.loss_percent, result.loss_percent);
        assert_eq!(d.out_of_order, result.out_of_order);
        assert!(!parsed.partial);
    }

    #[test]
    fn test_csv_tcp_row_and_sum_id() {
        let mut result = udp_result();
        result.stream_id = None;
        result.status = StreamStatus::Partial("1 of 2 streams incomplete".to_string());
        let row = csv_final_row(&result, Protocol::Tcp, &CsvEndpoints::default(), "20260101120000");
        assert_eq!(row.trim_end().split(',').count(), 10);

        let parsed = parse_csv_final(&row).unwrap();
        assert_eq!(parsed.stream_id, CSV_SUM_ID);
        assert!(parsed.datagrams.is_none());
        assert!(parsed.partial);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_csv_final("a,b,c").is_err());
        assert!(parse_csv_final("1,2,3,4,5,6,0.0-1.0,x,1.0,complete").is_err());
    }

    fn session(protocol: Protocol, side: Side, streams: Vec<FinalResult>) -> SessionResult {
        let mut sum = streams[0].clone();
        sum.stream_id = None;
        SessionResult {
            protocol,
            side,
            partial: false,
            sum,
            streams,
        }
    }

    #[test]
    fn test_human_partial_is_marked() {
        let mut stream = udp_result();
        stream.status = StreamStatus::Partial("connection reset".to_string());
        let mut formatter = Formatter::new(OutputFormat::Human);
        let text = formatter.render(&ReportEvent::Final(session(Protocol::Tcp, Side::Sender, vec![stream])));
        assert!(text.starts_with("[ ID] Interval"));
        assert!(text.contains("(partial: connection reset)"));
    }

    #[test]
    fn test_human_udp_receiver_columns() {
        let mut formatter = Formatter::new(OutputFormat::Human);
        let text = formatter.render(&ReportEvent::Final(session(
            Protocol::Udp,
            Side::Receiver,
            vec![udp_result(), udp_result()],
        )));
        assert!(text.contains("Lost/Total Datagrams"));
        assert!(text.contains("   3/  895"));
        assert!(text.contains("[SUM]"));
        assert!(text.contains("datagrams received out-of-order"));
    }

    #[test]
    fn test_human_sender_prints_server_report() {
        let mut stream = udp_result();
        stream.peer = Some(ReceiverReport {
            bytes: 1_311_240,
            datagrams: 892,
            lost: 0,
            out_of_order: 0,
            duplicates: 0,
            jitter_us: 25,
            elapsed_us: 10_000_000,
        });
        let mut formatter = Formatter::new(OutputFormat::Human);
        let text = formatter.render(&ReportEvent::Final(session(Protocol::Udp, Side::Sender, vec![stream])));
        assert!(text.contains("Server Report:"));
        assert!(text.contains("0.025 ms"));
    }

    #[test]
    fn test_column_header_printed_once() {
        let sample = IntervalSample {
            stream_id: Some(1),
            start: 0.0,
            end: 1.0,
            bytes: 1000,
            bits_per_second: 8000.0,
            datagrams: None,
            lost: None,
            out_of_order: None,
            jitter_ms: None,
        };
        let report = ReportEvent::Interval(IntervalReport {
            streams: vec![sample],
            sum: None,
        });
        let mut formatter = Formatter::new(OutputFormat::Human);
        assert!(formatter.render(&report).contains("[ ID]"));
        assert!(!formatter.render(&report).contains("[ ID]"));
    }

    #[test]
    fn test_json_lines() {
        let mut formatter = Formatter::new(OutputFormat::Json);
        let line = formatter.render(&ReportEvent::Final(session(
            Protocol::Udp,
            Side::Receiver,
            vec![udp_result()],
        )));
        assert!(line.ends_with('\n'));
        let back: ReportEvent = serde_json::from_str(line.trim_end()).unwrap();
        assert!(matches!(back, ReportEvent::Final(_)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_intervals() {
        let (reporter, mut receiver) = Reporter::with_capacity(2);
        let report = IntervalReport {
            streams: Vec::new(),
            sum: None,
        };
        assert!(reporter.interval(report.clone()));
        assert!(reporter.interval(report.clone()));
        assert!(!reporter.interval(report.clone()));
        assert_eq!(reporter.dropped(), 1);

        receiver.recv().await.unwrap();
        assert!(reporter.interval(report));
    }

    #[tokio::test]
    async fn test_reporter_task_writes_until_closed() {
        let (reporter, receiver) = Reporter::new();
        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(run_reporter_task(receiver, OutputFormat::Human, writer));

        reporter
            .send(ReportEvent::Banner(Banner {
                mode: Mode::Server,
                protocol: Protocol::Tcp,
                host: "0.0.0.0".to_string(),
                port: 5001,
                buffer_len: 131072,
                window: None,
                bandwidth: None,
            }))
            .await;
        drop(reporter);
        task.await.unwrap().unwrap();

        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut text)
            .await
            .unwrap();
        assert!(text.contains("Server listening on TCP port 5001"));
    }
}
