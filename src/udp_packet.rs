//! UDP datagram format with sequence numbers and timestamps for loss/jitter measurement.
//!
//! # Datagram Format
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬──────────┬──────────┬──────────────┐
//! │  Magic   │  Flags   │   Sequence   │  Seconds │  Micros  │     Body     │
//! │ (4 bytes)│ (4 bytes)│   (8 bytes)  │ (4 bytes)│ (4 bytes)│  (variable)  │
//! └──────────┴──────────┴──────────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! - **Magic**: 0x52504632 ("RPF2" in ASCII) - identifies rperf2 datagrams
//! - **Flags**: `FIN` marks the end of a stream, `REPORT` marks the receiver's answer
//! - **Sequence**: starts at 1 and increases by one per data datagram (big-endian)
//! - **Seconds/Micros**: sender wall clock at send time
//! - **Body**: zero payload for data, [`SenderTotals`] for FIN, [`ReceiverReport`] for REPORT
//!
//! The sequence number only serves loss and reorder detection on the receiving side.
//!
//! # Examples
//!
//! ```
//! use rperf2::udp_packet::{encode_data, parse, Datagram, DatagramHeader};
//!
//! let mut buf = vec![0u8; 1470];
//! encode_data(&mut buf, 42);
//! match parse(&buf).unwrap() {
//!     Datagram::Data { header, payload_len } => {
//!         assert_eq!(header.sequence, 42);
//!         assert_eq!(payload_len, 1470 - DatagramHeader::SIZE);
//!     }
//!     _ => unreachable!(),
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Magic marker to identify rperf2 UDP datagrams
pub const RPERF2_UDP_MAGIC: u32 = 0x52504632; // "RPF2" in ASCII

/// Last datagram(s) of a stream, carrying the sender's totals.
pub const FLAG_FIN: u32 = 0x1;
/// Receiver's answer to a FIN.
pub const FLAG_REPORT: u32 = 0x2;

/// Fixed header at the front of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub flags: u32,
    pub sequence: u64,
    pub sec: u32,
    pub usec: u32,
}

impl DatagramHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 24;

    pub fn new(flags: u32, sequence: u64, sent_at: SystemTime) -> Self {
        let since_epoch = sent_at.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            flags,
            sequence,
            sec: since_epoch.as_secs() as u32,
            usec: since_epoch.subsec_micros(),
        }
    }

    /// Send time as seconds since the UNIX epoch.
    pub fn sent_secs(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / 1_000_000.0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_report(&self) -> bool {
        self.flags & FLAG_REPORT != 0
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&RPERF2_UDP_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf[16..20].copy_from_slice(&self.sec.to_be_bytes());
        buf[20..24].copy_from_slice(&self.usec.to_be_bytes());
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol(format!(
                "datagram too short: {} bytes",
                bytes.len()
            )));
        }
        let magic = read_u32(bytes, 0);
        if magic != RPERF2_UDP_MAGIC {
            return Err(Error::Protocol(format!("bad magic {:#010x}", magic)));
        }
        Ok(Self {
            flags: read_u32(bytes, 4),
            sequence: read_u64(bytes, 8),
            sec: read_u32(bytes, 16),
            usec: read_u32(bytes, 20),
        })
    }
}

/// Sender's ground truth, carried by FIN datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderTotals {
    pub bytes: u64,
    pub datagrams: u64,
    pub elapsed_us: u64,
}

impl SenderTotals {
    pub const SIZE: usize = 24;

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.bytes.to_be_bytes());
        buf[8..16].copy_from_slice(&self.datagrams.to_be_bytes());
        buf[16..24].copy_from_slice(&self.elapsed_us.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            bytes: read_u64(bytes, 0),
            datagrams: read_u64(bytes, 8),
            elapsed_us: read_u64(bytes, 16),
        }
    }
}

/// Receiver's view of a finished stream, sent back in answer to a FIN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReceiverReport {
    pub bytes: u64,
    pub datagrams: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub jitter_us: u64,
    pub elapsed_us: u64,
}

impl ReceiverReport {
    pub const SIZE: usize = 56;

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_us as f64 / 1000.0
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us)
    }

    fn write_to(&self, buf: &mut [u8]) {
        let fields = [
            self.bytes,
            self.datagrams,
            self.lost,
            self.out_of_order,
            self.duplicates,
            self.jitter_us,
            self.elapsed_us,
        ];
        for (i, v) in fields.iter().enumerate() {
            buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_be_bytes());
        }
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            bytes: read_u64(bytes, 0),
            datagrams: read_u64(bytes, 8),
            lost: read_u64(bytes, 16),
            out_of_order: read_u64(bytes, 24),
            duplicates: read_u64(bytes, 32),
            jitter_us: read_u64(bytes, 40),
            elapsed_us: read_u64(bytes, 48),
        }
    }
}

/// A parsed datagram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Datagram {
    Data {
        header: DatagramHeader,
        payload_len: usize,
    },
    Fin {
        header: DatagramHeader,
        totals: SenderTotals,
    },
    Report {
        header: DatagramHeader,
        report: ReceiverReport,
    },
}

impl Datagram {
    pub fn header(&self) -> &DatagramHeader {
        match self {
            Datagram::Data { header, .. }
            | Datagram::Fin { header, .. }
            | Datagram::Report { header, .. } => header,
        }
    }
}

/// Parses a received datagram. Malformed input is a protocol error.
pub fn parse(bytes: &[u8]) -> Result<Datagram> {
    let header = DatagramHeader::read_from(bytes)?;
    let body = &bytes[DatagramHeader::SIZE..];

    if header.is_report() {
        if body.len() < ReceiverReport::SIZE {
            return Err(Error::Protocol("truncated receiver report".to_string()));
        }
        return Ok(Datagram::Report {
            header,
            report: ReceiverReport::read_from(body),
        });
    }
    if header.is_fin() {
        if body.len() < SenderTotals::SIZE {
            return Err(Error::Protocol("truncated FIN datagram".to_string()));
        }
        let totals = SenderTotals::read_from(body);
        if totals.datagrams.checked_add(1) != Some(header.sequence) {
            return Err(Error::Protocol(format!(
                "FIN sequence {} does not follow {} datagrams",
                header.sequence, totals.datagrams
            )));
        }
        // every datagram carries at least a header
        let floor = totals.datagrams.checked_mul(DatagramHeader::SIZE as u64);
        if floor.map_or(true, |min| totals.bytes < min) {
            return Err(Error::Protocol(format!(
                "FIN claims {} datagrams in {} bytes",
                totals.datagrams, totals.bytes
            )));
        }
        return Ok(Datagram::Fin { header, totals });
    }
    Ok(Datagram::Data {
        header,
        payload_len: body.len(),
    })
}

/// Stamps a data header with the current time into the front of `buf`.
///
/// The rest of `buf` is left untouched and goes out as payload.
pub fn encode_data(buf: &mut [u8], sequence: u64) {
    DatagramHeader::new(0, sequence, SystemTime::now()).write_to(buf);
}

/// Builds a FIN datagram.
pub fn encode_fin(sequence: u64, totals: &SenderTotals) -> Vec<u8> {
    let mut buf = vec![0u8; DatagramHeader::SIZE + SenderTotals::SIZE];
    DatagramHeader::new(FLAG_FIN, sequence, SystemTime::now()).write_to(&mut buf);
    totals.write_to(&mut buf[DatagramHeader::SIZE..]);
    buf
}

/// Builds a REPORT datagram answering a FIN.
pub fn encode_report(sequence: u64, report: &ReceiverReport) -> Vec<u8> {
    let mut buf = vec![0u8; DatagramHeader::SIZE + ReceiverReport::SIZE];
    DatagramHeader::new(FLAG_FIN | FLAG_REPORT, sequence, SystemTime::now()).write_to(&mut buf);
    report.write_to(&mut buf[DatagramHeader::SIZE..]);
    buf
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}
