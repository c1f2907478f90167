//! rperf2 - network throughput testing in the style of iperf2
//!
//! A client drives one or more TCP or UDP streams at a server for a fixed
//! time or byte count. Both ends measure what moved: bytes and throughput
//! per interval, and for UDP datagram loss, reordering, duplicates and
//! RFC 1889 jitter. Results are reported as human-readable text, iperf2
//! style CSV or JSON.
//!
//! # Features
//!
//! - TCP and UDP tests with parallel streams
//! - Time or byte limited tests
//! - Rate-paced UDP senders
//! - Periodic interval reports and a final summary per session
//! - A server that measures many client sessions at once
//! - Cancellation that always releases every socket
//!
//! # Example
//!
//! ```no_run
//! use rperf2::{Client, Config};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> rperf2::Result<()> {
//! let config = Config::client("127.0.0.1".to_string(), 5001)
//!     .with_duration(Duration::from_secs(5));
//! let result = Client::new(config)?.run().await?;
//! println!("{:.1} Mbit/s", result.sum.bits_per_second / 1e6);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod generator;
pub mod measurements;
pub mod protocol;
pub mod report;
pub mod server;
pub mod sink;
pub mod token_bucket;
pub mod transport;
pub mod udp_packet;

pub use client::{Client, ProgressCallback, ProgressEvent};
pub use config::{Config, Mode, OutputFormat, Protocol, TestLimit};
pub use error::{Error, Result};
pub use measurements::{FinalResult, IntervalReport, MeasurementEngine, SessionResult};
pub use report::{ReportEvent, Reporter};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
