use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Default port, matching iperf2.
pub const DEFAULT_PORT: u16 = 5001;

/// Default TCP read/write length.
pub const DEFAULT_TCP_BUFFER: usize = 128 * 1024;

/// Default UDP datagram length (fits a 1500-byte MTU with IP/UDP headers).
pub const DEFAULT_UDP_BUFFER: usize = 1470;

/// Default UDP send rate in bits per second when no bandwidth is given.
pub const DEFAULT_UDP_BANDWIDTH: u64 = 1_000_000;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_DATAGRAM: usize = 65_507;

/// Shortest report interval that still allows a 1 ms pacing tick at 1/50th of it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(50);

pub const MAX_PARALLEL: usize = 128;

/// Transport protocol type for network testing.
///
/// # Examples
///
/// ```
/// use rperf2::{Config, Protocol};
///
/// let udp_config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(10_000_000); // 10 Mbps
/// assert_eq!(udp_config.protocol, Protocol::Udp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Continuous byte stream, no framing
    Tcp,
    /// Discrete datagrams carrying a sequence header
    Udp,
}

/// Test mode: client or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Listens and measures incoming traffic
    Server,
    /// Connects and generates traffic
    Client,
}

/// When a traffic generator stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestLimit {
    /// Stop after this much wall-clock time
    Time(Duration),
    /// Stop after this many payload bytes per stream
    Bytes(u64),
}

impl TestLimit {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            TestLimit::Time(d) => Some(*d),
            TestLimit::Bytes(_) => None,
        }
    }

    pub fn bytes(&self) -> Option<u64> {
        match self {
            TestLimit::Time(_) => None,
            TestLimit::Bytes(b) => Some(*b),
        }
    }
}

/// How results are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// iperf-style tabular text
    Human,
    /// One comma-separated row per report (iperf2 `-y C`)
    Csv,
    /// One JSON object per line
    Json,
}

/// Configuration for rperf2 client and server sessions.
///
/// Use the builder methods to customise it; a session clones the configuration
/// when it starts and never mutates it afterwards.
///
/// # Examples
///
/// ## TCP client, four parallel streams
///
/// ```
/// use rperf2::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_duration(Duration::from_secs(30))
///     .with_parallel(4);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## UDP client sending 2 MB
///
/// ```
/// use rperf2::{Config, Protocol};
///
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_bytes(2_000_000)
///     .with_bandwidth(50_000_000);
/// assert_eq!(config.buffer_len(), 1470);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server mode or client mode
    pub mode: Mode,

    /// Protocol to use (TCP or UDP)
    pub protocol: Protocol,

    /// Port to listen on or connect to
    pub port: u16,

    /// Server address (client mode)
    pub server_addr: Option<String>,

    /// Bind address (server mode)
    pub bind_addr: Option<IpAddr>,

    /// Time or byte limit of each stream
    pub limit: TestLimit,

    /// Target send rate in bits per second (UDP only)
    pub bandwidth: Option<u64>,

    /// Read/write length in bytes; protocol default when unset
    pub buffer_size: Option<usize>,

    /// Socket send/receive buffer size (TCP window)
    pub window_size: Option<usize>,

    /// Number of parallel streams
    pub parallel: usize,

    /// Output format for reports
    pub format: OutputFormat,

    /// Interval between periodic reports
    pub interval: Duration,

    /// Disable Nagle's algorithm on TCP streams
    pub no_delay: bool,

    /// How far behind the highest sequence a late datagram may retract a loss
    pub reorder_window: u32,

    /// Number of FIN datagrams sent (and report waits) at the end of a UDP stream
    pub fin_burst: u32,

    /// Connect timeout for each stream
    pub connect_timeout: Duration,

    /// Server: end a stream that has been silent for this long
    pub idle_timeout: Duration,

    /// Server: stop listening after this long
    pub run_limit: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            limit: TestLimit::Time(Duration::from_secs(10)),
            bandwidth: None,
            buffer_size: None,
            window_size: None,
            parallel: 1,
            format: OutputFormat::Human,
            interval: Duration::from_secs(1),
            no_delay: false,
            reorder_window: 3,
            fin_burst: 10,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(10),
            run_limit: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values (TCP client).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server configuration listening on `port`.
    ///
    /// ```
    /// use rperf2::Config;
    ///
    /// let config = Config::server(5001);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a client configuration targeting `server_addr:port`.
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Limits each stream to a wall-clock duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.limit = TestLimit::Time(duration);
        self
    }

    /// Limits each stream to a number of payload bytes.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.limit = TestLimit::Bytes(bytes);
        self
    }

    /// Sets the UDP send rate in bits per second.
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = Some(size);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_reorder_window(mut self, window: u32) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn with_fin_burst(mut self, burst: u32) -> Self {
        self.fin_burst = burst;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Stops a server after `limit` has elapsed.
    pub fn with_run_limit(mut self, limit: Duration) -> Self {
        self.run_limit = Some(limit);
        self
    }

    /// Read/write length actually used, falling back to the protocol default.
    pub fn buffer_len(&self) -> usize {
        self.buffer_size.unwrap_or(match self.protocol {
            Protocol::Tcp => DEFAULT_TCP_BUFFER,
            Protocol::Udp => DEFAULT_UDP_BUFFER,
        })
    }

    /// Send rate in bits per second the generator paces to; `None` means unbounded.
    pub fn pacing_rate(&self) -> Option<u64> {
        match self.protocol {
            Protocol::Tcp => None,
            Protocol::Udp => Some(self.bandwidth.unwrap_or(DEFAULT_UDP_BANDWIDTH)),
        }
    }

    /// Pacing timer resolution: 1/50th of the report interval, never below 1 ms.
    pub fn pacing_tick(&self) -> Duration {
        (self.interval / 50).max(Duration::from_millis(1))
    }

    /// `host:port` the client connects to.
    pub fn target_addr(&self) -> Result<String> {
        let host = self
            .server_addr
            .as_ref()
            .ok_or_else(|| Error::Config("Server address is required for client mode".to_string()))?;
        if host.contains(':') && !host.starts_with('[') {
            // bare IPv6 literal
            Ok(format!("[{}]:{}", host, self.port))
        } else {
            Ok(format!("{}:{}", host, self.port))
        }
    }

    /// `ip:port` the server binds to.
    pub fn listen_addr(&self) -> String {
        match self.bind_addr {
            Some(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            Some(IpAddr::V4(ip)) => format!("{}:{}", ip, self.port),
            None => format!("0.0.0.0:{}", self.port),
        }
    }

    /// Rejects option combinations before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Client && self.server_addr.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }
        if self.parallel == 0 || self.parallel > MAX_PARALLEL {
            return Err(Error::Config(format!(
                "parallel streams must be between 1 and {}, got {}",
                MAX_PARALLEL, self.parallel
            )));
        }
        match self.limit {
            TestLimit::Time(d) if d.is_zero() => {
                return Err(Error::Config("test duration must be positive".to_string()))
            }
            TestLimit::Bytes(0) => {
                return Err(Error::Config("byte limit must be positive".to_string()))
            }
            _ => {}
        }
        if self.interval < MIN_INTERVAL {
            return Err(Error::Config(format!(
                "report interval must be at least {} ms",
                MIN_INTERVAL.as_millis()
            )));
        }
        if self.protocol == Protocol::Tcp && self.bandwidth.is_some() {
            return Err(Error::Config(
                "bandwidth cap only applies to UDP tests".to_string(),
            ));
        }
        // pacing works in whole bytes per second
        if matches!(self.bandwidth, Some(rate) if rate < 8) {
            return Err(Error::Config(
                "bandwidth must be at least 8 bits per second".to_string(),
            ));
        }
        let len = self.buffer_len();
        if len == 0 {
            return Err(Error::Config("buffer length must be positive".to_string()));
        }
        if self.protocol == Protocol::Udp {
            let min = crate::udp_packet::DatagramHeader::SIZE;
            if len < min || len > MAX_UDP_DATAGRAM {
                return Err(Error::Config(format!(
                    "UDP buffer length must be between {} and {} bytes, got {}",
                    min, MAX_UDP_DATAGRAM, len
                )));
            }
        }
        if self.reorder_window == 0 || self.reorder_window > 64 {
            return Err(Error::Config(
                "reorder window must be between 1 and 64".to_string(),
            ));
        }
        if self.fin_burst == 0 {
            return Err(Error::Config("FIN burst must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parses a rate in bits per second with an optional `k`/`m`/`g` suffix (powers of 1000).
///
/// ```
/// use rperf2::config::parse_rate;
///
/// assert_eq!(parse_rate("100M").unwrap(), 100_000_000);
/// assert_eq!(parse_rate("1.5k").unwrap(), 1_500);
/// ```
pub fn parse_rate(s: &str) -> Result<u64> {
    parse_with_suffix(s, 1000)
}

/// Parses a size in bytes with an optional `K`/`M`/`G` suffix (powers of 1024).
///
/// ```
/// use rperf2::config::parse_size;
///
/// assert_eq!(parse_size("128K").unwrap(), 131_072);
/// assert_eq!(parse_size("1470").unwrap(), 1470);
/// ```
pub fn parse_size(s: &str) -> Result<u64> {
    parse_with_suffix(s, 1024)
}

fn parse_with_suffix(s: &str, base: u64) -> Result<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], base),
        Some('m') | Some('M') => (&s[..s.len() - 1], base * base),
        Some('g') | Some('G') => (&s[..s.len() - 1], base * base * base),
        _ => (s, 1),
    };
    let value: f64 = digits
        .parse()
        .map_err(|_| Error::Parse(format!("invalid number '{}'", s)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Parse(format!("invalid number '{}'", s)));
    }
    Ok((value * multiplier as f64).round() as u64)
}
