use crate::config::{Config, Mode, Protocol};
use crate::generator::{exchange_fin, run_generator};
use crate::measurements::{
    run_interval_timer, IntervalReport, MeasurementEngine, SessionResult, Side, StreamEnd,
};
use crate::protocol::{self, Message};
use crate::report::{Banner, Connection, ReportEvent, Reporter};
use crate::transport::{OpenHandles, TransportSession};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Progress event types reported during test execution.
///
/// These events allow monitoring of test progress in real-time through callbacks.
///
/// # Examples
///
/// ```no_run
/// use rperf2::{Client, Config, ProgressEvent};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5001)
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         match event {
///             ProgressEvent::TestStarted => println!("Starting..."),
///             ProgressEvent::IntervalUpdate(report) => {
///                 for sample in &report.streams {
///                     println!("{:.2} Mbps", sample.bits_per_second / 1_000_000.0);
///                 }
///             }
///             ProgressEvent::StreamFailed { stream_id, reason } => {
///                 eprintln!("stream {} failed: {}", stream_id, reason);
///             }
///             ProgressEvent::TestCompleted(result) => {
///                 println!("Transferred {} bytes", result.sum.bytes);
///             }
///         }
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// All streams are connected and traffic is starting.
    TestStarted,
    /// Samples of one report interval, per stream plus the aggregate.
    IntervalUpdate(IntervalReport),
    /// One stream stopped early; its siblings keep running.
    StreamFailed { stream_id: usize, reason: String },
    /// Final results, emitted once after every stream has ended.
    TestCompleted(SessionResult),
}

/// Callback trait for receiving progress events.
///
/// Implemented for any `Fn(ProgressEvent) + Send + Sync`, so closures can be
/// passed directly to [`Client::with_callback`].
///
/// # Examples
///
/// ```
/// use rperf2::{ProgressCallback, ProgressEvent};
///
/// struct MyCallback;
///
/// impl ProgressCallback for MyCallback {
///     fn on_progress(&self, event: ProgressEvent) {
///         // Custom handling
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

/// Simple function-based callback
impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Network performance test client.
///
/// Opens the configured number of parallel streams to the server, drives a
/// traffic generator on each and aggregates their measurements. A failed
/// stream does not stop its siblings; it only marks the result partial.
///
/// # Examples
///
/// ## TCP test with four streams
///
/// ```no_run
/// use rperf2::{Client, Config};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_duration(Duration::from_secs(10))
///     .with_parallel(4);
///
/// let result = Client::new(config)?.run().await?;
/// println!("{:.2} Mbps", result.sum.bits_per_second / 1_000_000.0);
/// # Ok(())
/// # }
/// ```
///
/// ## UDP test at 50 Mbit/s
///
/// ```no_run
/// use rperf2::{Client, Config, Protocol};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5001)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(50_000_000);
///
/// let result = Client::new(config)?.run().await?;
/// if let Some(peer) = &result.streams[0].peer {
///     println!("server saw {} lost, jitter {:.3} ms", peer.lost, peer.jitter_ms());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    callback: Option<CallbackRef>,
    reporter: Option<Reporter>,
    cancellation_token: CancellationToken,
    handles: OpenHandles,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is not a valid client
    /// configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use rperf2::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5001);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Client {
            return Err(Error::Config("client requires a client configuration".to_string()));
        }
        config.validate()?;
        Ok(Self {
            config,
            callback: None,
            reporter: None,
            cancellation_token: CancellationToken::new(),
            handles: OpenHandles::new(),
        })
    }

    /// Attaches a progress callback to receive real-time test updates.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Sends banners, interval reports and final results to `reporter`.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    async fn report(&self, event: ReportEvent) {
        if let Some(reporter) = &self.reporter {
            reporter.send(event).await;
        }
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it stops every stream within one pacing tick; `run` then
    /// returns a partial result.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rperf2::{Client, Config};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = Client::new(Config::client("127.0.0.1".to_string(), 5001))?;
    /// let cancel_token = client.cancellation_token().clone();
    ///
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// let result = client.run().await?;
    /// assert!(result.partial);
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Sockets currently open by this client's streams.
    pub fn open_handles(&self) -> &OpenHandles {
        &self.handles
    }

    /// Runs the test and returns its final results.
    ///
    /// # Errors
    ///
    /// Fails before any traffic is sent if a stream cannot connect or the
    /// control message cannot be delivered. Once traffic flows, stream
    /// failures are reported in the result instead.
    pub async fn run(&self) -> Result<SessionResult> {
        let config = &self.config;
        let target = config.target_addr()?;
        self.report(ReportEvent::Banner(Banner {
            mode: Mode::Client,
            protocol: config.protocol,
            host: config.server_addr.clone().unwrap_or_default(),
            port: config.port,
            buffer_len: config.buffer_len(),
            window: config.window_size,
            bandwidth: config.pacing_rate(),
        }))
        .await;

        let sessions = tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => {
                return Err(Error::State("cancelled before the test started".to_string()));
            }
            opened = self.connect_all() => opened?,
        };
        info!(
            "connected {} {:?} stream(s) to {}",
            sessions.len(),
            config.protocol,
            target
        );

        let engine = MeasurementEngine::new(config.protocol, Side::Sender);
        let mut streams = Vec::with_capacity(sessions.len());
        for (id, session) in sessions {
            self.report(ReportEvent::Connected(Connection {
                stream_id: id,
                local: session.local_addr(),
                peer: session.peer_addr(),
            }))
            .await;
            streams.push((id, session, engine.register_stream(id)?));
        }

        engine.start()?;
        self.notify(ProgressEvent::TestStarted);

        let timer_cancel = CancellationToken::new();
        let timer = {
            let reporter = self.reporter.clone();
            let callback = self.callback.clone();
            tokio::spawn(run_interval_timer(
                engine.clone(),
                config.interval,
                timer_cancel.clone(),
                move |report: IntervalReport| {
                    if let Some(reporter) = &reporter {
                        reporter.interval(report.clone());
                    }
                    if let Some(callback) = &callback {
                        callback.on_progress(ProgressEvent::IntervalUpdate(report));
                    }
                },
            ))
        };

        let shared = Arc::new(config.clone());
        let mut tasks = JoinSet::new();
        for (id, mut session, counters) in streams {
            let config = shared.clone();
            let engine = engine.clone();
            let cancel = self.cancellation_token.child_token();
            tasks.spawn(async move {
                let outcome = run_generator(&mut session, &config, &counters, &cancel).await;
                // stream time stops with the last send, before any report wait
                engine.finish_stream(id, outcome.end.clone())?;
                if outcome.needs_fin(config.protocol) {
                    if let Some(peer) = exchange_fin(&mut session, &outcome, config.fin_burst).await {
                        engine.set_peer_report(id, peer)?;
                    }
                }
                session.close();
                Ok::<_, Error>((id, outcome))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (id, outcome) = match joined {
                Ok(done) => done?,
                Err(e) => {
                    error!("stream task failed: {}", e);
                    continue;
                }
            };
            if let StreamEnd::Failed(reason) = &outcome.end {
                warn!("stream {} failed: {}", id, reason);
                self.notify(ProgressEvent::StreamFailed {
                    stream_id: id,
                    reason: reason.clone(),
                });
            }
            debug!("stream {} sent {:?}", id, outcome.totals);
        }

        timer_cancel.cancel();
        if let Err(e) = timer.await {
            error!("interval timer failed: {}", e);
        }

        let result = engine.finalize()?;
        if result.partial {
            warn!("test ended with a partial result");
        }
        self.report(ReportEvent::Final(result.clone())).await;
        self.notify(ProgressEvent::TestCompleted(result.clone()));
        Ok(result)
    }

    /// Opens every stream and announces it; any failure aborts the test.
    async fn connect_all(&self) -> Result<Vec<(usize, TransportSession)>> {
        let config = &self.config;
        let session_id = rand::random::<u64>();
        let mut sessions = Vec::with_capacity(config.parallel);
        for id in 1..=config.parallel {
            let mut session = TransportSession::open(config, &self.handles).await?;
            if config.protocol == Protocol::Tcp {
                let hello = Message::hello(session_id, id, config.parallel, config.limit);
                protocol::write_control(session.control_stream()?, &hello).await?;
            }
            debug!(
                "stream {} open: {} -> {}",
                id,
                session.local_addr(),
                session.peer_addr()
            );
            sessions.push((id, session));
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_client_requires_valid_config() {
        assert!(matches!(
            Client::new(Config::server(5001)),
            Err(Error::Config(_))
        ));
        let tcp_with_rate = Config::client("127.0.0.1".to_string(), 5001).with_bandwidth(1_000);
        assert!(matches!(Client::new(tcp_with_rate), Err(Error::Config(_))));
        assert!(Client::new(Config::client("127.0.0.1".to_string(), 5001)).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        // a non-routable address keeps connect pending until cancelled
        let config = Config::client("10.255.255.1".to_string(), 5001)
            .with_connect_timeout(Duration::from_secs(30));
        let client = Client::new(config).unwrap();
        client.cancellation_token().cancel();

        assert!(matches!(client.run().await, Err(Error::State(_))));
        assert_eq!(client.open_handles().count(), 0);
    }
}
