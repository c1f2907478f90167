use crate::config::{Config, Mode, Protocol, MAX_PARALLEL, MAX_UDP_DATAGRAM};
use crate::error::ConnectError;
use crate::generator::until;
use crate::measurements::{
    run_interval_timer, MeasurementEngine, SessionResult, Side, StreamCounters, StreamEnd,
    StreamStatus,
};
use crate::protocol::{read_preamble, Message, Preamble, PROTOCOL_VERSION};
use crate::report::{Banner, Connection, ReportEvent, Reporter};
use crate::sink::{run_tcp_sink, run_udp_sink, send_report, DatagramSink, TcpSinkLimits, UdpSinkOutcome};
use crate::transport::{apply_window, OpenHandles, TransportSession};
use crate::udp_packet::{self, Datagram, ReceiverReport};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use socket2::SockRef;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Extra time a TCP stream gets beyond the duration its client announced.
pub const STREAM_GRACE: Duration = Duration::from_secs(3);

/// How long a finished UDP flow keeps answering FIN retries.
pub const FIN_ANSWER_WINDOW: Duration = Duration::from_secs(10);

const FLOW_QUEUE: usize = 1024;

/// Network performance test server.
///
/// Listens for TCP streams or UDP flows and measures what arrives. TCP
/// streams that announce the same session are measured together; each UDP
/// peer endpoint is a session of its own. Sessions from different clients
/// run concurrently.
///
/// # Examples
///
/// ```no_run
/// use rperf2::{Config, Protocol, Server};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(5001)
///     .with_protocol(Protocol::Udp)
///     .with_run_limit(Duration::from_secs(60));
///
/// let server = Server::new(config)?;
/// server.run().await?;
/// for result in server.results() {
///     println!("{} lost of {}", result.sum.lost, result.sum.datagrams + result.sum.lost);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    reporter: Option<Reporter>,
    cancellation_token: CancellationToken,
    handles: OpenHandles,
    results: Arc<Mutex<Vec<SessionResult>>>,
}

struct Shared {
    config: Config,
    reporter: Option<Reporter>,
    handles: OpenHandles,
    results: Arc<Mutex<Vec<SessionResult>>>,
    streams: CancellationToken,
}

struct TcpGroup {
    engine: MeasurementEngine,
    timer: CancellationToken,
    expected: usize,
    joined: usize,
    /// Stream numbers announced by the streams that joined
    indices: Vec<usize>,
}

impl TcpGroup {
    /// Names the announced streams that never connected, if any.
    fn incomplete(&self) -> Option<String> {
        if self.joined >= self.expected {
            return None;
        }
        let missing: Vec<String> = (1..=self.expected)
            .filter(|i| !self.indices.contains(i))
            .map(|i| i.to_string())
            .collect();
        Some(format!(
            "stream(s) {} of {} never connected",
            missing.join(", "),
            self.expected
        ))
    }
}

/// What a stream's handler does once it has ended.
enum Settle {
    /// The session is over; publish it, partial if streams are missing
    Publish(TcpGroup, Option<String>),
    /// Nothing running but streams are still expected; wait, then look again
    Wait(usize),
    /// Another handler owns the session's end
    Busy,
}

type Groups = Arc<Mutex<HashMap<u64, TcpGroup>>>;

enum Flow {
    Active {
        tx: mpsc::Sender<(Vec<u8>, SystemTime)>,
    },
    Finished {
        report: ReceiverReport,
        fin_seq: u64,
        at: Instant,
    },
}

enum FlowAction {
    Nothing,
    Answer(ReceiverReport, u64),
    Start,
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is not a valid server
    /// configuration.
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Server {
            return Err(Error::Config("server requires a server configuration".to_string()));
        }
        config.validate()?;
        Ok(Self {
            config,
            reporter: None,
            cancellation_token: CancellationToken::new(),
            handles: OpenHandles::new(),
            results: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Cancelling stops the server; sessions in progress end as partial.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn open_handles(&self) -> &OpenHandles {
        &self.handles
    }

    /// Final results of every session finished so far.
    pub fn results(&self) -> Vec<SessionResult> {
        self.results.lock().clone()
    }

    /// Serves until cancelled or until the run limit elapses.
    ///
    /// # Errors
    ///
    /// Fails only if the listening socket cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            reporter: self.reporter.clone(),
            handles: self.handles.clone(),
            results: self.results.clone(),
            streams: self.cancellation_token.child_token(),
        });
        if let Some(reporter) = &self.reporter {
            reporter
                .send(ReportEvent::Banner(Banner {
                    mode: Mode::Server,
                    protocol: self.config.protocol,
                    host: self.config.listen_addr(),
                    port: self.config.port,
                    buffer_len: self.config.buffer_len(),
                    window: self.config.window_size,
                    bandwidth: None,
                }))
                .await;
        }

        match self.config.protocol {
            Protocol::Tcp => self.run_tcp(shared).await,
            Protocol::Udp => self.run_udp(shared).await,
        }
    }

    async fn run_tcp(&self, shared: Arc<Shared>) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ConnectError::new(addr.clone(), e))?;
        apply_window(&SockRef::from(&listener), self.config.window_size);
        let _listening = self.handles.acquire();
        info!("listening on {} (TCP)", listener.local_addr()?);

        let groups: Groups = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();
        let mut next_id = 0usize;
        let stop = until(self.config.run_limit.map(|d| Instant::now() + d));
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    info!("server stopping");
                    break;
                }
                _ = &mut stop => {
                    info!("run limit reached");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("stream task failed: {}", e);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        debug!("accepted {} as stream {}", peer, next_id);
                        tasks.spawn(handle_tcp_stream(shared.clone(), groups.clone(), stream, next_id));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }

        shared.streams.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("stream task failed: {}", e);
            }
        }
        let unfinished: Vec<TcpGroup> = groups.lock().drain().map(|(_, g)| g).collect();
        for group in unfinished {
            publish(&shared, &group.engine, &group.timer, group.incomplete()).await;
        }
        Ok(())
    }

    async fn run_udp(&self, shared: Arc<Shared>) -> Result<()> {
        let addr = self.config.listen_addr();
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|e| ConnectError::new(addr.clone(), e))?;
        apply_window(&SockRef::from(&socket), self.config.window_size);
        let _listening = self.handles.acquire();
        let local = socket.local_addr()?;
        info!("listening on {} (UDP)", local);

        let socket = Arc::new(socket);
        let mut flows: HashMap<SocketAddr, Flow> = HashMap::new();
        let mut tasks: JoinSet<(SocketAddr, UdpSinkOutcome)> = JoinSet::new();
        let mut buf = vec![0u8; MAX_UDP_DATAGRAM + 1];
        let mut sweep = time::interval(Duration::from_secs(1));
        let mut next_id = 0usize;
        let stop = until(self.config.run_limit.map(|d| Instant::now() + d));
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    info!("server stopping");
                    break;
                }
                _ = &mut stop => {
                    info!("run limit reached");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((peer, outcome)) => {
                        let fin_seq = outcome
                            .sender_totals
                            .map(|t| t.datagrams.saturating_add(1))
                            .unwrap_or(0);
                        flows.insert(peer, Flow::Finished {
                            report: outcome.report,
                            fin_seq,
                            at: Instant::now(),
                        });
                    }
                    Err(e) => {
                        error!("flow task failed: {}", e);
                        // the flow's queue is gone; let the peer start over
                        flows.retain(|_, flow| match flow {
                            Flow::Active { tx } => !tx.is_closed(),
                            Flow::Finished { .. } => true,
                        });
                    }
                },
                _ = sweep.tick() => {
                    flows.retain(|_, flow| match flow {
                        Flow::Finished { at, .. } => at.elapsed() < FIN_ANSWER_WINDOW,
                        Flow::Active { .. } => true,
                    });
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("receive failed: {}", e);
                            continue;
                        }
                    };
                    let at = SystemTime::now();
                    let datagram = &buf[..n];
                    match classify(&flows, peer, datagram, at) {
                        FlowAction::Nothing => {}
                        FlowAction::Answer(report, fin_seq) => {
                            debug!("repeating report to {}", peer);
                            send_report(&socket, peer, fin_seq, &report).await;
                        }
                        FlowAction::Start => {
                            next_id += 1;
                            let engine = MeasurementEngine::new(Protocol::Udp, Side::Receiver);
                            let counters = match engine.register_stream(next_id) {
                                Ok(c) => c,
                                Err(e) => {
                                    warn!("cannot track flow from {}: {}", peer, e);
                                    continue;
                                }
                            };
                            let (tx, rx) = mpsc::channel(FLOW_QUEUE);
                            if tx.try_send((datagram.to_vec(), at)).is_err() {
                                debug!("first datagram from {} not queued", peer);
                            }
                            flows.insert(peer, Flow::Active { tx });
                            debug!("new flow from {} as stream {}", peer, next_id);
                            tasks.spawn(run_udp_flow(
                                shared.clone(),
                                socket.clone(),
                                local,
                                peer,
                                next_id,
                                engine,
                                counters,
                                rx,
                            ));
                        }
                    }
                }
            }
        }

        shared.streams.cancel();
        flows.clear();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("flow task failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Routes one datagram: forward to a running flow, answer a repeated FIN,
/// or start a new flow.
fn classify(
    flows: &HashMap<SocketAddr, Flow>,
    peer: SocketAddr,
    datagram: &[u8],
    at: SystemTime,
) -> FlowAction {
    match flows.get(&peer) {
        Some(Flow::Active { tx }) => {
            if let Err(e) = tx.try_send((datagram.to_vec(), at)) {
                debug!("datagram from {} dropped: {}", peer, e);
            }
            FlowAction::Nothing
        }
        Some(Flow::Finished { report, fin_seq, .. }) => match udp_packet::parse(datagram) {
            Ok(Datagram::Fin { .. }) => FlowAction::Answer(*report, *fin_seq),
            // same endpoint, new test
            Ok(Datagram::Data { .. }) => FlowAction::Start,
            _ => FlowAction::Nothing,
        },
        None => match udp_packet::parse(datagram) {
            Ok(Datagram::Data { .. }) | Ok(Datagram::Fin { .. }) => FlowAction::Start,
            Ok(Datagram::Report { .. }) => FlowAction::Nothing,
            Err(e) => {
                debug!("ignoring datagram from unknown peer {}: {}", peer, e);
                FlowAction::Nothing
            }
        },
    }
}

async fn handle_tcp_stream(shared: Arc<Shared>, groups: Groups, stream: TcpStream, stream_id: usize) {
    let mut session = match TransportSession::from_tcp(stream, &shared.config, &shared.handles) {
        Ok(session) => session,
        Err(e) => {
            warn!("failed to set up stream {}: {}", stream_id, e);
            return;
        }
    };
    let peer = session.peer_addr();
    let idle = shared.config.idle_timeout;

    let preamble = match session.control_stream() {
        Ok(control) => tokio::select! {
            biased;
            _ = shared.streams.cancelled() => {
                debug!("stream {} from {} closed before it announced itself", stream_id, peer);
                return;
            }
            read = time::timeout(idle, read_preamble(control)) => read,
        },
        Err(e) => {
            warn!("stream {} from {}: {}", stream_id, peer, e);
            return;
        }
    };
    let (key, index, expected, deadline, initial) = match preamble {
        Ok(Ok(Preamble::Control(Message::Hello {
            version,
            session_id,
            stream_index,
            parallel,
            duration_ms,
            ..
        }))) => {
            if version != PROTOCOL_VERSION {
                warn!("{} speaks protocol version {}, expected {}", peer, version, PROTOCOL_VERSION);
            }
            let deadline = duration_ms.map(|ms| Instant::now() + Duration::from_millis(ms) + STREAM_GRACE);
            (session_id, stream_index, parallel.clamp(1, MAX_PARALLEL), deadline, 0)
        }
        Ok(Ok(Preamble::Data(bytes))) => {
            debug!("{} sent no control message", peer);
            (rand::random::<u64>(), 1, 1, None, bytes.len() as u64)
        }
        Ok(Err(e)) => {
            warn!("dropping stream from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!("nothing received from {} within {} ms", peer, idle.as_millis());
            return;
        }
    };

    let (engine, counters) = match join_group(&shared, &groups, key, index, expected, stream_id) {
        Ok(joined) => joined,
        Err(e) => {
            warn!("stream {} from {} rejected: {}", stream_id, peer, e);
            return;
        }
    };
    announce(
        &shared,
        Connection {
            stream_id,
            local: session.local_addr(),
            peer,
        },
    )
    .await;
    counters.add_bytes(initial);

    let limits = TcpSinkLimits {
        deadline,
        idle_timeout: idle,
    };
    let end = run_tcp_sink(
        &mut session,
        &counters,
        shared.config.buffer_len(),
        limits,
        &shared.streams,
    )
    .await;
    session.close();

    if let StreamEnd::Failed(reason) = &end {
        warn!("stream {} from {} failed: {}", stream_id, peer, reason);
    }
    if let Err(e) = engine.finish_stream(stream_id, end) {
        debug!("stream {}: {}", stream_id, e);
    }

    let mut waited = None;
    loop {
        match settle(&groups, key, waited) {
            Settle::Publish(group, incomplete) => {
                publish(&shared, &group.engine, &group.timer, incomplete).await;
                break;
            }
            Settle::Busy => break,
            Settle::Wait(joined) => {
                debug!("session {:x}: {} stream(s) ended, waiting for the rest", key, joined);
                tokio::select! {
                    biased;
                    // shutdown publishes what is left
                    _ = shared.streams.cancelled() => break,
                    _ = time::sleep(idle) => waited = Some(joined),
                }
            }
        }
    }
}

/// Decides whether the session `key` is over once one of its streams ended.
///
/// With every joined stream ended but fewer joined than announced, the
/// session gets one idle timeout for the rest to show up. `waited` is the
/// join count seen when that wait began; any new stream restarts it.
fn settle(groups: &Groups, key: u64, waited: Option<usize>) -> Settle {
    let mut groups = groups.lock();
    let Some(group) = groups.get(&key) else {
        return Settle::Busy;
    };
    if group.engine.active_streams() > 0 {
        return Settle::Busy;
    }
    if group.joined < group.expected && waited != Some(group.joined) {
        return Settle::Wait(group.joined);
    }
    match groups.remove(&key) {
        Some(group) => {
            let incomplete = group.incomplete();
            Settle::Publish(group, incomplete)
        }
        None => Settle::Busy,
    }
}

/// Adds a stream to its session, starting the session on its first stream.
fn join_group(
    shared: &Shared,
    groups: &Groups,
    key: u64,
    index: usize,
    expected: usize,
    stream_id: usize,
) -> Result<(MeasurementEngine, Arc<StreamCounters>)> {
    let mut groups = groups.lock();
    let group = groups.entry(key).or_insert_with(|| TcpGroup {
        engine: MeasurementEngine::new(Protocol::Tcp, Side::Receiver),
        timer: CancellationToken::new(),
        expected,
        joined: 0,
        indices: Vec::new(),
    });
    let counters = group.engine.register_stream(stream_id)?;
    group.joined += 1;
    group.indices.push(index);
    if group.joined == 1 {
        group.engine.start()?;
        spawn_timer(shared, &group.engine, group.timer.clone());
    }
    Ok((group.engine.clone(), counters))
}

#[allow(clippy::too_many_arguments)]
async fn run_udp_flow(
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
    stream_id: usize,
    engine: MeasurementEngine,
    counters: Arc<StreamCounters>,
    rx: mpsc::Receiver<(Vec<u8>, SystemTime)>,
) -> (SocketAddr, UdpSinkOutcome) {
    if let Err(e) = engine.start() {
        debug!("flow {}: {}", stream_id, e);
    }
    let timer = CancellationToken::new();
    spawn_timer(&shared, &engine, timer.clone());
    announce(
        &shared,
        Connection {
            stream_id,
            local,
            peer,
        },
    )
    .await;

    let sink = DatagramSink::new(counters, shared.config.reorder_window);
    let outcome = run_udp_sink(
        sink,
        rx,
        socket,
        peer,
        shared.config.idle_timeout,
        shared.streams.clone(),
    )
    .await;

    if let Some(totals) = outcome.sender_totals {
        if let Err(e) = engine.set_sender_totals(stream_id, totals) {
            debug!("flow {}: {}", stream_id, e);
        }
    }
    if let StreamEnd::Failed(reason) = &outcome.end {
        warn!("flow {} from {} failed: {}", stream_id, peer, reason);
    }
    if let Err(e) = engine.finish_stream(stream_id, outcome.end.clone()) {
        debug!("flow {}: {}", stream_id, e);
    }
    publish(&shared, &engine, &timer, None).await;
    (peer, outcome)
}

fn spawn_timer(shared: &Shared, engine: &MeasurementEngine, cancel: CancellationToken) {
    let reporter = shared.reporter.clone();
    tokio::spawn(run_interval_timer(
        engine.clone(),
        shared.config.interval,
        cancel,
        move |report| {
            if let Some(reporter) = &reporter {
                reporter.interval(report);
            }
        },
    ));
}

/// Queues a connection line unless the server starts stopping first.
async fn announce(shared: &Shared, connection: Connection) {
    if let Some(reporter) = &shared.reporter {
        tokio::select! {
            biased;
            _ = shared.streams.cancelled() => debug!("stream {} not announced", connection.stream_id),
            _ = reporter.send(ReportEvent::Connected(connection)) => {}
        }
    }
}

/// Finalizes a session and hands its result to the reporter.
///
/// `incomplete` marks the session partial even if every stream that joined
/// ended cleanly.
async fn publish(
    shared: &Shared,
    engine: &MeasurementEngine,
    timer: &CancellationToken,
    incomplete: Option<String>,
) {
    timer.cancel();
    match engine.finalize() {
        Ok(mut result) => {
            if let Some(reason) = incomplete {
                warn!("session incomplete: {}", reason);
                result.partial = true;
                result.sum.status = StreamStatus::Partial(reason);
            }
            info!(
                "session finished: {} bytes over {} stream(s){}",
                result.sum.bytes,
                result.streams.len(),
                if result.partial { " (partial)" } else { "" }
            );
            if let Some(reporter) = &shared.reporter {
                reporter.send(ReportEvent::Final(result.clone())).await;
            }
            shared.results.lock().push(result);
        }
        Err(e) => debug!("session not published: {}", e),
    }
}
