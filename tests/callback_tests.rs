use rperf2::report::{run_reporter_task, ReportEvent, Reporter};
use rperf2::{Client, Config, OutputFormat, ProgressCallback, ProgressEvent, Protocol, Server};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn spawn_server(protocol: Protocol) -> (Arc<Server>, JoinHandle<rperf2::Result<()>>, u16) {
    let port = match protocol {
        Protocol::Tcp => TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port(),
        Protocol::Udp => UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port(),
    };
    let mut config = Config::server(port).with_protocol(protocol);
    config.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let server = Arc::new(Server::new(config).unwrap());
    let running = server.clone();
    let handle = tokio::spawn(async move { running.run().await });

    // Give server time to start
    sleep(Duration::from_millis(100)).await;
    (server, handle, port)
}

#[tokio::test]
async fn test_custom_callback_struct() {
    let (server, handle, port) = spawn_server(Protocol::Tcp).await;

    let callback = TestCallback::new();
    let events_ref = callback.events.clone();

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_millis(1000))
        .with_interval(Duration::from_millis(200));
    let client = Client::new(client_config).unwrap().with_callback(callback);
    client.run().await.unwrap();

    let events = events_ref.lock().unwrap();
    assert!(matches!(events.first(), Some(ProgressEvent::TestStarted)));
    assert!(matches!(events.last(), Some(ProgressEvent::TestCompleted(_))));

    let intervals: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::IntervalUpdate(report) => Some(report),
            _ => None,
        })
        .collect();
    assert!(intervals.len() >= 3, "got {} interval updates", intervals.len());

    // intervals are contiguous and in time order
    for pair in intervals.windows(2) {
        if let (Some(a), Some(b)) = (pair[0].streams.first(), pair[1].streams.first()) {
            assert!((a.end - b.start).abs() < 1e-9);
            assert!(b.end > a.end);
        }
    }
    // one stream: no aggregate line
    assert!(intervals.iter().all(|r| r.sum.is_none()));

    server.cancellation_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closure_callback_parallel_sum() {
    let (server, handle, port) = spawn_server(Protocol::Tcp).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_millis(600))
        .with_interval(Duration::from_millis(200))
        .with_parallel(2);
    let client = Client::new(client_config)
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            events_clone.lock().unwrap().push(event);
        });
    let result = client.run().await.unwrap();

    let captured = events.lock().unwrap();
    for event in captured.iter() {
        if let ProgressEvent::IntervalUpdate(report) = event {
            if report.streams.len() < 2 {
                continue;
            }
            let sum = report.sum.as_ref().expect("aggregate with two streams");
            let bytes: u64 = report.streams.iter().map(|s| s.bytes).sum();
            assert_eq!(sum.bytes, bytes);
        }
    }
    match captured.last() {
        Some(ProgressEvent::TestCompleted(done)) => assert_eq!(done, &result),
        other => panic!("last event was {:?}", other),
    }

    server.cancellation_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_udp_interval_carries_datagrams() {
    let (server, handle, port) = spawn_server(Protocol::Udp).await;

    let datagrams = Arc::new(Mutex::new(0u64));
    let seen = datagrams.clone();
    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_protocol(Protocol::Udp)
        .with_bandwidth(1_000_000)
        .with_duration(Duration::from_millis(600))
        .with_interval(Duration::from_millis(200));
    let client = Client::new(client_config)
        .unwrap()
        .with_callback(move |event: ProgressEvent| {
            if let ProgressEvent::IntervalUpdate(report) = event {
                for sample in &report.streams {
                    // sender side: counts but no loss or jitter
                    assert!(sample.lost.is_none());
                    assert!(sample.jitter_ms.is_none());
                    *seen.lock().unwrap() += sample.datagrams.unwrap_or(0);
                }
            }
        });
    let result = client.run().await.unwrap();

    let counted = *datagrams.lock().unwrap();
    assert!(counted > 0);
    assert!(counted <= result.sum.datagrams);

    server.cancellation_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reporter_receives_session_events() {
    let (server, handle, port) = spawn_server(Protocol::Tcp).await;

    let (reporter, mut receiver) = Reporter::new();
    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_bytes(200_000)
        .with_interval(Duration::from_millis(100));
    let client = Client::new(client_config).unwrap().with_reporter(reporter);
    client.run().await.unwrap();
    drop(client);

    let mut kinds = Vec::new();
    while let Some(event) = receiver.recv().await {
        kinds.push(match event {
            ReportEvent::Banner(_) => "banner",
            ReportEvent::Connected(_) => "connected",
            ReportEvent::Interval(_) => "interval",
            ReportEvent::Final(_) => "final",
        });
    }
    assert_eq!(kinds.first(), Some(&"banner"));
    assert_eq!(kinds.get(1), Some(&"connected"));
    assert_eq!(kinds.last(), Some(&"final"));

    server.cancellation_token().cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_json_output_one_object_per_line() {
    let (server, handle, port) = spawn_server(Protocol::Tcp).await;

    let (reporter, receiver) = Reporter::new();
    let (writer, mut reader) = tokio::io::duplex(1 << 20);
    let output = tokio::spawn(run_reporter_task(receiver, OutputFormat::Json, writer));

    let client_config = Config::client("127.0.0.1".to_string(), port)
        .with_bytes(100_000)
        .with_format(OutputFormat::Json);
    let client = Client::new(client_config).unwrap().with_reporter(reporter);
    client.run().await.unwrap();
    drop(client);
    output.await.unwrap().unwrap();

    let mut text = String::new();
    tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut text)
        .await
        .unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines.len() >= 3);
    for line in &lines {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value.get("event").is_some());
    }
    let last: ReportEvent = serde_json::from_str(lines[lines.len() - 1]).unwrap();
    assert!(matches!(last, ReportEvent::Final(_)));

    server.cancellation_token().cancel();
    handle.await.unwrap().unwrap();
}

#[test]
fn test_callback_trait_implementation() {
    fn assert_callback<C: ProgressCallback>(_: &C) {}

    assert_callback(&|event: ProgressEvent| println!("Event: {:?}", event));
    assert_callback(&TestCallback::new());
}
