//! End-to-end tests: clients through the listener to real loopback backends

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relaylb::error::SessionError;
use relaylb::proxy::{
    BackendAddress, BackendRegistry, ConnectionSelector, ProxyContext, ProxySession, SessionOptions,
};
use relaylb::server::Listener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;

struct TestBackend {
    addr: SocketAddr,
    connections: Arc<AtomicU64>,
}

impl TestBackend {
    fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Echoes everything back and closes after the client's EOF.
async fn spawn_echo_backend() -> TestBackend {
    spawn_backend(|mut stream| async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
    .await
}

async fn spawn_backend<F, Fut>(handler: F) -> TestBackend
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(stream));
        }
    });

    TestBackend { addr, connections }
}

/// Address that refuses connections
async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Listener whose accept queue is full, so new handshakes never complete
struct StalledBackend {
    addr: SocketAddr,
    _listener: TcpListener,
    _fillers: Vec<TcpStream>,
}

async fn spawn_stalled_backend() -> StalledBackend {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    // Never accepted; once the queue is full further connects hang
    let mut fillers = Vec::new();
    for _ in 0..32 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => fillers.push(stream),
            _ => break,
        }
    }

    StalledBackend {
        addr,
        _listener: listener,
        _fillers: fillers,
    }
}

fn registry_for(backends: &[SocketAddr]) -> BackendRegistry {
    BackendRegistry::new(
        backends
            .iter()
            .map(|a| BackendAddress::new(a.ip().to_string(), a.port()))
            .collect(),
    )
    .unwrap()
}

/// Connected pair: the accepted side plays the proxy's client stream
async fn client_pair() -> (TcpStream, TcpStream, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let outside = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (inside, peer) = listener.accept().await.unwrap();
    (outside, inside, peer)
}

/// Writes until the peer's reset surfaces, which only happens once the
/// proxy side of the socket is fully closed rather than half-closed.
async fn assert_fully_closed(stream: &mut TcpStream) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if stream.write_all(b"late").await.is_err() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("proxy still holds the client socket open");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn spawn_proxy(backends: &[SocketAddr], options: SessionOptions) -> (SocketAddr, Arc<ConnectionSelector>) {
    let registry = registry_for(backends);

    let listener = Listener::bind("127.0.0.1:0", ProxyContext::new(registry, options))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let selector = Arc::clone(&listener.context().selector);

    tokio::spawn(async move { listener.run().await });

    (addr, selector)
}

async fn wait_for_counts(selector: &ConnectionSelector, expected: &[usize]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if selector.snapshot() == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("counts {:?}, expected {:?}", selector.snapshot(), expected);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn echo_roundtrip(stream: &mut TcpStream, msg: &[u8]) {
    stream.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, msg);
}

#[tokio::test]
async fn test_relay_is_byte_exact_both_ways() {
    let backend = spawn_echo_backend().await;
    let (proxy, selector) = spawn_proxy(&[backend.addr], SessionOptions::default()).await;

    let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 253) as u8).collect();
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut rd, mut wr) = stream.into_split();

    let to_send = data.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&to_send).await.unwrap();
        wr.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    rd.read_to_end(&mut received).await.unwrap();
    writer.await.unwrap();

    assert_eq!(received.len(), data.len());
    assert!(received == data, "relayed bytes differ");
    wait_for_counts(&selector, &[0]).await;
}

#[tokio::test]
async fn test_half_close_lets_backend_answer() {
    // Reads the whole request, then answers with its length
    let backend = spawn_backend(|mut stream| async move {
        let mut request = Vec::new();
        if stream.read_to_end(&mut request).await.is_ok() {
            let reply = format!("received {} bytes", request.len());
            let _ = stream.write_all(reply.as_bytes()).await;
        }
    })
    .await;
    let (proxy, selector) = spawn_proxy(&[backend.addr], SessionOptions::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[7u8; 20_000]).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();

    assert_eq!(reply, "received 20000 bytes");
    wait_for_counts(&selector, &[0]).await;
}

#[tokio::test]
async fn test_tie_break_assignment() {
    let a = spawn_echo_backend().await;
    let b = spawn_echo_backend().await;
    let (proxy, selector) = spawn_proxy(&[a.addr, b.addr], SessionOptions::default()).await;

    let mut c1 = TcpStream::connect(proxy).await.unwrap();
    echo_roundtrip(&mut c1, b"one").await;
    assert_eq!(selector.snapshot(), vec![1, 0]);

    let mut c2 = TcpStream::connect(proxy).await.unwrap();
    echo_roundtrip(&mut c2, b"two").await;
    assert_eq!(selector.snapshot(), vec![1, 1]);

    let mut c3 = TcpStream::connect(proxy).await.unwrap();
    echo_roundtrip(&mut c3, b"three").await;
    assert_eq!(selector.snapshot(), vec![2, 1]);

    assert_eq!(a.connection_count(), 2);
    assert_eq!(b.connection_count(), 1);

    drop(c2);
    wait_for_counts(&selector, &[2, 0]).await;

    // B is now least loaded
    let mut c4 = TcpStream::connect(proxy).await.unwrap();
    echo_roundtrip(&mut c4, b"four").await;
    assert_eq!(selector.snapshot(), vec![2, 1]);
    assert_eq!(b.connection_count(), 2);

    drop(c1);
    drop(c3);
    drop(c4);
    wait_for_counts(&selector, &[0, 0]).await;
}

#[tokio::test]
async fn test_dial_failure_closes_client_and_releases() {
    let dead = unreachable_addr().await;
    let (proxy, selector) = spawn_proxy(&[dead], SessionOptions::default()).await;

    for _ in 0..3 {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        let mut buf = [0u8; 16];
        let read = stream.read(&mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)), "client stream should be closed");
        wait_for_counts(&selector, &[0]).await;
        assert_fully_closed(&mut stream).await;
    }
}

/// Collects formatted log output in memory
#[derive(Clone, Default)]
struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_selected_backend_logs_counter_table() {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dead = unreachable_addr().await;
    let ctx = ProxyContext::new(registry_for(&[dead]), SessionOptions::default());
    let (_outside, inside, peer) = client_pair().await;
    ProxySession::new(3, peer, inside, ctx).run().await;

    let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    let selected = output
        .lines()
        .find(|line| line.contains("Selected backend"))
        .unwrap_or_else(|| panic!("no selection event in {output}"));
    assert!(selected.contains("counts=[1]"), "{selected}");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dial_timeout_closes_client_and_releases() {
    let stalled = spawn_stalled_backend().await;
    let limit = Duration::from_millis(300);
    let options = SessionOptions {
        connect_timeout: Some(limit),
        idle_timeout: None,
    };
    let (proxy, selector) = spawn_proxy(&[stalled.addr], options).await;

    let started = tokio::time::Instant::now();
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("client should be closed once the dial times out");
    let waited = started.elapsed();

    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(waited >= limit - Duration::from_millis(50), "closed after {waited:?}");
    assert!(waited < limit + Duration::from_secs(2), "closed after {waited:?}");
    wait_for_counts(&selector, &[0]).await;
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dial_timeout_is_reported_as_timed_out() {
    let stalled = spawn_stalled_backend().await;
    let options = SessionOptions {
        connect_timeout: Some(Duration::from_millis(200)),
        idle_timeout: None,
    };
    let ctx = ProxyContext::new(registry_for(&[stalled.addr]), options);
    let selector = Arc::clone(&ctx.selector);

    let (_outside, inside, peer) = client_pair().await;
    let report = ProxySession::new(1, peer, inside, ctx).run().await;

    match report.error {
        Some(SessionError::BackendUnavailable { source, .. }) => {
            assert_eq!(source.kind(), std::io::ErrorKind::TimedOut);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(selector.snapshot(), vec![0]);
}

#[tokio::test]
async fn test_dial_failure_is_contained_to_its_session() {
    let live = spawn_echo_backend().await;
    let dead = unreachable_addr().await;
    let (proxy, selector) = spawn_proxy(&[live.addr, dead], SessionOptions::default()).await;

    let mut held = TcpStream::connect(proxy).await.unwrap();
    echo_roundtrip(&mut held, b"hold").await;
    assert_eq!(selector.snapshot(), vec![1, 0]);

    // Index 1 is least loaded but unreachable; no retry against index 0
    for _ in 0..2 {
        let mut doomed = TcpStream::connect(proxy).await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(doomed.read(&mut buf).await, Ok(0) | Err(_)));
        wait_for_counts(&selector, &[1, 0]).await;
    }
    assert_eq!(live.connection_count(), 1);

    // The held session is untouched
    echo_roundtrip(&mut held, b"still here").await;

    drop(held);
    wait_for_counts(&selector, &[0, 0]).await;
}

#[tokio::test]
async fn test_abrupt_client_disconnect_releases_slot() {
    // Streams data forever without reading
    let backend = spawn_backend(|mut stream| async move {
        let chunk = vec![b'x'; 16 * 1024];
        while stream.write_all(&chunk).await.is_ok() {}
    })
    .await;
    let (proxy, selector) = spawn_proxy(&[backend.addr], SessionOptions::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut buf = [0u8; 1024];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(selector.snapshot(), vec![1]);

    drop(stream);
    wait_for_counts(&selector, &[0]).await;
}

#[tokio::test]
async fn test_idle_timeout_ends_session() {
    // Accepts and then stays silent
    let backend = spawn_backend(|stream| async move {
        let _hold = stream;
        tokio::time::sleep(Duration::from_secs(30)).await;
    })
    .await;
    let options = SessionOptions {
        connect_timeout: None,
        idle_timeout: Some(Duration::from_millis(300)),
    };
    let (proxy, selector) = spawn_proxy(&[backend.addr], options).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    wait_for_counts(&selector, &[1]).await;

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("session should close on idle timeout");
    assert!(matches!(read, Ok(0) | Err(_)));
    wait_for_counts(&selector, &[0]).await;
}

#[tokio::test]
async fn test_one_way_stream_outlives_idle_timeout() {
    // Trickles 4 bytes every 50 ms for a second and never reads
    let backend = spawn_backend(|mut stream| async move {
        for _ in 0..20 {
            if stream.write_all(b"tick").await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    let options = SessionOptions {
        connect_timeout: None,
        idle_timeout: Some(Duration::from_millis(300)),
    };
    let (proxy, selector) = spawn_proxy(&[backend.addr], options).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received.len(), 80);
    assert!(received.chunks(4).all(|c| c == b"tick"));

    // Client EOF ends the remaining direction
    drop(stream);
    wait_for_counts(&selector, &[0]).await;
}

#[tokio::test]
async fn test_idle_timeout_is_reported() {
    let backend = spawn_backend(|stream| async move {
        let _hold = stream;
        tokio::time::sleep(Duration::from_secs(30)).await;
    })
    .await;
    let limit = Duration::from_millis(200);
    let options = SessionOptions {
        connect_timeout: None,
        idle_timeout: Some(limit),
    };
    let ctx = ProxyContext::new(registry_for(&[backend.addr]), options);

    let (_outside, inside, peer) = client_pair().await;
    let report = ProxySession::new(7, peer, inside, ctx).run().await;

    assert!(
        matches!(report.error, Some(SessionError::IdleTimeout { idle }) if idle == limit),
        "unexpected outcome {:?}",
        report.error
    );
}

#[tokio::test]
async fn test_listener_survives_many_sessions() {
    let backend = spawn_echo_backend().await;
    let (proxy, selector) = spawn_proxy(&[backend.addr], SessionOptions::default()).await;

    let clients: Vec<_> = (0..20)
        .map(|i| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(proxy).await.unwrap();
                let msg = format!("client {i}");
                echo_roundtrip(&mut stream, msg.as_bytes()).await;
            })
        })
        .collect();

    for client in clients {
        client.await.unwrap();
    }

    wait_for_counts(&selector, &[0]).await;
    assert_eq!(backend.connection_count(), 20);
}

#[tokio::test]
async fn test_listener_stops_on_shutdown() {
    let backend = spawn_echo_backend().await;
    let registry = BackendRegistry::new(vec![BackendAddress::new("127.0.0.1", backend.addr.port())]).unwrap();
    let listener = Listener::bind("127.0.0.1:0", ProxyContext::new(registry, SessionOptions::default()))
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        listener
            .run_until(async {
                let _ = rx.await;
            })
            .await
    });

    tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
