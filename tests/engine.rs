//! End-to-end tests: a real engine on a background thread, real sockets.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;
use tidekv::connection::{ConnectionEngine, EngineConfig, EngineError, ShutdownHandle};
use tidekv::pool::DisposalPool;
use tidekv::protocol::{encode_request, err_code, read_response, WireValue, MAX_MSG};
use tidekv::storage::HashIndex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), EngineError>>>,
}

impl TestServer {
    fn start(config: EngineConfig) -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let engine = ConnectionEngine::new(
            listener,
            HashIndex::new(),
            DisposalPool::new(2).unwrap(),
            config,
        )
        .unwrap();
        let addr = engine.local_addr().unwrap();
        let shutdown = engine.shutdown_handle();
        let thread = std::thread::spawn(move || engine.run());

        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, args: &[&str]) {
        let mut out = BytesMut::new();
        encode_request(args, &mut out);
        self.stream.write_all(&out).await.unwrap();
    }

    async fn recv(&mut self) -> WireValue {
        loop {
            if let Some((value, used)) = read_response(&self.buf).unwrap() {
                self.buf.drain(..used);
                return value;
            }
            let mut chunk = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("response timed out")
                .unwrap();
            assert!(n > 0, "server closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn call(&mut self, args: &[&str]) -> WireValue {
        self.send(args).await;
        self.recv().await
    }

    /// True once the server has closed this connection.
    async fn closed_within(&mut self, limit: Duration) -> bool {
        let mut chunk = [0u8; 64];
        match timeout(limit, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) | Err(_) => false,
        }
    }
}

fn str_value(s: &str) -> WireValue {
    WireValue::str(Bytes::from(s.to_string()))
}

#[tokio::test]
async fn test_ping() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    assert_eq!(client.call(&["ping"]).await, str_value("PONG"));
    assert_eq!(client.call(&["ping", "hello"]).await, str_value("hello"));
}

#[tokio::test]
async fn test_set_get_del() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    assert_eq!(client.call(&["set", "name", "tide"]).await, WireValue::nil());
    assert_eq!(client.call(&["get", "name"]).await, str_value("tide"));
    assert_eq!(client.call(&["dbsize"]).await, WireValue::int(1));
    assert_eq!(client.call(&["del", "name"]).await, WireValue::int(1));
    assert_eq!(client.call(&["get", "name"]).await, WireValue::nil());
}

#[tokio::test]
async fn test_pipelined_requests() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    let mut batch = BytesMut::new();
    for i in 0..100 {
        encode_request(&["incrby", "counter", "1"], &mut batch);
        if i % 10 == 0 {
            encode_request(&["ping"], &mut batch);
        }
    }
    client.stream.write_all(&batch).await.unwrap();

    for i in 0..100 {
        assert_eq!(client.recv().await, WireValue::int(i + 1));
        if i % 10 == 0 {
            assert_eq!(client.recv().await, str_value("PONG"));
        }
    }
    assert_eq!(client.call(&["get", "counter"]).await, WireValue::int(100));
}

#[tokio::test]
async fn test_sorted_set_commands() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    for (score, name) in [("1", "a"), ("2", "b"), ("3", "c"), ("4", "d")] {
        assert_eq!(client.call(&["zadd", "board", score, name]).await, WireValue::int(1));
    }
    assert_eq!(client.call(&["zadd", "board", "5", "a"]).await, WireValue::int(0));
    assert_eq!(client.call(&["zrank", "board", "a"]).await, WireValue::int(3));
    assert_eq!(client.call(&["zscore", "board", "a"]).await, WireValue::dbl(5.0));

    assert_eq!(
        client.call(&["zquery", "board", "2", "", "1", "2"]).await,
        WireValue::arr(vec![
            str_value("c"),
            WireValue::dbl(3.0),
            str_value("d"),
            WireValue::dbl(4.0),
        ])
    );

    let err = client.call(&["get", "board"]).await;
    assert_eq!(err.error_code(), Some(err_code::TYPE));
    // The connection survives a command-level error.
    assert_eq!(client.call(&["ping"]).await, str_value("PONG"));
}

#[tokio::test]
async fn test_oversized_frame_terminates_connection() {
    let server = TestServer::start(EngineConfig::default());
    let mut bad = Client::connect(server.addr).await;
    let mut good = Client::connect(server.addr).await;

    bad.stream
        .write_all(&((MAX_MSG + 1) as u32).to_le_bytes())
        .await
        .unwrap();
    assert!(bad.closed_within(Duration::from_secs(5)).await);

    // Other connections are unaffected.
    assert_eq!(good.call(&["ping"]).await, str_value("PONG"));
}

#[tokio::test]
async fn test_malformed_frame_terminates_connection() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    // Claims one argument of 100 bytes inside a 12-byte payload.
    let mut frame = Vec::new();
    frame.extend_from_slice(&12u32.to_le_bytes());
    frame.extend_from_slice(&1u32.to_le_bytes());
    frame.extend_from_slice(&100u32.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    client.stream.write_all(&frame).await.unwrap();

    assert!(client.closed_within(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_oversized_response_replaced_by_error() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    for i in 0..1000 {
        let (score, name) = (i.to_string(), format!("member-{:04}", i));
        client.call(&["zadd", "big", score.as_str(), name.as_str()]).await;
    }
    let response = client.call(&["zquery", "big", "0", "", "0", "1000"]).await;
    assert_eq!(response.error_code(), Some(err_code::TOO_BIG));
    assert_eq!(client.call(&["ping"]).await, str_value("PONG"));
}

#[tokio::test]
async fn test_ttl_expires_key() {
    let server = TestServer::start(EngineConfig::default());
    let mut client = Client::connect(server.addr).await;

    client.call(&["set", "a", "1"]).await;
    assert_eq!(client.call(&["pexpire", "a", "100"]).await, WireValue::int(1));

    let WireValue::Int(remaining) = client.call(&["pttl", "a"]).await else {
        panic!("expected integer");
    };
    assert!((0..=100).contains(&remaining));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.call(&["get", "a"]).await, WireValue::nil());
    assert_eq!(client.call(&["pttl", "a"]).await, WireValue::int(-2));
}

#[tokio::test]
async fn test_idle_connection_evicted() {
    let server = TestServer::start(EngineConfig {
        idle_timeout: Duration::from_millis(300),
        ..EngineConfig::default()
    });
    let mut stalled = Client::connect(server.addr).await;
    let mut active = Client::connect(server.addr).await;

    assert_eq!(stalled.call(&["ping"]).await, str_value("PONG"));

    // Keep one connection busy well past the idle threshold.
    for _ in 0..8 {
        assert_eq!(active.call(&["ping"]).await, str_value("PONG"));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(stalled.closed_within(Duration::from_secs(2)).await);
    assert_eq!(active.call(&["ping"]).await, str_value("PONG"));
}

#[tokio::test]
async fn test_many_clients() {
    let server = TestServer::start(EngineConfig::default());

    let mut tasks = Vec::new();
    for c in 0..20 {
        let addr = server.addr;
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            for i in 0..20 {
                let key = format!("client{}:key{}", c, i);
                let value = format!("v{}", i);
                client.call(&["set", key.as_str(), value.as_str()]).await;
                assert_eq!(client.call(&["get", key.as_str()]).await, str_value(&value));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut client = Client::connect(server.addr).await;
    assert_eq!(client.call(&["dbsize"]).await, WireValue::int(400));
}
