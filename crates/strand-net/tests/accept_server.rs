//! Accept-server integration tests with plain blocking clients.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use strand_core::Result;
use strand_net::{AcceptServer, Connection, FiberSocket, ListenerInterface};
use strand_runtime::{PoolConfig, Reactor, ReactorConfig, ReactorKind, ReactorPool};

struct EchoConnection;

#[async_trait(?Send)]
impl Connection for EchoConnection {
    async fn handle_requests(&mut self, socket: &mut FiberSocket, _reactor: &Reactor) -> Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.is_eof() => return Ok(()),
                Err(e) => return Err(e),
            };
            socket.write_all(&buf[..n]).await?;
        }
    }
}

struct EchoListener;

impl ListenerInterface for EchoListener {
    fn new_connection(&self) -> Box<dyn Connection> {
        Box::new(EchoConnection)
    }
}

fn pool_of(kind: ReactorKind, size: usize) -> Arc<ReactorPool> {
    ReactorPool::run(PoolConfig {
        size,
        reactor: ReactorConfig { kind, ..Default::default() },
        pin_threads: false,
    })
    .expect("pool start failed")
}

fn both_kinds() -> [ReactorKind; 2] {
    [ReactorKind::Uring, ReactorKind::Epoll]
}

#[test]
fn test_echo_then_stop_within_a_second() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 2);
        let server = AcceptServer::new(pool.clone());
        let port = server.add_listener(0, Arc::new(EchoListener)).unwrap();
        assert!(port > 0);
        server.run();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"ABC").unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ABC");

        // The client stays connected; stop(true) must half-close it,
        // drain the handler and return promptly.
        let start = Instant::now();
        server.stop(true);
        assert!(start.elapsed() < Duration::from_secs(1), "stop took {:?}", start.elapsed());

        // The handler observed the shutdown as EOF.
        let n = stream.read(&mut reply).unwrap();
        assert_eq!(n, 0);

        pool.stop();
    }
}

#[test]
fn test_sixteen_clients_drain_on_stop() {
    for kind in both_kinds() {
        let pool = pool_of(kind, 3);
        let server = AcceptServer::new(pool.clone());
        let port = server.add_listener(0, Arc::new(EchoListener)).unwrap();
        server.run();

        let mut streams = Vec::new();
        for i in 0..16u32 {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            let msg = format!("client-{}", i);
            stream.write_all(msg.as_bytes()).unwrap();
            let mut reply = vec![0u8; msg.len()];
            stream.read_exact(&mut reply).unwrap();
            assert_eq!(reply, msg.as_bytes());
            streams.push(stream);
        }

        let start = Instant::now();
        server.stop(true);
        assert!(start.elapsed() < Duration::from_secs(2), "stop took {:?}", start.elapsed());

        // Every connection completed its read loop: each client sees
        // EOF, none is left hanging.
        for mut stream in streams {
            let mut buf = [0u8; 8];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(n, 0);
        }

        pool.stop();
    }
}

#[test]
fn test_port_zero_assigns_distinct_ports() {
    let pool = pool_of(ReactorKind::Epoll, 1);
    let server = AcceptServer::new(pool.clone());
    let p1 = server.add_listener(0, Arc::new(EchoListener)).unwrap();
    let p2 = server.add_listener(0, Arc::new(EchoListener)).unwrap();
    assert_ne!(p1, p2);
    server.run();
    server.stop(true);
    pool.stop();
}
