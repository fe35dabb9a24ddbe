//! End-to-end coverage of a few of the accept/close/keep-alive scenarios a
//! worker is expected to get right across several `run_once` iterations —
//! the unit tests in `src/eventloop.rs` and `src/connection.rs` cover the
//! pieces individually; these drive them together the way a real worker
//! would be driven.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use veyrond::config::{ListenerConfig, WorkerConfig};
use veyrond::eventloop::{ConnEvent, Worker};
use veyrond::net::TcpStream;
use veyrond::Token;

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn bound_worker(connection_n: usize) -> (Worker, SocketAddr) {
    let mut worker = Worker::new(WorkerConfig {
        accept_mutex: false,
        connection_n,
        ..WorkerConfig::default()
    })
    .unwrap();
    worker.add_listener(ListenerConfig::tcp(loopback())).unwrap();
    let addr = worker.listener_local_addr(0).unwrap();
    (worker, addr)
}

/// Invariant 1 of §8: once a connection is freed, its slot returns to the
/// pool's free list and the pool's occupancy count reflects it.
#[test]
fn freed_connection_returns_its_slot_to_the_pool() {
    let (mut worker, addr) = bound_worker(4);
    let baseline_free = worker.connections().free_slots();

    let client = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    worker.run_once().unwrap();
    assert_eq!(worker.connections().free_slots(), baseline_free - 1);

    drop(client);
    std::thread::sleep(Duration::from_millis(20));
    worker.run_once().unwrap();

    worker.connections_mut().free_connection(Token(0));
    assert_eq!(worker.connections().free_slots(), baseline_free);
}

/// §4.7's keep-alive path: a connection marked reusable is tracked as such
/// until it is explicitly freed.
#[test]
fn reusable_connection_is_tracked_until_freed() {
    let (mut worker, addr) = bound_worker(4);

    let _client = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    worker.run_once().unwrap();

    let token = Token(0);
    assert!(worker.connections().get(token).is_some());
    worker.connections_mut().mark_reusable(token);

    assert_eq!(worker.connections().oldest_reusable(), Some(token));
    assert_eq!(worker.connections().reusable_count(), 1);

    worker.connections_mut().free_connection(token);
    assert_eq!(worker.connections().reusable_count(), 0);
}

/// §4.6's graceful-shutdown exit condition end-to-end: a worker with one
/// live, reusable connection does not report shutdown complete until
/// `run_once`'s reap step has freed it.
#[test]
fn graceful_shutdown_waits_for_reusable_connections_to_drain() {
    let mut worker = Worker::new(WorkerConfig {
        accept_mutex: false,
        connection_n: 4,
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    })
    .unwrap();
    worker.add_listener(ListenerConfig::tcp(loopback())).unwrap();
    let addr = worker.listener_local_addr(0).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    worker.run_once().unwrap();
    worker.connections_mut().mark_reusable(Token(0));

    worker.begin_shutdown();
    assert!(
        !worker.is_shutdown_complete(),
        "a reusable connection is still open"
    );

    // Nudge the connection readable so `process_events` inside the next
    // `run_once` returns promptly instead of waiting on a timeout that,
    // with every timer cancelled, would otherwise be unbounded.
    client.write_all(b"x").unwrap();
    std::thread::sleep(Duration::from_millis(20));

    worker.run_once().unwrap();
    assert!(
        worker.is_shutdown_complete(),
        "run_once's reap step should have freed the idle reusable connection"
    );
}

/// Drives a real echo round-trip through `run_once` twice: once to accept,
/// once to see the readable event and write a reply back.
#[test]
fn echo_round_trip_via_run_once() {
    let (mut worker, addr) = bound_worker(4);

    worker.set_handler(|ev: ConnEvent| {
        if !ev.readable {
            return;
        }
        let mut buf = [0u8; 64];
        if let Ok(n) = ev.conn.stream.read(&mut buf) {
            if n > 0 {
                let _ = ev.conn.stream.write_all(&buf[..n]);
            }
        }
    });

    let mut client = TcpStream::connect(addr).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    worker.run_once().unwrap(); // accept

    client.write_all(b"ping").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    worker.run_once().unwrap(); // handler echoes it back

    let mut reply = [0u8; 64];
    let n = read_with_retry(&mut client, &mut reply);
    assert_eq!(&reply[..n], b"ping");
}

/// `client` is a non-blocking socket (every `TcpStream` in this crate is);
/// poll it with a short sleep between attempts rather than a blocking read.
fn read_with_retry(client: &mut TcpStream, buf: &mut [u8]) -> usize {
    for _ in 0..20 {
        match client.read(buf) {
            Ok(n) if n > 0 => return n,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => panic!("read failed: {e}"),
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("no reply received within the retry budget");
}
