//! A minimal echo server built directly on the worker runtime, with none of
//! a content-layer protocol on top: whatever bytes a client sends are
//! written straight back out through the zero-copy output pipeline.
//!
//! Run with: `cargo run --example tcp_server --features "os-poll net"`

use std::io::Read;
use std::net::SocketAddr;

use veyrond::config::{ListenerConfig, WorkerConfig};
use veyrond::eventloop::{ConnEvent, Worker};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let mut worker = Worker::new(WorkerConfig::default())?;
    worker.add_listener(ListenerConfig::tcp(addr))?;
    log::info!("echoing on {addr}");

    worker.set_handler(|ev: ConnEvent| {
        if ev.error || ev.eof {
            return;
        }
        if !ev.readable {
            return;
        }
        let mut buf = [0u8; 4096];
        match ev.conn.stream.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                use std::io::Write;
                let _ = ev.conn.stream.write_all(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("connection {:?}: read failed: {e}", ev.token),
        }
    });

    loop {
        worker.run_once()?;
    }
}
