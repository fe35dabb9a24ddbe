//! Serves one fixed file's contents to every connecting client over the
//! zero-copy output pipeline (`sendfile`, via [`io_pipeline::WriteFilter`]),
//! exercising the open-file cache from outside the worker's own copy of it.
//! There is no request parsing: the first bytes a client sends are discarded
//! and treated as "go ahead, send the file" — a real content layer on top of
//! this crate would parse a request line first.
//!
//! Run with: `cargo run --example static_file_server --features "os-poll net" -- <path>`

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use veyrond::buf::{Buf, FileHandle};
use veyrond::chain::{Chain, FreeList};
use veyrond::config::{FileCacheConfig, ListenerConfig, WorkerConfig};
use veyrond::eventloop::{ConnEvent, Worker};
use veyrond::file_cache::FileCache;
use veyrond::io_pipeline::WriteFilter;
use veyrond::token::Token;

/// Per-connection send state: the accumulated writer filter plus the
/// buffer-chain bookkeeping `write_filter` needs to recycle drained buffers.
struct ConnState {
    filter: WriteFilter,
    busy: Chain,
    free: FreeList,
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let path: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("Cargo.toml"));
    let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

    let mut worker = Worker::new(WorkerConfig::default())?;
    worker.add_listener(ListenerConfig::tcp(addr))?;
    log::info!("serving {} on {addr}", path.display());

    let cache = Rc::new(RefCell::new(FileCache::new(FileCacheConfig {
        max: 128,
        inactive: Duration::from_secs(60),
        min_uses: 1,
    })));
    let states: Rc<RefCell<HashMap<Token, ConnState>>> = Rc::new(RefCell::new(HashMap::new()));

    worker.set_handler(move |ev: ConnEvent| {
        if ev.error || ev.eof {
            states.borrow_mut().remove(&ev.token);
            return;
        }

        if ev.readable {
            let mut discard = [0u8; 1024];
            loop {
                match ev.conn.stream.read(&mut discard) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }

            if !states.borrow().contains_key(&ev.token) {
                match cache.borrow_mut().open_cached_file(&path) {
                    Ok(cached) => {
                        let handle = Rc::new(FileHandle {
                            fd: cached.fd,
                            size: cached.size,
                        });
                        let mut chain = Chain::new();
                        chain.push_back(Buf::new_file(handle, 0, cached.size));

                        let mut state = ConnState {
                            filter: WriteFilter::new(0, 0),
                            busy: Chain::new(),
                            free: FreeList::new(),
                        };
                        let _ = state.filter.write_filter(
                            &mut ev.conn.stream,
                            &mut state.busy,
                            &mut state.free,
                            chain,
                        );
                        states.borrow_mut().insert(ev.token, state);
                    }
                    Err(e) => log::warn!("open {}: {e}", path.display()),
                }
            }
        }

        if ev.writable {
            if let Some(state) = states.borrow_mut().get_mut(&ev.token) {
                let _ = state.filter.write_filter(
                    &mut ev.conn.stream,
                    &mut state.busy,
                    &mut state.free,
                    Chain::new(),
                );
            }
        }
    });

    loop {
        worker.run_once()?;
    }
}
