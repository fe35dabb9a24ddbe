//! Ambient configuration surface (§A.3 of `SPEC_FULL.md`).
//!
//! The directive-based config *parser* is out of scope (§1); this is the
//! typed surface the core consumes once something else (a CLI flag set, a
//! parsed config file) has produced values for it.

use std::net::SocketAddr;
use std::time::Duration;

/// Per-listener tunables (§3 "Listener", §6 "Configured resources per
/// listener").
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    pub backlog: i32,
    pub reuseport: bool,
    pub fastopen: Option<i32>,
    pub pool_size: usize,
    pub post_accept_buffer_size: usize,
    pub tcp_nodelay: bool,
    pub tcp_nopush: bool,
    pub keepalive: Option<(u32, u32, u32)>,
}

impl ListenerConfig {
    pub fn tcp(addr: SocketAddr) -> ListenerConfig {
        ListenerConfig {
            addr,
            backlog: 511,
            reuseport: false,
            fastopen: None,
            pool_size: 16 * 1024,
            post_accept_buffer_size: 64 * 1024,
            tcp_nodelay: true,
            tcp_nopush: false,
            keepalive: None,
        }
    }
}

/// Per-worker tunables (§4.7, §4.6, §4.9, §4.10, §4.11).
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// `connection_n`: size of the fixed connection pool.
    pub connection_n: usize,
    /// Max `accept()` calls per readiness notification on one listener.
    pub multi_accept: u32,
    /// Whether this worker participates in cross-worker accept
    /// serialization.
    pub accept_mutex: bool,
    /// Grace period a worker enforces after releasing the accept mutex.
    pub accept_mutex_delay: Duration,
    /// Output-chain buffer quota: up to `bufs_num` buffers of `bufs_size`.
    pub bufs_num: usize,
    pub bufs_size: usize,
    /// Writer filter: suppress sends under this many buffered bytes unless
    /// a flush/last is pending.
    pub postpone_output: usize,
    /// `0` disables rate limiting.
    pub limit_rate: u64,
    pub shutdown_timeout: Duration,
    pub thread_pool_size: usize,
    pub resolver: ResolverConfig,
    pub file_cache: FileCacheConfig,
}

impl Default for WorkerConfig {
    fn default() -> WorkerConfig {
        WorkerConfig {
            connection_n: 1024,
            multi_accept: 64,
            accept_mutex: true,
            accept_mutex_delay: Duration::from_millis(500),
            bufs_num: 8,
            bufs_size: 8 * 1024,
            postpone_output: 1460,
            limit_rate: 0,
            shutdown_timeout: Duration::from_secs(30),
            thread_pool_size: 4,
            resolver: ResolverConfig::default(),
            file_cache: FileCacheConfig::default(),
        }
    }
}

/// §4.9 resolver tunables.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    pub nameservers: Vec<SocketAddr>,
    pub attempts: u32,
    pub timeout: Duration,
    pub valid_override: Option<Duration>,
}

impl Default for ResolverConfig {
    fn default() -> ResolverConfig {
        ResolverConfig {
            nameservers: Vec::new(),
            attempts: 5,
            timeout: Duration::from_secs(1),
            valid_override: None,
        }
    }
}

/// §4.10 open-file-cache tunables.
#[derive(Clone, Copy, Debug)]
pub struct FileCacheConfig {
    pub max: usize,
    pub inactive: Duration,
    pub min_uses: u32,
}

impl Default for FileCacheConfig {
    fn default() -> FileCacheConfig {
        FileCacheConfig {
            max: 1024,
            inactive: Duration::from_secs(60),
            min_uses: 1,
        }
    }
}

/// A named shared-memory zone directory entry (§6).
#[derive(Clone, Debug)]
pub struct ZoneConfig {
    pub name: String,
    pub size: usize,
    pub tag: u64,
}
