//! C10: the asynchronous DNS resolver.
//!
//! A worker-local cache over three indices (name, address, SRV target — §3),
//! a UDP query/response multiplexer round-robining configured nameservers,
//! and the small subset of RFC 1035 wire format this crate needs to speak to
//! get A/AAAA/CNAME/PTR/SRV records back out of a response packet. TCP
//! fallback for truncated responses and the recursive-resolver-wide NS
//! delegation chase nginx's own resolver performs are both out of scope here
//! (truncation failing the query outright is a simplification recorded in
//! `DESIGN.md`); the `TC` bit is simply treated as a failure.
//!
//! Per §4.9's "no inter-worker resolver": every `Resolver` is entirely
//! worker-local state, reachable only from the single thread that owns it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

use crate::config::ResolverConfig;
use crate::net::UdpSocket;

/// §4.9: "a `recursion` counter guards CNAME loops at depth `MAX_RECURSION`."
pub const MAX_RECURSION: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordType {
    A,
    Aaaa,
    Cname,
    Ptr,
    Srv,
}

impl RecordType {
    fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Cname => 5,
            RecordType::Ptr => 12,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
        }
    }

    fn from_code(code: u16) -> Option<RecordType> {
        match code {
            1 => Some(RecordType::A),
            5 => Some(RecordType::Cname),
            12 => Some(RecordType::Ptr),
            28 => Some(RecordType::Aaaa),
            33 => Some(RecordType::Srv),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SrvTarget {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

#[derive(Clone, Debug)]
enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ptr(String),
    Srv(SrvTarget),
}

struct RawRecord {
    #[allow(dead_code)]
    name: String,
    ttl: u32,
    data: RData,
}

/// A parsed, TTL-bearing resolution result for one query.
#[derive(Clone, Debug, Default)]
pub struct ResolveResult {
    pub addrs: Vec<IpAddr>,
    pub srv: Vec<SrvTarget>,
    pub ptr: Vec<String>,
}

struct CacheNode {
    result: ResolveResult,
    expires_at: Instant,
    /// End of the stale-while-revalidate grace window (§4.9's "`valid`
    /// override extends").
    valid_until: Instant,
}

struct PendingQuery {
    name: String,
    qtype: RecordType,
    sent_at: Instant,
    attempts: u32,
    nameserver_idx: usize,
    recursion: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Already cached (possibly stale-but-in-grace, in which case a
    /// revalidation query was just issued in the background).
    Hit,
    /// No cached entry; a query is now in flight. Call
    /// [`Resolver::poll_socket`] or [`Resolver::check_timeouts`] and retry.
    Queried,
    /// A query for this name is already in flight from an earlier call.
    Pending,
}

/// The asynchronous DNS resolver (C10).
pub struct Resolver {
    name_index: HashMap<String, CacheNode>,
    addr_index: HashMap<IpAddr, CacheNode>,
    srv_index: HashMap<String, CacheNode>,
    pending: HashMap<u16, PendingQuery>,
    next_id: u16,
    nameservers: Vec<SocketAddr>,
    socket: UdpSocket,
    attempts: u32,
    timeout: Duration,
    valid_override: Option<Duration>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> io::Result<Resolver> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
        Ok(Resolver {
            name_index: HashMap::new(),
            addr_index: HashMap::new(),
            srv_index: HashMap::new(),
            pending: HashMap::new(),
            next_id: 1,
            nameservers: config.nameservers,
            socket,
            attempts: config.attempts,
            timeout: config.timeout,
            valid_override: config.valid_override,
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    fn fresh_hit<'a>(node: &'a CacheNode, now: Instant) -> Option<&'a ResolveResult> {
        if now < node.expires_at {
            Some(&node.result)
        } else {
            None
        }
    }

    /// `resolve_name`-equivalent: look up `name`'s A/AAAA records, querying
    /// the nameservers on a miss.
    pub fn query_name(&mut self, name: &str, now: Instant) -> (ResolveOutcome, Option<ResolveResult>) {
        if let Some(node) = self.name_index.get(name) {
            if let Some(hit) = Self::fresh_hit(node, now) {
                return (ResolveOutcome::Hit, Some(hit.clone()));
            }
            if now < node.valid_until {
                let stale = node.result.clone();
                if !self.has_pending_for(name) {
                    self.issue_query(name, RecordType::A, now, 0);
                }
                return (ResolveOutcome::Hit, Some(stale));
            }
        }

        if self.has_pending_for(name) {
            return (ResolveOutcome::Pending, None);
        }
        self.issue_query(name, RecordType::A, now, 0);
        (ResolveOutcome::Queried, None)
    }

    fn has_pending_for(&self, name: &str) -> bool {
        self.pending.values().any(|q| q.name == name)
    }

    fn issue_query(&mut self, name: &str, qtype: RecordType, now: Instant, recursion: u32) {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let ns_idx = id as usize % self.nameservers.len().max(1);
        let packet = build_query(id, name, qtype);

        if let Some(&ns) = self.nameservers.get(ns_idx) {
            if let Err(e) = self.socket.send_to(&packet, ns) {
                log::warn!("resolver: send_to {ns} failed: {e}");
            }
        }

        self.pending.insert(
            id,
            PendingQuery {
                name: name.to_string(),
                qtype,
                sent_at: now,
                attempts: 1,
                nameserver_idx: ns_idx,
                recursion,
            },
        );
    }

    /// Drain one pending UDP datagram, if any, and fold it into the cache.
    /// Returns the names that are now resolvable (so the caller can re-issue
    /// [`query_name`] and get a `Hit`).
    pub fn poll_socket(&mut self, now: Instant) -> io::Result<Vec<String>> {
        let mut buf = [0u8; 4096];
        let n = match self.socket.recv_from(&mut buf) {
            Ok((n, _from)) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let Ok(parsed) = parse_response(&buf[..n]) else {
            return Ok(Vec::new());
        };
        let Some(pending) = self.pending.remove(&parsed.id) else {
            return Ok(Vec::new());
        };

        if parsed.truncated {
            log::warn!("resolver: truncated response for {}, TCP fallback not implemented", pending.name);
            return Ok(Vec::new());
        }

        self.fold_records(&pending, parsed.answers, now)
    }

    fn fold_records(
        &mut self,
        pending: &PendingQuery,
        answers: Vec<RawRecord>,
        now: Instant,
    ) -> io::Result<Vec<String>> {
        let min_ttl = answers.iter().map(|r| r.ttl).min().unwrap_or(0);
        let ttl = Duration::from_secs(min_ttl as u64);
        let valid_for = self.valid_override.unwrap_or(ttl);

        let mut result = ResolveResult::default();
        let mut cname_target: Option<String> = None;

        for rec in &answers {
            match &rec.data {
                RData::A(v4) => result.addrs.push(IpAddr::V4(*v4)),
                RData::Aaaa(v6) => result.addrs.push(IpAddr::V6(*v6)),
                RData::Ptr(name) => result.ptr.push(name.clone()),
                RData::Srv(srv) => result.srv.push(srv.clone()),
                RData::Cname(target) => cname_target = Some(target.clone()),
            }
        }

        if result.addrs.is_empty() && result.srv.is_empty() && result.ptr.is_empty() {
            if let Some(target) = cname_target {
                if pending.recursion >= MAX_RECURSION {
                    log::warn!("resolver: CNAME recursion limit hit resolving {}", pending.name);
                    return Ok(Vec::new());
                }
                self.issue_query(&target, pending.qtype, now, pending.recursion + 1);
                return Ok(Vec::new());
            }
        }

        self.name_index.insert(
            pending.name.clone(),
            CacheNode {
                result: result.clone(),
                expires_at: now + ttl,
                valid_until: now + valid_for,
            },
        );
        for addr in &result.addrs {
            self.addr_index.insert(
                *addr,
                CacheNode {
                    result: result.clone(),
                    expires_at: now + ttl,
                    valid_until: now + valid_for,
                },
            );
        }

        Ok(vec![pending.name.clone()])
    }

    /// Scan pending queries for ones past `self.timeout`; retransmit to the
    /// next nameserver, or fail (and return) ones past `self.attempts`.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<String> {
        let expired_ids: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, q)| now.duration_since(q.sent_at) >= self.timeout)
            .map(|(&id, _)| id)
            .collect();

        let mut failed = Vec::new();
        for id in expired_ids {
            let Some(mut query) = self.pending.remove(&id) else {
                continue;
            };
            if query.attempts >= self.attempts {
                failed.push(query.name.clone());
                continue;
            }
            query.attempts += 1;
            query.nameserver_idx = (query.nameserver_idx + 1) % self.nameservers.len().max(1);
            query.sent_at = now;

            let new_id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            let packet = build_query(new_id, &query.name, query.qtype);
            if let Some(&ns) = self.nameservers.get(query.nameserver_idx) {
                let _ = self.socket.send_to(&packet, ns);
            }
            self.pending.insert(new_id, query);
        }
        failed
    }

    pub fn cache_len(&self) -> usize {
        self.name_index.len()
    }
}

fn build_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 16);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&0u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    for label in name.trim_end_matches('.').split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.code().to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // IN

    out
}

struct ParsedResponse {
    id: u16,
    truncated: bool,
    answers: Vec<RawRecord>,
}

#[derive(Debug)]
struct ParseError;

fn parse_response(msg: &[u8]) -> Result<ParsedResponse, ParseError> {
    if msg.len() < 12 {
        return Err(ParseError);
    }
    let id = u16::from_be_bytes([msg[0], msg[1]]);
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    let truncated = flags & 0x0200 != 0;
    let qdcount = u16::from_be_bytes([msg[4], msg[5]]) as usize;
    let ancount = u16::from_be_bytes([msg[6], msg[7]]) as usize;

    let mut cursor = 12usize;
    for _ in 0..qdcount {
        let (_, next) = parse_name(msg, cursor)?;
        cursor = next + 4; // qtype + qclass
    }

    let mut answers = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        let (name, next) = parse_name(msg, cursor)?;
        cursor = next;
        if cursor + 10 > msg.len() {
            return Err(ParseError);
        }
        let rtype = u16::from_be_bytes([msg[cursor], msg[cursor + 1]]);
        let ttl = u32::from_be_bytes([
            msg[cursor + 4],
            msg[cursor + 5],
            msg[cursor + 6],
            msg[cursor + 7],
        ]);
        let rdlen = u16::from_be_bytes([msg[cursor + 8], msg[cursor + 9]]) as usize;
        let rdata_start = cursor + 10;
        let rdata_end = rdata_start.checked_add(rdlen).ok_or(ParseError)?;
        if rdata_end > msg.len() {
            return Err(ParseError);
        }
        let rdata = &msg[rdata_start..rdata_end];

        if let Some(data) = parse_rdata(msg, RecordType::from_code(rtype), rdata, rdata_start)? {
            answers.push(RawRecord { name, ttl, data });
        }
        cursor = rdata_end;
    }

    Ok(ParsedResponse {
        id,
        truncated,
        answers,
    })
}

fn parse_rdata(
    msg: &[u8],
    rtype: Option<RecordType>,
    rdata: &[u8],
    rdata_offset: usize,
) -> Result<Option<RData>, ParseError> {
    match rtype {
        Some(RecordType::A) if rdata.len() == 4 => Ok(Some(RData::A(Ipv4Addr::new(
            rdata[0], rdata[1], rdata[2], rdata[3],
        )))),
        Some(RecordType::Aaaa) if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            Ok(Some(RData::Aaaa(Ipv6Addr::from(octets))))
        }
        Some(RecordType::Cname) => {
            let (name, _) = parse_name(msg, rdata_offset)?;
            Ok(Some(RData::Cname(name)))
        }
        Some(RecordType::Ptr) => {
            let (name, _) = parse_name(msg, rdata_offset)?;
            Ok(Some(RData::Ptr(name)))
        }
        Some(RecordType::Srv) if rdata.len() >= 6 => {
            let priority = u16::from_be_bytes([rdata[0], rdata[1]]);
            let weight = u16::from_be_bytes([rdata[2], rdata[3]]);
            let port = u16::from_be_bytes([rdata[4], rdata[5]]);
            let (target, _) = parse_name(msg, rdata_offset + 6)?;
            Ok(Some(RData::Srv(SrvTarget {
                priority,
                weight,
                port,
                target,
            })))
        }
        _ => Ok(None),
    }
}

/// Parse a (possibly compressed) DNS name starting at `offset`, returning
/// the dotted name and the offset just past it in the *original* message
/// (not following any pointer).
fn parse_name(msg: &[u8], offset: usize) -> Result<(String, usize), ParseError> {
    let mut labels = Vec::new();
    let mut pos = offset;
    let mut end_pos: Option<usize> = None;
    let mut jumps = 0;

    loop {
        if jumps > 32 {
            return Err(ParseError);
        }
        let len = *msg.get(pos).ok_or(ParseError)? as usize;
        if len == 0 {
            if end_pos.is_none() {
                end_pos = Some(pos + 1);
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            let b2 = *msg.get(pos + 1).ok_or(ParseError)? as usize;
            if end_pos.is_none() {
                end_pos = Some(pos + 2);
            }
            pos = ((len & 0x3F) << 8) | b2;
            jumps += 1;
            continue;
        }
        let start = pos + 1;
        let stop = start.checked_add(len).ok_or(ParseError)?;
        let label = msg.get(start..stop).ok_or(ParseError)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos = stop;
    }

    Ok((labels.join("."), end_pos.unwrap_or(pos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_a_response(id: u16, name: &str, ip: Ipv4Addr, ttl: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&0x8180u16.to_be_bytes()); // response, RD+RA
        out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        out.extend_from_slice(&1u16.to_be_bytes()); // ancount
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&1u16.to_be_bytes()); // A
        out.extend_from_slice(&1u16.to_be_bytes()); // IN

        // answer, name is a pointer back to offset 12
        out.extend_from_slice(&0xC00Cu16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&ip.octets());
        out
    }

    #[test]
    fn parses_a_record_with_name_compression() {
        let packet = build_a_response(7, "example.test", Ipv4Addr::new(93, 184, 216, 34), 300);
        let parsed = parse_response(&packet).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.answers.len(), 1);
        match &parsed.answers[0].data {
            RData::A(ip) => assert_eq!(*ip, Ipv4Addr::new(93, 184, 216, 34)),
            other => panic!("expected A record, got {other:?}"),
        }
    }

    /// §8 scenario 6: a TTL=2 A record is cached; a lookup within the TTL
    /// hits cache (no second packet), a lookup after TTL expiry re-queries.
    #[test]
    fn ttl_cache_hit_then_miss_after_expiry() {
        // A fake nameserver: echoes one A record with TTL=2 for any query.
        let ns_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let ns_addr = ns_socket.local_addr().unwrap();
        let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let responses = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let (ns_thread, stop2, responses2) = {
            let stop = stop.clone();
            let responses = responses.clone();
            ns_socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
            let handle = std::thread::spawn(move || {
                let mut buf = [0u8; 512];
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    if let Ok((n, from)) = ns_socket.recv_from(&mut buf) {
                        let id = u16::from_be_bytes([buf[0], buf[1]]);
                        let _ = n;
                        let resp = build_a_response(id, "cached.test", Ipv4Addr::new(1, 2, 3, 4), 2);
                        let _ = ns_socket.send_to(&resp, from);
                        responses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            });
            (handle, stop, responses)
        };

        let mut resolver = Resolver::new(ResolverConfig {
            nameservers: vec![ns_addr],
            attempts: 5,
            timeout: Duration::from_millis(200),
            valid_override: None,
        })
        .unwrap();
        let t0 = Instant::now();
        let (outcome, _) = resolver.query_name("cached.test", t0);
        assert_eq!(outcome, ResolveOutcome::Queried);

        // Wait for the reply and fold it into the cache.
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            if !resolver.poll_socket(t0).unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "nameserver never replied");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(responses2.load(std::sync::atomic::Ordering::Relaxed), 1);

        // t+1s: still within TTL=2, must hit cache without a new packet.
        let t1 = t0 + Duration::from_secs(1);
        let (outcome, result) = resolver.query_name("cached.test", t1);
        assert_eq!(outcome, ResolveOutcome::Hit);
        assert_eq!(result.unwrap().addrs, vec![IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))]);
        assert_eq!(responses2.load(std::sync::atomic::Ordering::Relaxed), 1);

        // t+3s: past TTL, must re-query.
        let t3 = t0 + Duration::from_secs(3);
        let (outcome, _) = resolver.query_name("cached.test", t3);
        assert_eq!(outcome, ResolveOutcome::Queried);

        stop2.store(true, std::sync::atomic::Ordering::Relaxed);
        ns_thread.join().unwrap();
    }
}
