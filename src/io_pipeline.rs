//! C9: the zero-copy output pipeline — `output_chain`, `write_filter`, the
//! postpone filter, and the `send_chain` abstraction over scatter/gather and
//! `sendfile`.

use std::io::{self, IoSlice, Write};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use crate::buf::Buf;
use crate::chain::{chain_update_chains, chain_update_sent, Chain, FreeList};
use crate::error::{Code, Kind};
use crate::net::TcpStream;

/// Configuration and working state for one `output_chain` context (§4.8):
/// how many `bufs.size`-sized buffers this context may hold in flight before
/// upstream must yield, and which transformations downstream requires.
pub struct OutputChainCtx {
    pub free: FreeList,
    pub busy: Chain,
    pub bufs_num: usize,
    pub bufs_size: usize,
    pub sendfile: bool,
    /// Downstream cannot handle file buffers; read file ranges into memory.
    pub need_in_memory: bool,
    /// Downstream will mutate the buffer in place; copy into a writable
    /// temporary buffer rather than handing out a shared/read-only one.
    pub need_in_temp: bool,
}

impl OutputChainCtx {
    pub fn new(bufs_num: usize, bufs_size: usize) -> OutputChainCtx {
        OutputChainCtx {
            free: FreeList::new(),
            busy: Chain::new(),
            bufs_num,
            bufs_size,
            sendfile: true,
            need_in_memory: false,
            need_in_temp: false,
        }
    }

    /// How many buffers are currently in flight (busy + backing the output
    /// we're about to hand downstream), for the `bufs.num` quota check.
    fn in_flight(&self, pending: &Chain) -> usize {
        self.busy.len() + pending.len()
    }
}

/// `output_chain(ctx, in)`: thread the input chain through the configured
/// transforms, pulling working buffers from `ctx.free` / allocating fresh
/// ones, and return the chain ready for [`write_filter`].
///
/// Invariant 3 of §8 (`Sʹ ≥ S − buffered`) holds here because every
/// transform either passes a buffer through untouched or replaces it with a
/// buffer of identical logical size (a copy, not a truncation); bytes only
/// disappear into `ctx.busy`/`ctx.free`, never silently.
pub fn output_chain(ctx: &mut OutputChainCtx, input: Chain) -> Code<Chain> {
    let mut out = Chain::new();

    for buf in input.iter() {
        if ctx.in_flight(&out) >= ctx.bufs_num {
            return Code::Again;
        }

        if buf.flags.in_file && ctx.need_in_memory {
            match read_file_buf_into_memory(ctx, buf) {
                Ok(copied) => out.push_back(copied),
                Err(e) => return Code::Error(Kind::Io(e)),
            }
            continue;
        }

        if buf.flags.in_file && !ctx.sendfile {
            match read_file_buf_into_memory(ctx, buf) {
                Ok(copied) => out.push_back(copied),
                Err(e) => return Code::Error(Kind::Io(e)),
            }
            continue;
        }

        if !buf.flags.in_file && ctx.need_in_temp && !buf.flags.temporary {
            let mut copy = ctx.free.get_free_buf(buf.size() as usize);
            let src = buf.as_slice();
            // `get_free_buf` returns a fresh or recycled writable buffer;
            // `as_slice` reads back only what we just wrote to it.
            copy_into_temp(&mut copy, src);
            out.push_back(copy);
            continue;
        }

        out.push_back(buf.shallow_copy());
    }

    Code::Ok(out)
}

fn copy_into_temp(dst: &mut Buf, src: &[u8]) {
    *dst = crate::buf::Buf::new_temp(src.len());
    dst.last = src.len();
    dst.as_mut_slice()
        .expect("freshly created temp buffer is always the sole owner")
        .copy_from_slice(src);
}

fn read_file_buf_into_memory(ctx: &OutputChainCtx, buf: &Buf) -> io::Result<Buf> {
    let file = buf
        .file
        .as_ref()
        .expect("in_file buffer without a file handle");
    let want = (buf.file_last - buf.file_pos) as usize;
    let mut data = vec![0u8; want.max(1)];
    let n = unsafe {
        libc::pread(
            file.fd,
            data.as_mut_ptr() as *mut libc::c_void,
            want,
            buf.file_pos as libc::off_t,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    data.truncate(n as usize);
    let mut out = crate::buf::Buf::new_temp(ctx.bufs_size.max(n as usize));
    out.last = n as usize;
    out.as_mut_slice()
        .expect("freshly created temp buffer is always the sole owner")[..n as usize]
        .copy_from_slice(&data);
    Ok(out)
}

/// Per-request writer state (§4.8's "writer filter"): the accumulated
/// out-chain, the postpone threshold, and rate-limiting bookkeeping.
pub struct WriteFilter {
    pub out: Chain,
    pub postpone_output: usize,
    pub limit_rate: u64,
    sent_bytes: u64,
    started: Option<Instant>,
}

impl WriteFilter {
    pub fn new(postpone_output: usize, limit_rate: u64) -> WriteFilter {
        WriteFilter {
            out: Chain::new(),
            postpone_output,
            limit_rate,
            sent_bytes: 0,
            started: None,
        }
    }

    fn has_flush_or_last(&self) -> bool {
        self.out
            .iter()
            .any(|b| b.flags.flush || b.flags.last_buf || b.flags.sync)
    }

    /// Compute the delay (if rate-limited) before more bytes may be sent, per
    /// §4.8: `(sent_bytes - limit_rate*elapsed) / limit_rate` when positive.
    fn rate_limit_delay(&self) -> Option<Duration> {
        if self.limit_rate == 0 {
            return None;
        }
        let elapsed = self.started?.elapsed().as_secs_f64();
        let allowed = self.limit_rate as f64 * elapsed;
        let over = self.sent_bytes as f64 - allowed;
        if over <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(over / self.limit_rate as f64))
    }

    /// `write_filter(r, in)`: append `in` to the accumulated out-chain, then
    /// either send now (postpone threshold exceeded or a flush/last is
    /// pending) or return `Again` to wait for more data / the write event.
    pub fn write_filter(
        &mut self,
        stream: &mut TcpStream,
        busy: &mut Chain,
        free: &mut FreeList,
        input: Chain,
    ) -> Code<()> {
        self.out.append(input);
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }

        let pending = self.out.total_size() as usize;
        if pending < self.postpone_output && !self.has_flush_or_last() {
            return Code::Again;
        }

        if let Some(delay) = self.rate_limit_delay() {
            log::trace!("write_filter: rate limited, delaying {:?}", delay);
            return Code::Again;
        }

        let limit = if self.limit_rate > 0 {
            self.limit_rate
        } else {
            u64::MAX
        };

        let out = std::mem::take(&mut self.out);
        match send_chain(stream, &out, limit) {
            Ok(sent) => {
                self.sent_bytes += sent;
                let mut remaining = out;
                chain_update_sent(&mut remaining, sent);
                if remaining.is_empty() {
                    chain_update_chains(free, busy, remaining);
                    Code::Ok(())
                } else {
                    self.out = remaining;
                    Code::Again
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.out = out;
                Code::Again
            }
            Err(e) => Code::Error(Kind::Io(e)),
        }
    }
}

/// `connection.send_chain(in, limit)`: platform-specialized send. Memory
/// buffers go out via scatter/gather `writev`; file buffers go out via
/// `sendfile(2)` directly to the connection's fd, one buffer at a time
/// (nginx additionally coalesces adjacent same-file ranges into a single
/// `sendfile` call; we compute that merged extent via
/// [`chain_coalesce_file`](crate::chain::chain_coalesce_file) only to size
/// the write, since Rust's `TcpStream` offers no raw fd splice primitive
/// beyond the single-call syscall wrapper below).
pub fn send_chain(stream: &mut TcpStream, chain: &Chain, limit: u64) -> io::Result<u64> {
    let mut sent = 0u64;
    let mut memory_bufs: Vec<&[u8]> = Vec::new();

    for buf in chain.iter() {
        if sent >= limit {
            break;
        }
        if buf.flags.in_file {
            if !memory_bufs.is_empty() {
                sent += flush_memory(stream, &memory_bufs)?;
                memory_bufs.clear();
            }
            sent += sendfile_buf(stream, buf, limit - sent)?;
        } else {
            memory_bufs.push(buf.as_slice());
        }
    }
    if !memory_bufs.is_empty() {
        sent += flush_memory(stream, &memory_bufs)?;
    }
    Ok(sent)
}

fn flush_memory(stream: &mut TcpStream, bufs: &[&[u8]]) -> io::Result<u64> {
    let slices: Vec<IoSlice<'_>> = bufs.iter().map(|b| IoSlice::new(b)).collect();
    let n = stream.write_vectored(&slices)?;
    Ok(n as u64)
}

fn sendfile_buf(stream: &TcpStream, buf: &Buf, limit: u64) -> io::Result<u64> {
    let file = buf.file.as_ref().expect("in_file buffer without a handle");
    let mut offset = buf.file_pos as libc::off_t;
    let want = buf.size().min(limit) as usize;
    let n = unsafe { libc::sendfile(stream.as_raw_fd(), file.fd, &mut offset, want) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as u64)
}

/// The postpone filter (§4.8): preserves subrequest output ordering. Each
/// subrequest registers in source order via [`begin`](PostponeFilter::begin);
/// output submitted out of turn is buffered until the subrequests ahead of it
/// have all submitted theirs.
///
/// Simplification: this models one "submit the subrequest's complete output"
/// call per registered id rather than nginx's arbitrary number of partial
/// writes per subrequest — sufficient to preserve the pre-order byte
/// sequencing §8 tests, without threading a full subrequest tree (out of
/// scope per §1's content-layer boundary).
#[derive(Default)]
pub struct PostponeFilter {
    next_id: usize,
    order: std::collections::VecDeque<usize>,
    pending: std::collections::HashMap<usize, Chain>,
    pub out: Chain,
}

impl PostponeFilter {
    pub fn new() -> PostponeFilter {
        PostponeFilter::default()
    }

    /// Register a new subrequest in source order, returning its id.
    pub fn begin(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.order.push_back(id);
        id
    }

    /// Submit `id`'s complete output. If it's at the front of the order,
    /// flush it (and anything already buffered behind it, in order);
    /// otherwise buffer it until its turn.
    pub fn submit(&mut self, id: usize, chain: Chain) {
        if self.order.front() != Some(&id) {
            self.pending.insert(id, chain);
            return;
        }
        self.order.pop_front();
        self.out.append(chain);
        while let Some(&next) = self.order.front() {
            match self.pending.remove(&next) {
                Some(buffered) => {
                    self.order.pop_front();
                    self.out.append(buffered);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufFlags;

    #[test]
    fn postpone_filter_preserves_source_order_despite_late_submission() {
        let mut filter = PostponeFilter::new();
        let s1 = filter.begin();
        let s2 = filter.begin();

        let mut b_chain = Chain::new();
        let mut b_buf = Buf::new_temp(1);
        b_buf.last = 1;
        b_buf.as_mut_slice().unwrap()[0] = b'B';
        b_chain.push_back(b_buf);
        filter.submit(s2, b_chain);
        assert!(filter.out.is_empty(), "S2 is not yet at the front of order");

        let mut a_chain = Chain::new();
        let mut a_buf = Buf::new_temp(1);
        a_buf.last = 1;
        a_buf.as_mut_slice().unwrap()[0] = b'A';
        a_chain.push_back(a_buf);
        filter.submit(s1, a_chain);

        let bytes: Vec<u8> = filter
            .out
            .iter()
            .flat_map(|b| b.as_slice().to_vec())
            .collect();
        assert_eq!(bytes, b"AB");
    }

    #[test]
    fn output_chain_respects_bufs_num_quota() {
        let mut ctx = OutputChainCtx::new(1, 64);
        let mut input = Chain::new();
        let mut a = Buf::new_temp(8);
        a.last = 8;
        let mut b = Buf::new_temp(8);
        b.last = 8;
        input.push_back(a);
        input.push_back(b);

        match output_chain(&mut ctx, input) {
            Code::Again => {}
            other => panic!("expected Again once quota exceeded, got {other:?}"),
        }
    }

    #[test]
    fn output_chain_passes_through_plain_memory_buffers() {
        let mut ctx = OutputChainCtx::new(8, 64);
        let mut input = Chain::new();
        let mut a = Buf::new_control(BufFlags {
            last_buf: true,
            ..Default::default()
        });
        a.flags.last_buf = true;
        input.push_back(a);

        match output_chain(&mut ctx, input) {
            Code::Ok(out) => assert_eq!(out.len(), 1),
            other => panic!("expected Ok, got {other:?}"),
        }
    }
}
