//! §7: error handling design.
//!
//! Every call site that can fail returns a three- (or four-) valued code
//! rather than throwing: `Ok`, `Again` (would-block, try later), `Error`
//! (fatal for this request/connection), and `Declined` ("not my turn, ask
//! the next handler"). `Code<T>` carries that shape; `Kind` distinguishes
//! the categories of §7's table so a caller can decide whether to retry,
//! surface, or abort.

use std::fmt;
use std::io;

/// The category of a fatal (`Code::Error`) outcome.
#[derive(Debug, thiserror::Error)]
pub enum Kind {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("allocation failure")]
    OutOfMemory,

    #[error("connection reset or timed out")]
    ConnectionClosed,

    #[error("upstream or resolver failure: {0}")]
    Upstream(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// The four-valued propagation code of §7.
#[derive(Debug)]
pub enum Code<T> {
    Ok(T),
    /// Would block; the caller should rearm its event and retry later.
    Again,
    Error(Kind),
    /// Not this handler's turn; try the next one in the chain.
    Declined,
}

impl<T> Code<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Code::Ok(_))
    }

    pub fn is_again(&self) -> bool {
        matches!(self, Code::Again)
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Code::Ok(v) => Some(v),
            _ => None,
        }
    }

    /// Map a leaf `io::Result` onto `Code`, treating `EAGAIN`/`EINTR` as
    /// `Again` rather than `Error` (§7: "locally recovered, never surfaced").
    pub fn from_io(result: io::Result<T>) -> Code<T> {
        match result {
            Ok(v) => Code::Ok(v),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Code::Again
            }
            Err(e) => Code::Error(Kind::Io(e)),
        }
    }
}

impl<T> fmt::Display for Code<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Ok(_) => write!(f, "ok"),
            Code::Again => write!(f, "again"),
            Code::Error(k) => write!(f, "error: {k}"),
            Code::Declined => write!(f, "declined"),
        }
    }
}

/// The boundary a protocol layer (out of scope) would implement to turn an
/// allocation failure or upstream error into its own status code (HTTP 500,
/// SMTP 421, ...). The core calls into this trait but ships no
/// implementation of it, since the content layer is explicitly external
/// (§1).
pub trait ErrorSink {
    fn report(&mut self, kind: &Kind);
}

/// A no-op sink for tests and embedders that don't care to observe errors.
#[derive(Debug, Default)]
pub struct DiscardErrors;

impl ErrorSink for DiscardErrors {
    fn report(&mut self, _kind: &Kind) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_becomes_again_not_error() {
        let res: io::Result<()> = Err(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(Code::from_io(res).is_again());
    }

    #[test]
    fn other_io_errors_become_error() {
        let res: io::Result<()> = Err(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(Code::from_io(res), Code::Error(Kind::Io(_))));
    }
}
