//! §6: output formats the core emits to the content layer — CRC32, MD5/SHA1,
//! base64, and percent-escaping. §1 scopes the underlying algorithms out as
//! "leaf libraries with well-known semantics"; this module is the thin,
//! core-facing wrapper around real crates for them (`crc32fast`, `md5`,
//! `sha1`, `base64` — the last of which two pack members already depend on).

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

pub fn sha1_hex(data: &[u8]) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn base64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}

pub fn base64_url_encode(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

pub fn base64_url_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE.decode(data)
}

/// Which characters a percent-escape pass must protect, selected by the
/// context the escaped text is destined for (§6: "URI/ARGS/HTML/JSON/etc.
/// variants selected by a small enum").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeKind {
    Uri,
    Args,
    UriComponent,
    Html,
    RefreshUri,
    MemcachedKey,
    MailAuth,
    Json,
}

fn needs_escape(byte: u8, kind: EscapeKind) -> bool {
    let is_unreserved = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~');
    match kind {
        EscapeKind::Uri | EscapeKind::RefreshUri => {
            !is_unreserved && !matches!(byte, b'/' | b':' | b'?' | b'#' | b'[' | b']' | b'@')
        }
        EscapeKind::UriComponent | EscapeKind::MemcachedKey | EscapeKind::MailAuth => {
            !is_unreserved
        }
        EscapeKind::Args => !is_unreserved && byte != b'/' && byte != b'&' && byte != b'=',
        EscapeKind::Html => matches!(byte, b'<' | b'>' | b'&' | b'"' | b'\''),
        EscapeKind::Json => matches!(byte, b'"' | b'\\') || byte < 0x20,
    }
}

/// Percent-escape (or, for `Html`, entity-escape) `input` for `kind`.
pub fn percent_escape(input: &[u8], kind: EscapeKind) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if !needs_escape(b, kind) {
            out.push(b as char);
        } else if kind == EscapeKind::Html {
            match b {
                b'<' => out.push_str("&lt;"),
                b'>' => out.push_str("&gt;"),
                b'&' => out.push_str("&amp;"),
                b'"' => out.push_str("&quot;"),
                b'\'' => out.push_str("&#39;"),
                _ => unreachable!(),
            }
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Percent-decode (inverse of [`percent_escape`] for the URI-family kinds;
/// `Html`/`Json` are not round-tripped here since this crate does not parse
/// those content types).
pub fn percent_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vectors() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            sha1_hex(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn base64_round_trip_standard_and_url_safe() {
        let data = b"hello, veyrond! \xff\xfe";
        assert_eq!(base64_decode(&base64_encode(data)).unwrap(), data);
        assert_eq!(
            base64_url_decode(&base64_url_encode(data)).unwrap(),
            data
        );
    }

    #[test]
    fn percent_escape_then_decode_is_idempotent_on_safe_input() {
        let safe = b"already-safe_path.txt~1";
        let escaped = percent_escape(safe, EscapeKind::Uri);
        assert_eq!(escaped.as_bytes(), safe);
        assert_eq!(percent_decode(&escaped), safe);
    }

    #[test]
    fn percent_escape_round_trips_unsafe_bytes() {
        let raw = b"a b/c?d";
        let escaped = percent_escape(raw, EscapeKind::UriComponent);
        assert_eq!(percent_decode(&escaped), raw);
    }

    #[test]
    fn html_escape_covers_the_five_entities() {
        assert_eq!(
            percent_escape(b"<a href=\"x\">'&'</a>", EscapeKind::Html),
            "&lt;a href=&quot;x&quot;&gt;&#39;&amp;&#39;&lt;/a&gt;"
        );
    }
}
