/// Associates readiness events with an [`event::Source`](crate::event::Source).
///
/// `Token` is a wrapper around `usize` chosen by the caller when registering
/// a source with a [`Notifier`](crate::notifier::Notifier). The notifier
/// attaches the token to every [`Event`](crate::event::Event) it produces for
/// that source so the caller can look up which connection or listener the
/// event belongs to without a syscall.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Token(pub usize);

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}
