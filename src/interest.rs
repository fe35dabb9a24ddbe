use std::fmt;
use std::num::NonZeroU8;
use std::ops::{BitOr, BitOrAssign};

const READABLE: u8 = 0b0001;
const WRITABLE: u8 = 0b0010;
const EDGE: u8 = 0b0100;
const ONESHOT: u8 = 0b1000;

/// Readiness event interest, along with the triggering mode the notifier (C6)
/// should use.
///
/// `Interest` values are combined with `|`, mirroring mio's `Interest`. The
/// `ClEAR`/one-shot bits are not part of upstream mio's `Interest` type (mio
/// always registers level-triggered unless the backend forces edge); they are
/// added here because §4.5 requires the notifier to expose `LEVEL`, `CLEAR`
/// (edge), and `ONESHOT` as explicit, per-registration modes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(NonZeroU8);

impl Interest {
    pub const READABLE: Interest = Interest(match NonZeroU8::new(READABLE) {
        Some(v) => v,
        None => unreachable!(),
    });
    pub const WRITABLE: Interest = Interest(match NonZeroU8::new(WRITABLE) {
        Some(v) => v,
        None => unreachable!(),
    });
    /// Edge-triggered mode (the "CLEAR" flag of §4.5's `add`/`del` contract).
    pub const EDGE: Interest = Interest(match NonZeroU8::new(EDGE) {
        Some(v) => v,
        None => unreachable!(),
    });
    /// Automatically deregister after the first readiness notification.
    pub const ONESHOT: Interest = Interest(match NonZeroU8::new(ONESHOT) {
        Some(v) => v,
        None => unreachable!(),
    });

    pub const fn is_readable(self) -> bool {
        self.0.get() & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0.get() & WRITABLE != 0
    }

    pub const fn is_edge(self) -> bool {
        self.0.get() & EDGE != 0
    }

    pub const fn is_oneshot(self) -> bool {
        self.0.get() & ONESHOT != 0
    }

    pub const fn add(self, other: Interest) -> Interest {
        Interest(unsafe { NonZeroU8::new_unchecked(self.0.get() | other.0.get()) })
    }

    pub(crate) const fn as_u8(self) -> u8 {
        self.0.get()
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.add(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.add(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        macro_rules! one {
            ($bit:expr, $name:expr) => {
                if self.0.get() & $bit != 0 {
                    if !first {
                        write!(f, " | ")?;
                    }
                    write!(f, $name)?;
                    first = false;
                }
            };
        }
        one!(READABLE, "READABLE");
        one!(WRITABLE, "WRITABLE");
        one!(EDGE, "EDGE");
        one!(ONESHOT, "ONESHOT");
        Ok(())
    }
}
