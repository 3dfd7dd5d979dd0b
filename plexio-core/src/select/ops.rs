//! Interest and readiness operation sets.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub};

use crate::sys::Interest;

/// A set of channel operations: a subset of {ACCEPT, CONNECT, READ, WRITE}.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(1 << 0);
    pub const WRITE: Ops = Ops(1 << 2);
    pub const CONNECT: Ops = Ops(1 << 3);
    pub const ACCEPT: Ops = Ops(1 << 4);

    const ALL: u8 = Self::READ.0 | Self::WRITE.0 | Self::CONNECT.0 | Self::ACCEPT.0;

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds a set from raw bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u8) -> Ops {
        Ops(bits & Self::ALL)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every operation in `other` is in `self`.
    pub const fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the sets share an operation.
    pub const fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Self::READ)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }

    pub fn is_acceptable(self) -> bool {
        self.intersects(Self::ACCEPT)
    }

    pub fn is_connectable(self) -> bool {
        self.intersects(Self::CONNECT)
    }

    /// Platform interest: ACCEPT and READ wait for readability, CONNECT and
    /// WRITE for writability.
    pub(crate) fn to_interest(self) -> Interest {
        Interest {
            readable: self.intersects(Self::READ | Self::ACCEPT),
            writable: self.intersects(Self::WRITE | Self::CONNECT),
        }
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Ops) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Ops {
    type Output = Ops;

    fn bitand(self, rhs: Ops) -> Ops {
        Ops(self.0 & rhs.0)
    }
}

impl BitAndAssign for Ops {
    fn bitand_assign(&mut self, rhs: Ops) {
        self.0 &= rhs.0;
    }
}

impl Sub for Ops {
    type Output = Ops;

    fn sub(self, rhs: Ops) -> Ops {
        Ops(self.0 & !rhs.0)
    }
}

impl fmt::Display for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (Self::ACCEPT, "ACCEPT"),
            (Self::CONNECT, "CONNECT"),
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
        ];
        let mut first = true;
        for (op, name) in names {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ops({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_algebra() {
        let rw = Ops::READ | Ops::WRITE;
        assert!(rw.contains(Ops::READ));
        assert!(!rw.contains(Ops::READ | Ops::ACCEPT));
        assert!(rw.intersects(Ops::WRITE | Ops::ACCEPT));
        assert_eq!(rw & Ops::WRITE, Ops::WRITE);
        assert_eq!(rw - Ops::READ, Ops::WRITE);
        assert!((rw & Ops::ACCEPT).is_empty());
        assert_eq!(Ops::from_bits_truncate(0xFF).bits(), 0b0001_1101);
    }

    #[test]
    fn test_display() {
        assert_eq!(Ops::NONE.to_string(), "NONE");
        assert_eq!((Ops::WRITE | Ops::READ).to_string(), "READ|WRITE");
        assert_eq!(format!("{:?}", Ops::ACCEPT), "Ops(ACCEPT)");
    }

    #[test]
    fn test_platform_interest() {
        let interest = (Ops::ACCEPT).to_interest();
        assert!(interest.readable && !interest.writable);
        let interest = (Ops::CONNECT | Ops::READ).to_interest();
        assert!(interest.readable && interest.writable);
        assert_eq!(Ops::NONE.to_interest(), Interest::default());
    }
}
