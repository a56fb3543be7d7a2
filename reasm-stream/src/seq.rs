//! TCP sequence-number arithmetic.
//! Sequence numbers live in a modulo 2^32 space, so ordering is decided by the
//! signed distance between two values rather than by integer comparison.

#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Add;

/// A 32-bit TCP sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(pub u32);

impl Seq {
    /// Signed distance from `other` to `self`. Positive when `self` is after `other`.
    pub fn distance(self, other: Seq) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    pub fn is_before(self, other: Seq) -> bool {
        self.distance(other) < 0
    }

    pub fn is_after(self, other: Seq) -> bool {
        self.distance(other) > 0
    }

    pub fn wrapping_add(self, n: u32) -> Seq {
        Seq(self.0.wrapping_add(n))
    }
}

impl Add<u32> for Seq {
    type Output = Seq;

    fn add(self, rhs: u32) -> Seq {
        self.wrapping_add(rhs)
    }
}

impl From<u32> for Seq {
    fn from(v: u32) -> Self {
        Seq(v)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
