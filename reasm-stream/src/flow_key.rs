#![forbid(unsafe_code)]

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// Which way a segment travels relative to its [`FlowKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Direction {
    /// From the key's lower endpoint to its upper endpoint.
    Forward,
    /// From the key's upper endpoint to its lower endpoint.
    Reverse,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Forward, Direction::Reverse];

    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "fwd"),
            Direction::Reverse => write!(f, "rev"),
        }
    }
}

/// Direction-normalized identifier of one TCP connection.
///
/// Endpoints are stored ordered, so both halves of a connection produce the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    lower: SocketAddr,
    upper: SocketAddr,
}

impl FlowKey {
    /// Key for the connection between `a` and `b`, regardless of argument order.
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        Self::from_endpoints(a, b).0
    }

    /// Key plus the direction a segment from `src` to `dst` travels in.
    pub fn from_endpoints(src: SocketAddr, dst: SocketAddr) -> (Self, Direction) {
        if src <= dst {
            (Self { lower: src, upper: dst }, Direction::Forward)
        } else {
            (Self { lower: dst, upper: src }, Direction::Reverse)
        }
    }

    pub fn lower(&self) -> SocketAddr {
        self.lower
    }

    pub fn upper(&self) -> SocketAddr {
        self.upper
    }

    /// `(src, dst)` of traffic travelling in `dir`.
    pub fn endpoints(&self, dir: Direction) -> (SocketAddr, SocketAddr) {
        match dir {
            Direction::Forward => (self.lower, self.upper),
            Direction::Reverse => (self.upper, self.lower),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn both_directions_share_a_key() {
        let client = addr("10.0.0.1:40000");
        let server = addr("10.0.0.2:80");

        let (k1, d1) = FlowKey::from_endpoints(client, server);
        let (k2, d2) = FlowKey::from_endpoints(server, client);

        assert_eq!(k1, k2);
        assert_ne!(d1, d2);
        assert_eq!(k1.endpoints(d1), (client, server));
        assert_eq!(k2.endpoints(d2), (server, client));
    }

    #[test]
    fn ports_distinguish_connections() {
        let a = FlowKey::new(addr("10.0.0.1:1111"), addr("10.0.0.2:80"));
        let b = FlowKey::new(addr("10.0.0.1:2222"), addr("10.0.0.2:80"));
        assert_ne!(a, b);
    }

    #[test]
    fn v6_endpoints() {
        let (key, dir) = FlowKey::from_endpoints(addr("[::1]:8080"), addr("[::1]:443"));
        assert_eq!(dir, Direction::Reverse);
        assert_eq!(key.lower(), addr("[::1]:443"));
    }

    #[test]
    fn direction_indices() {
        assert_eq!(Direction::Forward.index(), 0);
        assert_eq!(Direction::Reverse.index(), 1);
        assert_eq!(Direction::Forward.reverse(), Direction::Reverse);
    }
}
