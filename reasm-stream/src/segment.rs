#![forbid(unsafe_code)]

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

use crate::errors::SegmentError;
use crate::flow_key::{Direction, FlowKey};
use crate::seq::Seq;

bitflags! {
    /// TCP control bits carried by a segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Identifier of the capture source a segment was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SourceId(pub u16);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source-{}", self.0)
    }
}

/// One decoded TCP segment.
///
/// Built once by a capture source and moved through the pipeline; there are no setters.
#[derive(Debug, Clone)]
pub struct Segment {
    key: FlowKey,
    direction: Direction,
    seq: Seq,
    declared_len: u32,
    flags: TcpFlags,
    payload: Bytes,
    source: SourceId,
    timestamp: SystemTime,
}

impl Segment {
    pub fn new(
        src: SocketAddr,
        dst: SocketAddr,
        seq: u32,
        flags: TcpFlags,
        payload: impl Into<Bytes>,
    ) -> Self {
        let (key, direction) = FlowKey::from_endpoints(src, dst);
        let payload = payload.into();
        Self {
            key,
            direction,
            seq: Seq(seq),
            declared_len: payload.len().min(u32::MAX as usize) as u32,
            flags,
            payload,
            source: SourceId::default(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_source(mut self, source: SourceId) -> Self {
        self.source = source;
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Payload length as stated by the decoded headers, which may disagree with the bytes carried.
    pub fn with_declared_len(mut self, declared_len: u32) -> Self {
        self.declared_len = declared_len;
        self
    }

    pub fn flow_key(&self) -> &FlowKey {
        &self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn src(&self) -> SocketAddr {
        self.key.endpoints(self.direction).0
    }

    pub fn dst(&self) -> SocketAddr {
        self.key.endpoints(self.direction).1
    }

    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Sequence number of the first payload byte. A SYN occupies one sequence number.
    pub fn data_seq(&self) -> Seq {
        if self.flags.contains(TcpFlags::SYN) {
            self.seq + 1
        } else {
            self.seq
        }
    }

    pub fn payload_len(&self) -> u32 {
        self.declared_len
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn flags(&self) -> TcpFlags {
        self.flags
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Check that header fields and payload agree.
    pub fn validate(&self) -> Result<(), SegmentError> {
        if self.payload.len() > i32::MAX as usize {
            return Err(SegmentError::Oversized(self.payload.len()));
        }
        if self.declared_len as usize != self.payload.len() {
            return Err(SegmentError::LengthMismatch {
                declared: self.declared_len,
                actual: self.payload.len(),
            });
        }
        if self.flags.contains(TcpFlags::SYN | TcpFlags::RST) {
            return Err(SegmentError::ContradictoryFlags("SYN+RST"));
        }
        if self.flags.contains(TcpFlags::SYN | TcpFlags::FIN) {
            return Err(SegmentError::ContradictoryFlags("SYN+FIN"));
        }
        Ok(())
    }
}
