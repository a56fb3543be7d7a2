#![forbid(unsafe_code)]

//! JSON-lines traces of decoded segments.
//!
//! One object per line:
//! `{"ts":"2024-05-01T10:00:00.000001Z","src":"10.0.0.1:4000","dst":"10.0.0.2:80","seq":1,"flags":"PA","payload":"68656c6c6f"}`
//! `flags` uses tcpdump letters (`S` `F` `R` `P` `U`, with `A` or `.` for ACK). `payload` is hex.
//! `len` optionally states the header-declared payload length. A record without `ts` inherits
//! the timestamp of the record before it. Blank lines and lines starting with `#` are skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::debug;

use reasm_stream::{Segment, SourceId, TcpFlags};

use crate::error::CaptureError;
use crate::source::CaptureSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u32>,
}

pub fn parse_flags(s: &str) -> Result<TcpFlags, String> {
    let mut flags = TcpFlags::empty();
    for c in s.chars() {
        flags |= match c.to_ascii_uppercase() {
            'F' => TcpFlags::FIN,
            'S' => TcpFlags::SYN,
            'R' => TcpFlags::RST,
            'P' => TcpFlags::PSH,
            'A' | '.' => TcpFlags::ACK,
            'U' => TcpFlags::URG,
            other => return Err(format!("unknown TCP flag {other:?}")),
        };
    }
    Ok(flags)
}

pub fn format_flags(flags: TcpFlags) -> String {
    [
        (TcpFlags::SYN, 'S'),
        (TcpFlags::FIN, 'F'),
        (TcpFlags::RST, 'R'),
        (TcpFlags::PSH, 'P'),
        (TcpFlags::URG, 'U'),
        (TcpFlags::ACK, 'A'),
    ]
    .iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, c)| *c)
    .collect()
}

impl SegmentRecord {
    pub fn from_segment(segment: &Segment) -> Self {
        let declared = segment.payload_len();
        Self {
            ts: Some(DateTime::<Utc>::from(segment.timestamp())),
            src: segment.src(),
            dst: segment.dst(),
            seq: segment.seq().0,
            flags: format_flags(segment.flags()),
            payload: hex::encode(segment.payload()),
            len: (declared as usize != segment.payload().len()).then_some(declared),
        }
    }

    pub fn into_segment(self, source: SourceId) -> Result<Segment, String> {
        let flags = parse_flags(&self.flags)?;
        let payload = hex::decode(self.payload.trim()).map_err(|e| format!("payload: {e}"))?;
        let mut segment = Segment::new(self.src, self.dst, self.seq, flags, payload).with_source(source);
        if let Some(ts) = self.ts {
            segment = segment.with_timestamp(SystemTime::from(ts));
        }
        if let Some(len) = self.len {
            segment = segment.with_declared_len(len);
        }
        Ok(segment)
    }
}

/// Replays a JSON-lines trace file.
pub struct TraceSource {
    id: SourceId,
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    last_ts: Option<SystemTime>,
}

impl TraceSource {
    pub async fn open(id: SourceId, path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        debug!(path = %path.display(), %id, "opened trace");
        Ok(Self {
            id,
            path,
            lines: BufReader::new(file).lines(),
            line_no: 0,
            last_ts: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CaptureSource for TraceSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn next_segment(&mut self) -> Result<Option<Segment>, CaptureError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record: SegmentRecord = serde_json::from_str(line).map_err(|source| CaptureError::Decode {
                line: self.line_no,
                source,
            })?;
            let stamped = record.ts.is_some();
            let mut segment = record
                .into_segment(self.id)
                .map_err(|reason| CaptureError::InvalidRecord {
                    line: self.line_no,
                    reason,
                })?;
            match (stamped, self.last_ts) {
                (true, _) => self.last_ts = Some(segment.timestamp()),
                (false, Some(ts)) => segment = segment.with_timestamp(ts),
                (false, None) => {}
            }
            return Ok(Some(segment));
        }
        Ok(None)
    }
}
