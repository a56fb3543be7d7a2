#![forbid(unsafe_code)]

//! Capture sources: anything that yields decoded segments.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::mpsc;

use reasm_stream::{Segment, SourceId};

use crate::error::CaptureError;

/// Producer of decoded TCP segments for one capture point.
///
/// `Ok(None)` means the source is exhausted. An `Err` ends the source; other sources keep running.
#[async_trait]
pub trait CaptureSource: Send + 'static {
    fn id(&self) -> SourceId;

    /// Human-readable label used in logs and reports.
    fn describe(&self) -> String {
        self.id().to_string()
    }

    async fn next_segment(&mut self) -> Result<Option<Segment>, CaptureError>;
}

/// Replays a fixed list of segments.
#[derive(Debug)]
pub struct ReplaySource {
    id: SourceId,
    segments: VecDeque<Segment>,
}

impl ReplaySource {
    pub fn new(id: SourceId, segments: impl IntoIterator<Item = Segment>) -> Self {
        Self {
            id,
            segments: segments.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.segments.len()
    }
}

#[async_trait]
impl CaptureSource for ReplaySource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.id.0)
    }

    async fn next_segment(&mut self) -> Result<Option<Segment>, CaptureError> {
        Ok(self.segments.pop_front())
    }
}

/// Sending half handed to an external capture driver.
#[derive(Debug, Clone)]
pub struct SegmentSender {
    tx: mpsc::Sender<Result<Segment, CaptureError>>,
}

impl SegmentSender {
    /// Waits while the source's buffer is full.
    pub async fn send(&self, segment: Segment) -> Result<(), CaptureError> {
        self.tx
            .send(Ok(segment))
            .await
            .map_err(|_| CaptureError::ChannelClosed)
    }

    /// Report a driver failure; the source ends with this error.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), CaptureError> {
        self.tx
            .send(Err(CaptureError::Driver(reason.into())))
            .await
            .map_err(|_| CaptureError::ChannelClosed)
    }
}

/// Source fed through a channel. It is exhausted once every [`SegmentSender`] is dropped.
#[derive(Debug)]
pub struct ChannelSource {
    id: SourceId,
    rx: mpsc::Receiver<Result<Segment, CaptureError>>,
}

impl ChannelSource {
    pub fn new(id: SourceId, capacity: usize) -> (SegmentSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (SegmentSender { tx }, Self { id, rx })
    }
}

#[async_trait]
impl CaptureSource for ChannelSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn describe(&self) -> String {
        format!("channel:{}", self.id.0)
    }

    async fn next_segment(&mut self) -> Result<Option<Segment>, CaptureError> {
        self.rx.recv().await.transpose()
    }
}
