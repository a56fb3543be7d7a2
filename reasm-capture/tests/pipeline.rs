use async_trait::async_trait;
use reasm_capture::{
    CaptureError, CaptureSource, Pipeline, ReplaySource, SegmentRecord, SourceOutcome, TraceSource,
};
use reasm_core::{PipelineConfig, ReassemblyConfig};
use reasm_stream::{
    CollectingConsumer, CompletionReason, Direction, FlowKey, Reassembler, Segment, SourceId, TcpFlags,
};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SERVER: &str = "172.16.0.1:8080";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn seg(client: &str, seq: u32, flags: TcpFlags, data: &[u8]) -> Segment {
    Segment::new(addr(client), addr(SERVER), seq, flags, data.to_vec())
}

fn engine() -> Arc<Reassembler<Arc<CollectingConsumer>>> {
    Arc::new(Reassembler::new(ReassemblyConfig::default(), Arc::new(CollectingConsumer::new())).unwrap())
}

fn forward(client: &str) -> (FlowKey, Direction) {
    let key = FlowKey::new(addr(client), addr(SERVER));
    let dir = if key.lower() == addr(client) {
        Direction::Forward
    } else {
        Direction::Reverse
    };
    (key, dir)
}

/// Counts pulls and fails after a fixed number of segments.
struct FlakySource {
    id: SourceId,
    queue: Vec<Segment>,
    pulled: Arc<AtomicUsize>,
    fail_after: Option<usize>,
}

#[async_trait]
impl CaptureSource for FlakySource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn next_segment(&mut self) -> Result<Option<Segment>, CaptureError> {
        let n = self.pulled.fetch_add(1, Ordering::SeqCst);
        if self.fail_after == Some(n) {
            return Err(CaptureError::Driver("link lost".to_string()));
        }
        if self.queue.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.queue.remove(0)))
    }
}

#[tokio::test]
async fn same_connection_on_three_sources_is_reassembled_once() {
    let client = "172.16.0.9:50000";
    let segments = vec![
        seg(client, 99, TcpFlags::SYN, b""),
        seg(client, 100, TcpFlags::ACK, b"GET / "),
        seg(client, 106, TcpFlags::ACK, b"HTTP/1.1\r\n"),
        seg(client, 116, TcpFlags::PSH | TcpFlags::ACK, b"\r\n"),
    ];

    let engine = engine();
    let mut pipeline = Pipeline::new(Arc::clone(&engine), PipelineConfig::default()).unwrap();
    for id in 0..3u16 {
        let mut copy = segments.clone();
        // Each capture point sees its own arrival order.
        copy.rotate_left(id as usize);
        pipeline.add_source(ReplaySource::new(SourceId(id), copy));
    }
    let report = pipeline.start().join().await;

    let (key, dir) = forward(client);
    assert_eq!(engine.consumer().stream(&key, dir), b"GET / HTTP/1.1\r\n\r\n".to_vec());
    assert_eq!(report.segments_queued, 12);
    assert!(report.failed_sources().next().is_none());
    assert_eq!(report.stats.segments_duplicate, 6);
    assert_eq!(engine.consumer().completions(&key), vec![CompletionReason::Shutdown]);
}

#[tokio::test]
async fn full_queue_suspends_the_source() {
    let engine = engine();
    let config = PipelineConfig {
        queue_capacity: 2,
        ..PipelineConfig::default()
    };
    let pulled = Arc::new(AtomicUsize::new(0));
    let client = "172.16.0.5:40000";
    let queue: Vec<Segment> = (0..20u32).map(|i| seg(client, i * 4, TcpFlags::ACK, b"abcd")).collect();

    let mut pipeline = Pipeline::new(Arc::clone(&engine), config).unwrap();
    pipeline.add_source(FlakySource {
        id: SourceId(1),
        queue,
        pulled: Arc::clone(&pulled),
        fail_after: None,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Two queued plus one waiting to be sent.
    assert_eq!(pulled.load(Ordering::SeqCst), 3);

    let report = pipeline.start().join().await;
    assert_eq!(report.sources[0].segments, 20);
    assert_eq!(report.sources[0].outcome, SourceOutcome::Exhausted);
    let (key, dir) = forward(client);
    assert_eq!(engine.consumer().stream(&key, dir).len(), 80);
}

#[tokio::test]
async fn failing_source_does_not_disturb_others() {
    let engine = engine();
    let mut pipeline = Pipeline::new(Arc::clone(&engine), PipelineConfig::default()).unwrap();

    let flaky_client = "172.16.0.2:1111";
    pipeline.add_source(FlakySource {
        id: SourceId(1),
        queue: vec![
            seg(flaky_client, 0, TcpFlags::ACK, b"one"),
            seg(flaky_client, 3, TcpFlags::ACK, b"two"),
            seg(flaky_client, 6, TcpFlags::ACK, b"three"),
        ],
        pulled: Arc::new(AtomicUsize::new(0)),
        fail_after: Some(2),
    });
    let steady_client = "172.16.0.3:2222";
    pipeline.add_source(ReplaySource::new(
        SourceId(2),
        vec![
            seg(steady_client, 10, TcpFlags::ACK, b"alpha"),
            seg(steady_client, 15, TcpFlags::FIN | TcpFlags::ACK, b"beta"),
        ],
    ));
    let report = pipeline.start().join().await;

    let flaky = report.sources.iter().find(|s| s.source == SourceId(1)).unwrap();
    assert!(matches!(&flaky.outcome, SourceOutcome::Failed(msg) if msg.contains("link lost")));
    assert_eq!(flaky.segments, 2);
    let steady = report.sources.iter().find(|s| s.source == SourceId(2)).unwrap();
    assert_eq!(steady.outcome, SourceOutcome::Exhausted);

    let (key, dir) = forward(flaky_client);
    assert_eq!(engine.consumer().stream(&key, dir), b"onetwo".to_vec());
    assert_eq!(engine.consumer().completions(&key), vec![CompletionReason::Shutdown]);
    let (key, dir) = forward(steady_client);
    assert_eq!(engine.consumer().stream(&key, dir), b"alphabeta".to_vec());
    assert_eq!(engine.consumer().completions(&key), vec![CompletionReason::Fin]);
}

#[tokio::test]
async fn trace_files_feed_the_pipeline() {
    let client = "172.16.0.7:3333";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for s in [
        seg(client, 0, TcpFlags::SYN, b""),
        seg(client, 7, TcpFlags::ACK, b"world"),
        seg(client, 1, TcpFlags::ACK, b"hello "),
        seg(client, 12, TcpFlags::FIN | TcpFlags::ACK, b""),
    ] {
        writeln!(file, "{}", serde_json::to_string(&SegmentRecord::from_segment(&s)).unwrap()).unwrap();
    }

    let engine = engine();
    let mut pipeline = Pipeline::new(Arc::clone(&engine), PipelineConfig::default()).unwrap();
    pipeline.add_source(TraceSource::open(SourceId(5), file.path()).await.unwrap());
    let report = pipeline.start().join().await;

    let (key, dir) = forward(client);
    assert_eq!(engine.consumer().stream(&key, dir), b"hello world".to_vec());
    assert_eq!(engine.consumer().completions(&key), vec![CompletionReason::Fin]);
    assert_eq!(report.sources[0].name, file.path().display().to_string());
    assert_eq!(report.flows_flushed_at_shutdown, 0);
}

#[tokio::test]
async fn report_serializes_for_the_driver() {
    let engine = engine();
    let mut pipeline = Pipeline::new(Arc::clone(&engine), PipelineConfig::default()).unwrap();
    pipeline.add_source(ReplaySource::new(SourceId(0), Vec::new()));
    let report = pipeline.start().join().await;

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["sources"][0]["outcome"]["status"], "exhausted");
    assert_eq!(json["stats"]["segments_ingested"], 0);
}
