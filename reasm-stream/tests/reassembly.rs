use bytes::Bytes;
use reasm_core::ReassemblyConfig;
use reasm_stream::{
    CollectingConsumer, CompletionReason, Direction, FlowKey, Reassembler, Segment, SourceId, TcpFlags,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn payload(seq: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seq as usize + i) as u8).collect()
}

fn seg(src: &str, dst: &str, seq: u32, flags: TcpFlags, len: usize) -> Segment {
    Segment::new(addr(src), addr(dst), seq, flags, payload(seq, len))
}

fn new_engine(config: ReassemblyConfig) -> (Reassembler<Arc<CollectingConsumer>>, Arc<CollectingConsumer>) {
    let consumer = Arc::new(CollectingConsumer::new());
    let engine = Reassembler::new(config, Arc::clone(&consumer)).unwrap();
    (engine, consumer)
}

const CLIENT: &str = "192.168.1.10:51000";
const SERVER: &str = "192.168.1.20:443";

#[test]
fn bidirectional_exchange_completes_on_both_fins() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));

    engine.ingest(seg(CLIENT, SERVER, 999, TcpFlags::SYN, 0));
    engine.ingest(seg(SERVER, CLIENT, 4999, TcpFlags::SYN | TcpFlags::ACK, 0));
    engine.ingest(seg(CLIENT, SERVER, 1000, TcpFlags::ACK | TcpFlags::PSH, 20));
    engine.ingest(seg(SERVER, CLIENT, 5000, TcpFlags::ACK | TcpFlags::PSH, 40));
    engine.ingest(seg(CLIENT, SERVER, 1020, TcpFlags::FIN | TcpFlags::ACK, 0));
    assert!(consumer.completions(&key).is_empty());
    engine.ingest(seg(SERVER, CLIENT, 5040, TcpFlags::FIN | TcpFlags::ACK, 0));

    let (client_dir, server_dir) = if addr(CLIENT) <= addr(SERVER) {
        (Direction::Forward, Direction::Reverse)
    } else {
        (Direction::Reverse, Direction::Forward)
    };
    assert_eq!(consumer.stream(&key, client_dir), payload(1000, 20));
    assert_eq!(consumer.stream(&key, server_dir), payload(5000, 40));
    assert_eq!(consumer.completions(&key), vec![CompletionReason::Fin]);
    assert!(engine.table().is_empty());

    // Late retransmissions after teardown do not resurrect the flow.
    engine.ingest(seg(SERVER, CLIENT, 5040, TcpFlags::ACK, 0));
    engine.ingest(seg(CLIENT, SERVER, 1000, TcpFlags::ACK | TcpFlags::PSH, 20));
    assert!(engine.table().is_empty());
    assert_eq!(consumer.completions(&key), vec![CompletionReason::Fin]);
}

#[test]
fn lagging_source_replaying_a_finished_flow_is_suppressed() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));
    let dir = key_dir(&key, CLIENT);

    let flow = [
        seg(CLIENT, SERVER, 0, TcpFlags::ACK, 10),
        seg(CLIENT, SERVER, 10, TcpFlags::FIN | TcpFlags::ACK, 0),
    ];
    for s in &flow {
        engine.ingest(s.clone().with_source(SourceId(1)));
    }
    assert_eq!(consumer.completions(&key), vec![CompletionReason::Fin]);

    for s in &flow {
        engine.ingest(s.clone().with_source(SourceId(2)));
    }
    engine.shutdown();

    assert_eq!(consumer.chunks(&key, dir), vec![(Bytes::from(payload(0, 10)), false)]);
    assert_eq!(consumer.completions(&key), vec![CompletionReason::Fin]);
    assert_eq!(engine.stats().flows_accepted, 1);
}

#[test]
fn fin_overtaking_data_from_another_source_waits_for_it() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));
    let dir = key_dir(&key, CLIENT);

    engine.ingest(seg(CLIENT, SERVER, 99, TcpFlags::SYN, 0).with_source(SourceId(1)));
    engine.ingest(seg(CLIENT, SERVER, 100, TcpFlags::ACK, 10).with_source(SourceId(1)));
    engine.ingest(seg(CLIENT, SERVER, 120, TcpFlags::FIN | TcpFlags::ACK, 0).with_source(SourceId(1)));
    assert!(consumer.completions(&key).is_empty());

    engine.ingest(seg(CLIENT, SERVER, 110, TcpFlags::ACK, 10).with_source(SourceId(2)));
    assert_eq!(consumer.stream(&key, dir), payload(100, 20));
    assert!(consumer.chunks(&key, dir).iter().all(|(_, skip)| !skip));
    assert_eq!(consumer.completions(&key), vec![CompletionReason::Fin]);
    assert!(engine.table().is_empty());
}

#[test]
fn syn_less_out_of_order_run_is_delivered_merged() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));
    let dir = key_dir(&key, CLIENT);
    let t0 = UNIX_EPOCH + Duration::from_secs(7_000);

    for seq in [10, 0, 20] {
        engine.ingest(seg(CLIENT, SERVER, seq, TcpFlags::ACK, 10).with_timestamp(t0));
        assert!(consumer.chunks(&key, dir).is_empty());
    }
    engine.flush_older_than(Duration::from_secs(60), t0 + Duration::from_secs(5));

    assert_eq!(consumer.chunks(&key, dir), vec![(Bytes::from(payload(0, 30)), false)]);
    assert_eq!(engine.stats().segments_duplicate, 0);
}

#[test]
fn same_connection_from_two_sources_is_delivered_once() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));

    let segments = [
        seg(CLIENT, SERVER, 99, TcpFlags::SYN, 0),
        seg(CLIENT, SERVER, 100, TcpFlags::ACK, 10),
        seg(CLIENT, SERVER, 110, TcpFlags::ACK, 10),
        seg(CLIENT, SERVER, 120, TcpFlags::ACK, 10),
    ];
    for s in &segments {
        engine.ingest(s.clone().with_source(SourceId(1)));
        engine.ingest(s.clone().with_source(SourceId(2)));
    }

    let dir = key_dir(&key, CLIENT);
    assert_eq!(consumer.stream(&key, dir), payload(100, 30));
    assert_eq!(consumer.chunks(&key, dir).len(), 3);
    let stats = engine.stats();
    assert_eq!(stats.segments_duplicate, 3);
    assert_eq!(stats.flows_accepted, 1);
}

fn key_dir(key: &FlowKey, src: &str) -> Direction {
    if key.lower() == addr(src) {
        Direction::Forward
    } else {
        Direction::Reverse
    }
}

#[test]
fn global_cap_evicts_least_recently_active_flow() {
    let config = ReassemblyConfig {
        max_buffered_segments: 2,
        max_flow_buffered_segments: 2,
        ..ReassemblyConfig::default()
    };
    let (engine, consumer) = new_engine(config);
    let t0 = UNIX_EPOCH + Duration::from_secs(10_000);

    let old = FlowKey::new(addr("10.1.0.1:1000"), addr(SERVER));
    engine.ingest(seg("10.1.0.1:1000", SERVER, 0, TcpFlags::ACK, 10).with_timestamp(t0));
    engine.ingest(seg("10.1.0.1:1000", SERVER, 20, TcpFlags::ACK, 10).with_timestamp(t0));
    engine.ingest(seg("10.1.0.1:1000", SERVER, 40, TcpFlags::ACK, 10).with_timestamp(t0));
    assert_eq!(engine.stats().buffered_segments, 2);

    let new = FlowKey::new(addr("10.1.0.2:2000"), addr(SERVER));
    let later = t0 + Duration::from_secs(1);
    engine.ingest(seg("10.1.0.2:2000", SERVER, 0, TcpFlags::ACK, 10).with_timestamp(later));
    engine.ingest(seg("10.1.0.2:2000", SERVER, 20, TcpFlags::ACK, 10).with_timestamp(later));

    assert_eq!(consumer.completions(&old), vec![CompletionReason::Evicted]);
    let old_dir = key_dir(&old, "10.1.0.1:1000");
    let chunks = consumer.chunks(&old, old_dir);
    assert_eq!(chunks.len(), 3);
    assert!(chunks[1].1 && chunks[2].1);

    let stats = engine.stats();
    assert_eq!(stats.flows_evicted, 1);
    assert_eq!(stats.buffered_segments, 1);
    assert!(engine.table().contains(&new));
    assert!(!engine.table().contains(&old));
}

#[test]
fn flow_limit_evicts_before_admitting() {
    let config = ReassemblyConfig {
        max_flows: 2,
        ..ReassemblyConfig::default()
    };
    let (engine, consumer) = new_engine(config);
    let t0 = UNIX_EPOCH + Duration::from_secs(500);

    let clients = ["10.2.0.1:1000", "10.2.0.2:1000", "10.2.0.3:1000"];
    for (i, client) in clients.iter().enumerate() {
        engine.ingest(seg(client, SERVER, 0, TcpFlags::ACK, 5).with_timestamp(t0 + Duration::from_secs(i as u64)));
    }

    assert_eq!(engine.table().len(), 2);
    let first = FlowKey::new(addr(clients[0]), addr(SERVER));
    assert_eq!(consumer.completions(&first), vec![CompletionReason::Evicted]);
}

#[test]
fn gap_is_reported_once_on_forced_completion() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));
    let dir = key_dir(&key, CLIENT);

    engine.ingest(seg(CLIENT, SERVER, 0, TcpFlags::ACK, 10));
    engine.ingest(seg(CLIENT, SERVER, 30, TcpFlags::ACK, 10));
    engine.ingest(seg(CLIENT, SERVER, 40, TcpFlags::ACK, 10));
    engine.ingest(seg(CLIENT, SERVER, 60, TcpFlags::ACK, 10));
    assert_eq!(engine.shutdown(), 1);

    let chunks = consumer.chunks(&key, dir);
    assert_eq!(
        chunks,
        vec![
            (Bytes::from(payload(0, 10)), false),
            (Bytes::from(payload(30, 20)), true),
            (Bytes::from(payload(60, 10)), true),
        ]
    );
    assert_eq!(consumer.completions(&key), vec![CompletionReason::Shutdown]);
    assert_eq!(engine.stats().gap_skips, 2);
    assert_eq!(engine.stats().buffered_bytes, 0);
}

#[test]
fn overlapping_buffered_segments_are_trimmed() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let key = FlowKey::new(addr(CLIENT), addr(SERVER));
    let dir = key_dir(&key, CLIENT);

    engine.ingest(seg(CLIENT, SERVER, 99, TcpFlags::SYN, 0));
    engine.ingest(seg(CLIENT, SERVER, 120, TcpFlags::ACK, 10));
    engine.ingest(seg(CLIENT, SERVER, 115, TcpFlags::ACK, 20));
    engine.ingest(seg(CLIENT, SERVER, 100, TcpFlags::ACK, 16));

    assert_eq!(consumer.stream(&key, dir), payload(100, 35));
    assert_eq!(engine.stats().buffered_bytes, 0);
}

#[test]
fn concurrent_sources_share_one_flow_table() {
    let (engine, consumer) = new_engine(ReassemblyConfig::default());
    let clients: Vec<String> = (0..8).map(|i| format!("10.3.0.{}:4000", i + 1)).collect();
    for client in &clients {
        engine.ingest(seg(client, SERVER, 0, TcpFlags::SYN, 0));
    }

    std::thread::scope(|scope| {
        for source in 0..2u16 {
            let engine = &engine;
            let clients = &clients;
            scope.spawn(move || {
                for round in 0..50u32 {
                    // Odd source walks backwards so each flow sees real reordering.
                    let idx = if source == 0 { round } else { 49 - round };
                    for client in clients {
                        let s = seg(client, SERVER, 1 + idx * 8, TcpFlags::ACK, 8).with_source(SourceId(source));
                        engine.ingest(s);
                    }
                }
            });
        }
    });

    for client in &clients {
        let key = FlowKey::new(addr(client), addr(SERVER));
        assert_eq!(consumer.stream(&key, key_dir(&key, client)), payload(1, 400));
    }
    assert_eq!(engine.stats().buffered_segments, 0);
    assert_eq!(engine.shutdown(), clients.len());
}
