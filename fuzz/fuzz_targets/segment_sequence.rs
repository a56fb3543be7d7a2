#![no_main]

use libfuzzer_sys::fuzz_target;
use reasm_core::ReassemblyConfig;
use reasm_stream::{CollectingConsumer, Reassembler, Segment, TcpFlags};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, UNIX_EPOCH};

const MAX_BYTES: usize = 4096;
const MAX_SEGMENTS: usize = 16;

fuzz_target!(|data: &[u8]| {
    let config = ReassemblyConfig {
        max_buffered_bytes: MAX_BYTES,
        max_buffered_segments: MAX_SEGMENTS,
        max_flow_buffered_bytes: MAX_BYTES / 2,
        max_flow_buffered_segments: MAX_SEGMENTS / 2,
        max_flows: 4,
        allow_missing_init: data.first().map_or(true, |b| b & 1 == 0),
        missing_init_delay_ms: 1500,
        idle_timeout_secs: 5,
    };
    let engine = match Reassembler::new(config, CollectingConsumer::new()) {
        Ok(engine) => engine,
        Err(_) => return,
    };

    // 8 bytes per segment: flow, direction+flags, seq (4), length, clock step.
    for (i, rec) in data.chunks_exact(8).enumerate() {
        let client = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, rec[0] % 8)), 1000);
        let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)), 80);
        let (src, dst) = if rec[1] & 0x80 == 0 { (client, server) } else { (server, client) };
        let flags = TcpFlags::from_bits_truncate(rec[1] & 0x3f);
        let seq = u32::from_be_bytes([rec[2], rec[3], rec[4], rec[5]]);
        let payload = vec![rec[6]; rec[6] as usize];
        let ts = UNIX_EPOCH + Duration::from_secs(i as u64 + u64::from(rec[7] % 4));
        engine.ingest(Segment::new(src, dst, seq, flags, payload).with_timestamp(ts));

        let stats = engine.stats();
        assert!(stats.buffered_bytes <= MAX_BYTES);
        assert!(stats.buffered_segments <= MAX_SEGMENTS);
        assert!(stats.active_flows <= 4);
        if rec[7] & 0x80 != 0 {
            engine.flush_idle();
        }
    }

    engine.shutdown();
    let stats = engine.stats();
    assert_eq!(stats.active_flows, 0);
    assert_eq!(stats.buffered_bytes, 0);
    assert_eq!(stats.buffered_segments, 0);
});
