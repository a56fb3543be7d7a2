use comfy_table::{presets::UTF8_FULL, Table};

use reasm_capture::{PipelineReport, SourceOutcome};
use reasm_stream::{Segment, TcpFlags};

pub fn render(report: &PipelineReport) -> String {
    let mut sources = Table::new();
    sources.load_preset(UTF8_FULL);
    sources.set_header(vec!["Source", "Trace", "Segments", "Outcome"]);
    for s in &report.sources {
        let outcome = match &s.outcome {
            SourceOutcome::Exhausted => "exhausted".to_string(),
            SourceOutcome::Cancelled => "cancelled".to_string(),
            SourceOutcome::Failed(err) => format!("failed: {err}"),
        };
        sources.add_row(vec![s.source.to_string(), s.name.clone(), s.segments.to_string(), outcome]);
    }

    let st = &report.stats;
    let mut stats = Table::new();
    stats.load_preset(UTF8_FULL);
    stats.set_header(vec!["Counter", "Value"]);
    let rows: [(&str, u64); 19] = [
        ("segments_ingested", st.segments_ingested),
        ("segments_malformed", st.segments_malformed),
        ("segments_ignored", st.segments_ignored),
        ("segments_duplicate", st.segments_duplicate),
        ("segments_buffered", st.segments_buffered),
        ("segments_dropped", st.segments_dropped),
        ("bytes_delivered", st.bytes_delivered),
        ("gap_skips", st.gap_skips),
        ("partial_bytes_discarded", st.partial_bytes_discarded),
        ("flows_accepted", st.flows_accepted),
        ("flows_rejected", st.flows_rejected),
        ("flows_completed", st.flows_completed),
        ("flows_evicted", st.flows_evicted),
        ("flows_expired", st.flows_expired),
        ("flows_flushed_at_shutdown", report.flows_flushed_at_shutdown as u64),
        ("segments_queued", report.segments_queued),
        ("active_flows", st.active_flows as u64),
        ("buffered_bytes", st.buffered_bytes as u64),
        ("buffered_segments", st.buffered_segments as u64),
    ];
    for (name, value) in rows {
        stats.add_row(vec![name.to_string(), value.to_string()]);
    }

    format!("{sources}\n{stats}")
}

/// One line per decoded segment.
pub fn segment_line(segment: &Segment) -> String {
    let flags = segment.flags();
    format!(
        "{} -> {} - (syn: {}) (ack: {}) (fin: {}) (rst: {}) - (seq: {}) (len: {})",
        segment.src(),
        segment.dst(),
        flags.contains(TcpFlags::SYN),
        flags.contains(TcpFlags::ACK),
        flags.contains(TcpFlags::FIN),
        flags.contains(TcpFlags::RST),
        segment.seq(),
        segment.payload().len(),
    )
}
