//! `get_stats()` snapshot types (spec 6 "Control-plane contract"). Every
//! field here is read from an atomic counter or a short lock already held
//! for another reason - taking this snapshot never locks the data plane
//! beyond that.

use serde::Serialize;

/// Top-level snapshot returned by a `get_stats()` call.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub global: GlobalStats,
    pub sinks: Vec<SinkStats>,
    pub sources: Vec<SourceStats>,
    pub streams: Vec<StreamStats>,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub packets_received: u64,
    pub packets_dropped_malformed: u64,
    pub packets_dropped_backpressure: u64,
    pub active_tags: usize,
    pub active_sinks: usize,
    pub active_paths: usize,
}

/// Per-sink mixer counters.
#[derive(Debug, Clone, Serialize)]
pub struct SinkStats {
    pub sink_id: String,
    pub frames_emitted: u64,
    pub faulted: bool,
    pub lane_count: usize,
    pub webrtc_listener_count: usize,
}

/// Per-source-path counters: resample ratio, playback rate, buffer level.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub path_id: String,
    pub source_tag: String,
    pub resample_ratio: f64,
    pub playback_rate: f32,
    pub buffer_level_ms: f64,
    pub underrun_count: u64,
    pub overrun_count: u64,
    pub output_queue_depth: usize,
    pub output_queue_dropped: u64,
}

/// Per-stream (receiver) counters, one per known source tag.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub tag: String,
    pub receiver_kind: &'static str,
    pub malformed_dropped: u64,
    pub packets_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_stats_default_is_all_zero() {
        let stats = GlobalStats::default();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.active_tags, 0);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snapshot = StatsSnapshot {
            global: GlobalStats::default(),
            sinks: vec![],
            sources: vec![],
            streams: vec![],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"global\""));
    }
}
