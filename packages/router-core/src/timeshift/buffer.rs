//! The per-tag partitioned ring that backs the timeshift buffer.
//!
//! Each source tag gets its own append-only `VecDeque`, trimmed by both a
//! packet-count ceiling and a wall-clock age ceiling so memory stays bounded
//! regardless of a tag's packet rate (spec invariant: total memory bounded
//! by `history_seconds * peak byte-rate`, summed per tag).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::packet::{SourceTag, TaggedAudioPacket};

/// One tag's packet history plus its overflow counter.
pub struct Partition {
    packets: VecDeque<Arc<TaggedAudioPacket>>,
    dropped_overflow: AtomicU64,
}

impl Partition {
    fn new() -> Self {
        Self {
            packets: VecDeque::new(),
            dropped_overflow: AtomicU64::new(0),
        }
    }

    /// Number of packets currently retained for this tag.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Count of packets evicted by the capacity or age bound since creation.
    #[must_use]
    pub fn dropped_overflow(&self) -> u64 {
        self.dropped_overflow.load(Ordering::Relaxed)
    }

    /// Timestamp of the oldest retained packet, if any.
    #[must_use]
    pub fn tail_time(&self) -> Option<Instant> {
        self.packets.front().map(|p| p.received_at)
    }

    /// Timestamp of the newest retained packet, if any.
    #[must_use]
    pub fn head_time(&self) -> Option<Instant> {
        self.packets.back().map(|p| p.received_at)
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaggedAudioPacket>> {
        self.packets.iter()
    }
}

/// Process-wide, tag-partitioned packet history.
///
/// Writers (receivers) take the partition's short exclusive lock only for
/// the duration of the append and eviction; readers (cursors) take the same
/// lock in shared reads via [`Self::with_partition`]. No lock is ever held
/// across a DSP chunk (spec 5's "shared resources" rule).
pub struct TimeshiftBuffer {
    partitions: DashMap<SourceTag, RwLock<Partition>>,
    history: Duration,
    max_partition_packets: usize,
}

impl TimeshiftBuffer {
    /// Creates a buffer retaining `history_seconds` of audio per tag, with a
    /// packet-count ceiling per tag as a second, independent bound (guards
    /// against a pathologically high packet rate blowing memory before the
    /// age-based eviction would catch up).
    #[must_use]
    pub fn new(history_seconds: u64, max_partition_packets: usize) -> Self {
        Self {
            partitions: DashMap::new(),
            history: Duration::from_secs(history_seconds),
            max_partition_packets,
        }
    }

    #[must_use]
    pub fn history(&self) -> Duration {
        self.history
    }

    /// Appends a packet to its tag's partition, evicting from the front as
    /// needed to respect both bounds. Returns `true` if this is the first
    /// packet ever seen for this tag (callers use this to publish a
    /// discovery notification).
    pub fn append(&self, packet: TaggedAudioPacket) -> bool {
        let tag = packet.source_tag.clone();
        let first_seen = !self.partitions.contains_key(&tag);
        let partition = self
            .partitions
            .entry(tag)
            .or_insert_with(|| RwLock::new(Partition::new()));
        let mut guard = partition.write();
        guard.packets.push_back(Arc::new(packet));
        self.evict_locked(&mut guard);
        first_seen
    }

    fn evict_locked(&self, partition: &mut Partition) {
        while partition.packets.len() > self.max_partition_packets {
            partition.packets.pop_front();
            partition.dropped_overflow.fetch_add(1, Ordering::Relaxed);
        }
        let cutoff = Instant::now().checked_sub(self.history);
        if let Some(cutoff) = cutoff {
            while let Some(front) = partition.packets.front() {
                if front.received_at < cutoff {
                    partition.packets.pop_front();
                    partition.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
            }
        }
    }

    /// Runs `f` with a shared-read view of `tag`'s partition, if it exists.
    pub fn with_partition<R>(&self, tag: &str, f: impl FnOnce(&Partition) -> R) -> Option<R> {
        self.partitions.get(tag).map(|entry| f(&entry.read()))
    }

    /// Drops packets older than `history_seconds` behind real-time across
    /// every tag. Run periodically by the manager's cleanup thread.
    pub fn run_cleanup_pass(&self) {
        for entry in self.partitions.iter() {
            let mut guard = entry.write();
            self.evict_locked(&mut guard);
        }
    }

    #[must_use]
    pub fn known_tags(&self) -> Vec<SourceTag> {
        self.partitions.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::packet::FormatDescriptor;

    fn fmt() -> FormatDescriptor {
        FormatDescriptor::new(48000, 16, 2, 0x0003)
    }

    fn packet(tag: &str) -> TaggedAudioPacket {
        TaggedAudioPacket::new(tag.to_string(), Bytes::from(vec![0u8; 4608]), fmt())
    }

    #[test]
    fn first_append_reports_first_seen() {
        let buf = TimeshiftBuffer::new(300, 10_000);
        assert!(buf.append(packet("a")));
        assert!(!buf.append(packet("a")));
    }

    #[test]
    fn separate_tags_get_separate_partitions() {
        let buf = TimeshiftBuffer::new(300, 10_000);
        buf.append(packet("a"));
        buf.append(packet("b"));
        assert_eq!(buf.tag_count(), 2);
    }

    #[test]
    fn exceeding_packet_count_bound_evicts_oldest() {
        let buf = TimeshiftBuffer::new(300, 2);
        buf.append(packet("a"));
        buf.append(packet("a"));
        buf.append(packet("a"));
        let (len, dropped) = buf
            .with_partition("a", |p| (p.len(), p.dropped_overflow()))
            .unwrap();
        assert_eq!(len, 2);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn unknown_tag_returns_none() {
        let buf = TimeshiftBuffer::new(300, 10_000);
        assert!(buf.with_partition("ghost", |p| p.len()).is_none());
    }
}
