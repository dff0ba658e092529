//! The timeshift buffer: a process-wide, time-indexed history of every
//! ingested packet, partitioned by source tag, with per-consumer read
//! cursors that track their own playback rate against a shared reference
//! timeline.

mod buffer;
mod cursor;
mod manager;

pub use buffer::{Partition, TimeshiftBuffer};
pub use cursor::{CursorHandle, RateChangeKind, RateControlParams, RateController, ReadCursor};
pub use manager::{CursorSnapshot, ReadOutcome, TimeshiftConfig, TimeshiftExport, TimeshiftManager};
