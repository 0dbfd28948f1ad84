use chrono::{DateTime, FixedOffset, Utc};
use shared::protocol::{Save, SaveSet};
use tracing::debug;

/// Renders a save timestamp as `M/D/YYYY, h:mm:ss AM/PM`.
pub fn format_timestamp(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset)
        .format("%-m/%-d/%Y, %-I:%M:%S %p")
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayUpdate {
    Applied,
    /// A newer request already updated the display; the response was dropped.
    Stale,
}

/// Persistence state shown next to the canvas.
#[derive(Debug, Clone, Default)]
pub struct DisplayState {
    last_saved: Option<DateTime<Utc>>,
    last_saved_seq: u64,
    pub save_set: SaveSet,
    pub last_autosave: Option<Save>,
}

impl DisplayState {
    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.last_saved
    }

    /// Records the outcome of request `seq`. Sequences are handed out in
    /// request order, so only a request newer than the one that last wrote
    /// the display may overwrite it.
    pub fn apply_saved(&mut self, seq: u64, at: Option<DateTime<Utc>>) -> DisplayUpdate {
        if seq <= self.last_saved_seq {
            debug!(
                "display: dropping stale update seq={} latest={}",
                seq, self.last_saved_seq
            );
            return DisplayUpdate::Stale;
        }
        self.last_saved_seq = seq;
        self.last_saved = at;
        DisplayUpdate::Applied
    }
}
