//! Sequence tracking and gap detection.
//!
//! The server numbers every event of a connection session starting at 1. The
//! tracker accepts each number at most once, remembers the numbers it skipped
//! and decides when the client must ask the server to replay them.

use crate::config::TrackerConfig;
use metrics::{counter, gauge};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Result of observing one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Whether the event's payload may be applied.
    pub accept: bool,
    /// Numbers skipped between the last accepted sequence and this one.
    pub gap_size: u64,
    /// Low-water mark for an immediate recovery request.
    pub recover_since: Option<u64>,
}

impl Observation {
    fn accepted(gap_size: u64, recover_since: Option<u64>) -> Self {
        Self {
            accept: true,
            gap_size,
            recover_since,
        }
    }

    fn rejected() -> Self {
        Self {
            accept: false,
            gap_size: 0,
            recover_since: None,
        }
    }
}

/// Bounded set of missing sequence numbers with oldest-first eviction.
///
/// Numbers are only inserted above everything already tracked, since they lie
/// between the last accepted sequence and a newer one. Ascending order is
/// therefore insertion order and the smallest element is the oldest.
#[derive(Debug)]
pub struct MissingSet {
    entries: BTreeSet<u64>,
    capacity: usize,
}

impl MissingSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeSet::new(),
            capacity,
        }
    }

    /// Track `sequence`. Returns the evicted element when the set was full.
    pub fn insert(&mut self, sequence: u64) -> Option<u64> {
        if self.capacity == 0 {
            return Some(sequence);
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_first()
        } else {
            None
        };
        self.entries.insert(sequence);
        evicted
    }

    pub fn remove(&mut self, sequence: u64) -> bool {
        self.entries.remove(&sequence)
    }

    /// Remove every tracked number in `(after, through]`.
    pub fn remove_range(&mut self, after: u64, through: u64) -> usize {
        if through <= after {
            return 0;
        }
        let doomed: Vec<u64> = self.entries.range(after + 1..=through).copied().collect();
        for sequence in &doomed {
            self.entries.remove(sequence);
        }
        doomed.len()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains(&sequence)
    }

    /// Oldest tracked number.
    pub fn first(&self) -> Option<u64> {
        self.entries.first().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().copied()
    }
}

/// Per-session ordering state.
#[derive(Debug)]
pub struct SequenceTracker {
    last_sequence: u64,
    missing: MissingSet,
    /// Exclusive bounds of a gap too large to track number by number. Replayed
    /// events inside it are accepted until a recovery response closes it.
    bulk_window: Option<(u64, u64)>,
    gap_threshold: u64,
}

impl SequenceTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            last_sequence: 0,
            missing: MissingSet::new(config.max_missed),
            bulk_window: None,
            gap_threshold: config.gap_threshold,
        }
    }

    /// Observe an inbound sequence number, live or replayed.
    pub fn observe(&mut self, sequence: u64) -> Observation {
        if sequence <= self.last_sequence {
            if self.missing.remove(sequence) {
                debug!(sequence, "Backfilled missing sequence");
                self.report_missing();
                return Observation::accepted(0, None);
            }
            if self.in_bulk_window(sequence) {
                debug!(sequence, "Backfilled sequence from bulk recovery window");
                return Observation::accepted(0, None);
            }
            counter!("sync_events_duplicate_total").increment(1);
            debug!(
                sequence,
                last_sequence = self.last_sequence,
                "Discarding duplicate or stale sequence"
            );
            return Observation::rejected();
        }

        let gap = sequence - self.last_sequence - 1;
        let mut recover_since = None;

        if gap > 0 {
            counter!("sync_gaps_detected_total").increment(1);

            if gap > self.missing.capacity() as u64 {
                warn!(
                    "Gap of {} after sequence {} exceeds tracking capacity {}, requesting bulk recovery",
                    gap,
                    self.last_sequence,
                    self.missing.capacity()
                );
                let low = self
                    .sweep()
                    .map_or(self.last_sequence, |low| low.min(self.last_sequence));
                self.missing.clear();
                self.bulk_window = Some((low, sequence));
                recover_since = Some(low);
            } else {
                for skipped in (self.last_sequence + 1)..sequence {
                    if let Some(evicted) = self.missing.insert(skipped) {
                        debug!(evicted, "Missing set full, evicted oldest sequence");
                    }
                }
                if gap > self.gap_threshold {
                    debug!(
                        gap,
                        threshold = self.gap_threshold,
                        "Gap exceeds threshold, recovering immediately"
                    );
                    recover_since = Some(self.last_sequence);
                }
            }
        }

        self.last_sequence = sequence;
        self.report_missing();
        Observation::accepted(gap, recover_since)
    }

    /// Low-water mark for the periodic sweep, if anything is outstanding.
    pub fn sweep(&self) -> Option<u64> {
        let from_missing = self.missing.first().map(|first| first - 1);
        let from_window = self.bulk_window.map(|(low, _)| low);
        match (from_missing, from_window) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Clear what a recovery response for `since` covered.
    ///
    /// The response covers everything after `since` up to the newest sequence
    /// the client has seen, even when the server compacted intermediate
    /// events and returned fewer than the numeric range implies.
    pub fn complete_recovery(&mut self, since: u64, highest_replayed: Option<u64>) -> usize {
        let through = highest_replayed.unwrap_or(0).max(self.last_sequence);
        let cleared = self.missing.remove_range(since, through);

        if let Some((low, _)) = self.bulk_window {
            if since <= low {
                self.bulk_window = None;
            }
        }

        if cleared > 0 {
            debug!(since, through, cleared, "Recovery cleared missing sequences");
        }
        self.report_missing();
        cleared
    }

    /// Start a new session: forget all numbering. Returns the low-water mark
    /// for the catch-up request.
    pub fn reset(&mut self) -> u64 {
        self.last_sequence = 0;
        self.missing.clear();
        self.bulk_window = None;
        self.report_missing();
        0
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn missing(&self) -> &MissingSet {
        &self.missing
    }

    pub fn gap_threshold(&self) -> u64 {
        self.gap_threshold
    }

    fn in_bulk_window(&self, sequence: u64) -> bool {
        self.bulk_window
            .is_some_and(|(low, high)| sequence > low && sequence < high)
    }

    fn report_missing(&self) {
        gauge!("sync_missing_sequences").set(self.missing.len() as f64);
    }
}
