//! Shared gap-detection policy, identical across all `AudioDecoder` variants,
//! factored into one composable helper rather than duplicated per variant.

use crate::chunk::NO_CHUNK_INFO;

/// Outcome of observing one chunk's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapOutcome {
    /// Out-of-order or replayed chunk; the caller must return `NULL_DISCARD`
    /// without updating any decoder state.
    Discard,
    /// Chunk accepted; `lost_frames` is the number of chunks skipped since
    /// the last accepted one (`0` when there is no gap, no previous chunk,
    /// or tracking info is unavailable).
    Accept { lost_frames: u32 },
}

/// Tracks `lastChunkNo` for one decoder instance.
#[derive(Debug, Default)]
pub struct GapTracker {
    last_chunk_no: Option<u32>,
}

impl GapTracker {
    pub fn new() -> Self {
        Self { last_chunk_no: None }
    }

    /// Three-step policy: no-info passthrough, then duplicate/out-of-order
    /// rejection, then gap-size accounting.
    pub fn observe(&mut self, chunk_no: u32) -> GapOutcome {
        if chunk_no == NO_CHUNK_INFO {
            return GapOutcome::Accept { lost_frames: 0 };
        }

        match self.last_chunk_no {
            None => {
                self.last_chunk_no = Some(chunk_no);
                GapOutcome::Accept { lost_frames: 0 }
            }
            Some(last) => {
                let delta = chunk_no as i64 - last as i64;
                if delta <= 0 {
                    GapOutcome::Discard
                } else {
                    self.last_chunk_no = Some(chunk_no);
                    GapOutcome::Accept {
                        lost_frames: (delta - 1) as u32,
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.last_chunk_no = None;
    }

    pub fn last_chunk_no(&self) -> Option<u32> {
        self.last_chunk_no
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_in_order_sequence_and_tracks_max() {
        let mut tracker = GapTracker::new();
        for n in 1..=100u32 {
            assert_eq!(tracker.observe(n), GapOutcome::Accept { lost_frames: 0 });
        }
        assert_eq!(tracker.last_chunk_no(), Some(100));
    }

    #[test]
    fn single_gap_reports_one_lost_frame() {
        let mut tracker = GapTracker::new();
        tracker.observe(1);
        tracker.observe(2);
        tracker.observe(3);
        assert_eq!(tracker.observe(5), GapOutcome::Accept { lost_frames: 1 });
        assert_eq!(tracker.observe(6), GapOutcome::Accept { lost_frames: 0 });
        assert_eq!(tracker.last_chunk_no(), Some(6));
    }

    #[test]
    fn replay_is_discarded_and_last_chunk_no_unchanged() {
        let mut tracker = GapTracker::new();
        tracker.observe(1);
        tracker.observe(2);
        assert_eq!(tracker.observe(2), GapOutcome::Discard);
        assert_eq!(tracker.last_chunk_no(), Some(2));
    }

    #[test]
    fn out_of_order_then_recovery() {
        let mut tracker = GapTracker::new();
        assert_eq!(tracker.observe(1), GapOutcome::Accept { lost_frames: 0 });
        assert_eq!(tracker.observe(3), GapOutcome::Accept { lost_frames: 1 });
        assert_eq!(tracker.observe(2), GapOutcome::Discard);
        assert_eq!(tracker.observe(4), GapOutcome::Accept { lost_frames: 0 });
        assert_eq!(tracker.last_chunk_no(), Some(4));
    }

    #[test]
    fn no_chunk_info_skips_gap_logic() {
        let mut tracker = GapTracker::new();
        tracker.observe(1);
        assert_eq!(
            tracker.observe(NO_CHUNK_INFO),
            GapOutcome::Accept { lost_frames: 0 }
        );
        // lastChunkNo is untouched by a NO_CHUNK_INFO observation.
        assert_eq!(tracker.last_chunk_no(), Some(1));
    }
}
