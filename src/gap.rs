//! Inbound sequence gap bookkeeping.
//!
//! A gap is a contiguous inclusive range of sequence numbers the peer has
//! not yet delivered. The tracker keeps gaps sorted and disjoint; filling a
//! received sequence number is a range point-delete (shrink, split, or
//! remove).

use std::time::Instant;

/// A contiguous run [begin, end] of missing inbound sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceGap {
    pub begin: u64,
    pub end: u64,
    /// Whether a ResendRequest for this range has gone out.
    pub resend_issued: bool,
    pub issued_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct GapTracker {
    // Sorted by begin; pairwise disjoint.
    gaps: Vec<SequenceGap>,
}

impl GapTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceGap> {
        self.gaps.iter()
    }

    pub fn is_missing(&self, seq: u64) -> bool {
        self.gaps.iter().any(|g| g.begin <= seq && seq <= g.end)
    }

    /// Highest sequence number covered by any gap.
    pub fn last_end(&self) -> Option<u64> {
        self.gaps.last().map(|g| g.end)
    }

    /// Record a new gap. Ranges are opened in increasing order (each new
    /// gap sits beyond everything seen so far), so append suffices.
    pub fn open(&mut self, begin: u64, end: u64, now: Instant) {
        debug_assert!(begin <= end);
        debug_assert!(self.gaps.last().map_or(true, |g| g.end < begin));
        self.gaps.push(SequenceGap {
            begin,
            end,
            resend_issued: true,
            issued_at: Some(now),
        });
    }

    /// Point-delete `seq` from whichever gap contains it. Returns true if
    /// the sequence number was missing.
    pub fn fill(&mut self, seq: u64) -> bool {
        let Some(i) = self
            .gaps
            .iter()
            .position(|g| g.begin <= seq && seq <= g.end)
        else {
            return false;
        };
        let gap = &mut self.gaps[i];
        if gap.begin == gap.end {
            self.gaps.remove(i);
        } else if seq == gap.begin {
            gap.begin += 1;
        } else if seq == gap.end {
            gap.end -= 1;
        } else {
            // Interior point: split into two runs.
            let tail = SequenceGap {
                begin: seq + 1,
                end: gap.end,
                resend_issued: gap.resend_issued,
                issued_at: gap.issued_at,
            };
            gap.end = seq - 1;
            self.gaps.insert(i + 1, tail);
        }
        true
    }

    /// Drop every missing sequence number below `seq` (gap-fill reset).
    pub fn remove_below(&mut self, seq: u64) {
        self.gaps.retain_mut(|g| {
            if g.end < seq {
                return false;
            }
            if g.begin < seq {
                g.begin = seq;
            }
            true
        });
    }

    pub fn clear(&mut self) {
        self.gaps.clear();
    }

    #[cfg(test)]
    fn ranges(&self) -> Vec<(u64, u64)> {
        self.gaps.iter().map(|g| (g.begin, g.end)).collect()
    }
}
