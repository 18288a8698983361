//! Duplicate suppression over a sliding window of RTP sequence numbers.
//!
//! The filter keeps a circular bitmap of the last `window` extended sequence
//! numbers below the highest one seen. A number inside the window is
//! forwarded at most once. A number that fell behind the window cannot be
//! checked, so it is forwarded and reported as [`SeqStatus::OutOfWindow`]
//! rather than risk dropping a packet that was never seen.

/// Verdict for one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqStatus {
    /// Ahead of everything seen so far.
    New,
    /// Behind the highest number but inside the window and not yet seen.
    Reordered,
    /// Too far behind to check.
    OutOfWindow,
    /// Already forwarded.
    Duplicate,
}

impl SeqStatus {
    pub fn should_forward(self) -> bool {
        self != SeqStatus::Duplicate
    }

    pub fn is_out_of_order(self) -> bool {
        matches!(self, SeqStatus::Reordered | SeqStatus::OutOfWindow)
    }
}

#[derive(Debug)]
pub struct DuplicateFilter {
    seen: Vec<bool>,
    /// Highest extended (wrap-counted) sequence number seen.
    highest: Option<i64>,
}

impl DuplicateFilter {
    pub fn new(window: usize) -> Self {
        Self {
            seen: vec![false; window.max(1)],
            highest: None,
        }
    }

    pub fn window(&self) -> usize {
        self.seen.len()
    }

    /// Highest 16-bit sequence number seen.
    pub fn highest(&self) -> Option<u16> {
        self.highest.map(|ext| ext as u16)
    }

    /// Number of times the 16-bit sequence space has wrapped.
    pub fn wrap_count(&self) -> u32 {
        self.highest.map_or(0, |ext| (ext >> 16) as u32)
    }

    /// Classify `seq` and record it when it is forwarded.
    pub fn check(&mut self, seq: u16) -> SeqStatus {
        let Some(highest) = self.highest else {
            let ext = seq as i64;
            self.highest = Some(ext);
            self.mark(ext);
            return SeqStatus::New;
        };

        let delta = seq.wrapping_sub(highest as u16) as i16 as i64;
        let window = self.seen.len() as i64;
        let ext = highest + delta;

        if delta > 0 {
            if delta >= window {
                self.seen.fill(false);
            } else {
                for skipped in highest + 1..ext {
                    self.unmark(skipped);
                }
            }
            self.highest = Some(ext);
            self.mark(ext);
            SeqStatus::New
        } else if delta == 0 {
            SeqStatus::Duplicate
        } else if -delta >= window || ext < 0 {
            SeqStatus::OutOfWindow
        } else if self.is_marked(ext) {
            SeqStatus::Duplicate
        } else {
            self.mark(ext);
            SeqStatus::Reordered
        }
    }

    /// Forget everything, e.g. after the source SSRC changed.
    pub fn reset(&mut self) {
        self.seen.fill(false);
        self.highest = None;
    }

    fn slot(&self, ext: i64) -> usize {
        ext.rem_euclid(self.seen.len() as i64) as usize
    }

    fn mark(&mut self, ext: i64) {
        let slot = self.slot(ext);
        self.seen[slot] = true;
    }

    fn unmark(&mut self, ext: i64) {
        let slot = self.slot(ext);
        self.seen[slot] = false;
    }

    fn is_marked(&self, ext: i64) -> bool {
        self.seen[self.slot(ext)]
    }
}
