// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;

use medians::Medianf64;

use crate::camd::{DescriptiveStats, TriggerTiming};

// Trigger errors above this are counted as late, milliseconds.
const LATE_TRIGGER_MS: f64 = 1.0;

/// Accumulates overlapped-mode trigger errors (actual trigger time minus
/// the scheduled time, in milliseconds).
pub struct TriggerStats {
    recent: VecDeque<f64>,
    recent_capacity: usize,
    sequence: rolling_stats::Stats<f64>,
    trigger_count: u32,
    late_trigger_count: u32,
}

impl TriggerStats {
    pub fn new(recent_capacity: usize) -> Self {
        TriggerStats{
            recent: VecDeque::with_capacity(recent_capacity),
            recent_capacity,
            sequence: rolling_stats::Stats::<f64>::new(),
            trigger_count: 0,
            late_trigger_count: 0,
        }
    }

    /// Clears the per-sequence figures. The recent window is kept so that
    /// it still describes the most recent triggers between sequences.
    pub fn start_sequence(&mut self) {
        self.sequence = rolling_stats::Stats::<f64>::new();
        self.trigger_count = 0;
        self.late_trigger_count = 0;
    }

    pub fn add_trigger_error(&mut self, error_ms: f64) {
        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(error_ms);
        self.sequence.update(error_ms);
        self.trigger_count += 1;
        if error_ms > LATE_TRIGGER_MS {
            self.late_trigger_count += 1;
        }
    }

    pub fn to_proto(&self) -> TriggerTiming {
        let mut recent = DescriptiveStats{..Default::default()};
        if !self.recent.is_empty() {
            let values: Vec<f64> = self.recent.iter().copied().collect();
            recent.min = values.iter().copied().fold(f64::INFINITY, f64::min);
            recent.max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            recent.mean = statistical::mean(&values);
            if values.len() > 1 {
                recent.stddev = statistical::standard_deviation(&values, Some(recent.mean));
            }
            let median = values.as_slice().medf_unchecked();
            recent.median = Some(median);
            recent.median_absolute_deviation = Some(values.as_slice().madf(median));
        }
        let mut sequence = DescriptiveStats{..Default::default()};
        if self.trigger_count > 0 {
            sequence.min = self.sequence.min;
            sequence.max = self.sequence.max;
            sequence.mean = self.sequence.mean;
            if self.trigger_count > 1 {
                sequence.stddev = self.sequence.std_dev;
            }
        }
        TriggerTiming{
            recent: Some(recent),
            sequence: Some(sequence),
            trigger_count: self.trigger_count,
            late_trigger_count: self.late_trigger_count,
        }
    }
}

// mod tests.
