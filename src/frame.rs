// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use chrono::{DateTime, Utc};
use image::{ImageBuffer, Luma};

use crate::status_poller::CoolingState;

pub type Image16 = ImageBuffer<Luma<u16>, Vec<u16>>;

/// A completed exposure on its way from the acquisition engine to the frame
/// dispatcher. Moved through the dispatch channel; nothing else retains it.
pub struct Frame {
    pub image: Image16,

    pub start_time: DateTime<Utc>,
    // When integration ended (requested end in normal mode, the readout
    // trigger in overlapped mode).
    pub end_time: DateTime<Utc>,
    // When the image data became available.
    pub read_end_time: DateTime<Utc>,

    // Seconds.
    pub exposure_time: f64,
    pub target_exposure_time: f64,
    pub overlapped: bool,

    // Cooling snapshot at readout; None if telemetry was unavailable.
    pub cooling: Option<CoolingState>,

    pub exposure_count: i64,
    pub exposure_reference: String,

    // Number of the sequence that produced this frame, for attributing
    // save and hand-off failures.
    pub sequence: u64,
}
