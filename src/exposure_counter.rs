// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::io::Write;
use std::path::Path;

use canonical_error::{CanonicalError, data_loss_error};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Monotonic frame counter persisted across restarts. `exposure_reference`
/// is the UTC date (YYYY-MM-DD) the count was last reset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureCounter {
    pub exposure_count: i64,
    pub exposure_reference: String,
}

impl ExposureCounter {
    pub fn reset_today() -> Self {
        ExposureCounter{
            exposure_count: 0,
            exposure_reference: Utc::now().format("%Y-%m-%d").to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            data_loss_error(&format!("Could not read {:?}: {}", path, e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            data_loss_error(&format!("Could not parse {:?}: {}", path, e))
        })
    }

    /// Loads the counter, starting a fresh one from today if the file is
    /// missing or unreadable.
    pub fn load_or_reset(path: &Path) -> Self {
        match ExposureCounter::load(path) {
            Ok(counter) => {
                info!("Exposure count {} (reference {})",
                      counter.exposure_count, counter.exposure_reference);
                counter
            },
            Err(e) => {
                warn!("{}; resetting exposure count", e.message);
                ExposureCounter::reset_today()
            },
        }
    }

    /// Writes to a temporary file alongside `path` and renames it into
    /// place, so a crash never leaves a truncated counter.
    pub fn save(&self, path: &Path) -> Result<(), CanonicalError> {
        let write = || -> std::io::Result<()> {
            let json = serde_json::to_string(self)?;
            let tmp_path = path.with_extension("tmp");
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)
        };
        write().map_err(|e| {
            data_loss_error(&format!("Could not save {:?}: {}", path, e))
        })
    }
}

// mod tests.
