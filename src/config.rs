// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use serde::{Deserialize, Serialize};

use crate::camera_sdk::UsbPortPath;

// Allowed cooling setpoints, degrees C.
pub const MIN_TEMPERATURE: f64 = -20.0;
pub const MAX_TEMPERATURE: f64 = 30.0;

// Longest accepted exposure, seconds.
pub const MAX_EXPOSURE_TIME: f64 = 3600.0;

const MAX_USB_PORT_DEPTH: usize = 7;

/// Static daemon configuration, read from a JSON file at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    // host:port for the camd gRPC service.
    pub listen_address: String,
    // URI of the pipeline daemon, e.g. "http://10.2.6.10:9001".
    pub pipeline_address: String,
    // Seconds.
    pub pipeline_handover_timeout: f64,
    pub log_name: String,
    // Hosts allowed to issue commands.
    pub control_machines: Vec<IpAddr>,

    // The camera is identified by where it is plugged in.
    pub usb_bus: u8,
    pub usb_port_numbers: Vec<u8>,
    pub camera_id: String,

    // Default cooling setpoint, degrees C.
    pub temperature_setpoint: f64,
    // Seconds between telemetry polls.
    pub temperature_query_delay: f64,

    pub output_path: PathBuf,
    pub expcount_path: PathBuf,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, CanonicalError> {
        let text = fs::read_to_string(path).map_err(|e| {
            invalid_argument_error(&format!("Could not read {:?}: {}", path, e))
        })?;
        DaemonConfig::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, CanonicalError> {
        let config: DaemonConfig = serde_json::from_str(text).map_err(|e| {
            invalid_argument_error(&format!("Invalid configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every violation into a single error.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        let mut problems = Vec::<String>::new();
        if self.listen_address.parse::<SocketAddr>().is_err() {
            problems.push(format!("listen_address {:?} is not host:port",
                                  self.listen_address));
        }
        if self.pipeline_address.is_empty() {
            problems.push("pipeline_address is empty".to_string());
        }
        if !(self.pipeline_handover_timeout >= 0.0) ||
            !self.pipeline_handover_timeout.is_finite()
        {
            problems.push("pipeline_handover_timeout must be >= 0".to_string());
        }
        if self.log_name.is_empty() {
            problems.push("log_name is empty".to_string());
        }
        if self.usb_bus < 1 {
            problems.push("usb_bus must be >= 1".to_string());
        }
        if self.usb_port_numbers.is_empty() ||
            self.usb_port_numbers.len() > MAX_USB_PORT_DEPTH
        {
            problems.push(format!("usb_port_numbers must have 1 to {} entries",
                                  MAX_USB_PORT_DEPTH));
        }
        if self.usb_port_numbers.contains(&0) {
            problems.push("usb_port_numbers entries must be >= 1".to_string());
        }
        if self.camera_id.is_empty() {
            problems.push("camera_id is empty".to_string());
        }
        if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&self.temperature_setpoint) {
            problems.push(format!("temperature_setpoint must be in [{}, {}]",
                                  MIN_TEMPERATURE, MAX_TEMPERATURE));
        }
        if !(self.temperature_query_delay > 0.0) || !self.temperature_query_delay.is_finite() {
            problems.push("temperature_query_delay must be > 0".to_string());
        }
        if problems.is_empty() {
            return Ok(());
        }
        Err(invalid_argument_error(
            &format!("Invalid configuration:\n  {}", problems.join("\n  "))))
    }

    pub fn usb_port_path(&self) -> UsbPortPath {
        UsbPortPath::new(self.usb_bus, self.usb_port_numbers.clone())
    }

    pub fn handover_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pipeline_handover_timeout)
    }

    pub fn query_interval(&self) -> Duration {
        Duration::from_secs_f64(self.temperature_query_delay)
    }
}

// mod tests.
