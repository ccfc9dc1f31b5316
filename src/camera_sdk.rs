// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;

use canonical_error::CanonicalError;

// Opaque native camera handle. For the Artemis binding this is the SDK's
// handle pointer; it is only ever dereferenced by the SDK itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdkHandle(pub usize);

// Physical location of a USB device: bus number followed by the chain of hub
// port numbers leading to it. This is stable across reconnects, unlike the
// serial number reported by our modified cameras.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbPortPath {
    pub bus: u8,
    pub ports: Vec<u8>,
}

impl UsbPortPath {
    pub fn new(bus: u8, ports: Vec<u8>) -> Self {
        UsbPortPath{bus, ports}
    }
}

// Formats as e.g. "001:002:004".
impl fmt::Display for UsbPortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.bus)?;
        for port in &self.ports {
            write!(f, ":{:03}", port)?;
        }
        Ok(())
    }
}

// A device that is present and not in use by another process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_index: i32,
    pub port_path: UsbPortPath,
}

// Cooling state as reported by the driver. Temperatures are in hundredths of
// a degree C.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawCoolingInfo {
    pub flags: i32,
    pub level: i32,
    pub min_level: i32,
    pub max_level: i32,
    pub setpoint: i32,
}

// Flag bits within `RawCoolingInfo::flags`.
pub const COOLING_FLAG_WARMING_UP: i32 = 0x20;
pub const COOLING_FLAG_COOLING_ON: i32 = 0x40;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawTelemetry {
    // Degrees C.
    pub temperature: f64,
    pub cooling: RawCoolingInfo,
}

// A 16 bit image as read out of the camera, row major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

/// The fixed set of native operations the daemon needs from the vendor
/// driver. Implementations make no attempt at serializing calls; that is the
/// job of `DriverGateway`, which is the only owner of a `CameraSdk`.
pub trait CameraSdk: Send {
    /// Lists devices that are present and not in use, with their USB port
    /// paths.
    fn list_devices(&mut self) -> Result<Vec<DeviceInfo>, CanonicalError>;

    fn connect(&mut self, device_index: i32) -> Result<SdkHandle, CanonicalError>;
    fn disconnect(&mut self, handle: SdkHandle) -> Result<(), CanonicalError>;

    /// `setpoint` in degrees C; None releases cooling and lets the sensor
    /// warm up.
    fn set_cooling(&mut self, handle: SdkHandle, setpoint: Option<f64>)
                   -> Result<(), CanonicalError>;
    fn cooling_info(&mut self, handle: SdkHandle)
                    -> Result<RawCoolingInfo, CanonicalError>;
    /// Sensor temperature, degrees C.
    fn temperature(&mut self, handle: SdkHandle) -> Result<f64, CanonicalError>;

    /// When `switched` is true the output amplifier is powered down while
    /// integrating, which reduces amplifier glow on long exposures.
    fn set_amplifier_switched(&mut self, handle: SdkHandle, switched: bool)
                              -> Result<(), CanonicalError>;

    fn start_exposure(&mut self, handle: SdkHandle, seconds: f64)
                      -> Result<(), CanonicalError>;
    /// Discards any exposure or readout in progress.
    fn stop_exposure(&mut self, handle: SdkHandle) -> Result<(), CanonicalError>;
    fn image_ready(&mut self, handle: SdkHandle) -> Result<bool, CanonicalError>;
    fn fetch_image(&mut self, handle: SdkHandle) -> Result<RawImage, CanonicalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_path_display() {
        assert_eq!(UsbPortPath::new(1, vec![2, 4]).to_string(), "001:002:004");
        assert_eq!(UsbPortPath::new(12, vec![]).to_string(), "012");
        assert_eq!(UsbPortPath::new(3, vec![1, 10, 100]).to_string(),
                   "003:001:010:100");
    }

}  // mod tests.
