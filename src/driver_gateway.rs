// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Mutex;

use canonical_error::{CanonicalError, failed_precondition_error, not_found_error};
use log::{info, warn};

use crate::camera_sdk::{CameraSdk, RawImage, RawTelemetry, SdkHandle, UsbPortPath};

/// Sole owner of the vendor driver. The driver is not safe for concurrent
/// calls, so every call goes through a single lock; callers on the command,
/// telemetry and acquisition threads share a `DriverGateway` via `Arc`.
pub struct DriverGateway {
    inner: Mutex<GatewayInner>,
}

struct GatewayInner {
    sdk: Box<dyn CameraSdk>,
    handle: Option<SdkHandle>,
}

impl DriverGateway {
    pub fn new(sdk: Box<dyn CameraSdk>) -> Self {
        DriverGateway{inner: Mutex::new(GatewayInner{sdk, handle: None})}
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().handle.is_some()
    }

    /// Connects to the free device at `port_path`. Returns NotFound if no
    /// present, unused device is attached there.
    pub fn connect(&self, port_path: &UsbPortPath) -> Result<(), CanonicalError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.handle.is_some() {
            return Err(failed_precondition_error("Camera already connected"));
        }
        let devices = inner.sdk.list_devices()?;
        let Some(device) = devices.iter().find(|d| d.port_path == *port_path) else {
            return Err(not_found_error(
                &format!("No free camera on USB port path {}", port_path)));
        };
        let handle = inner.sdk.connect(device.device_index)?;
        inner.handle = Some(handle);
        info!("Connected to camera {} at {}", device.device_index, port_path);
        Ok(())
    }

    /// Releases cooling and the device handle. Cooling release failure is
    /// logged but does not prevent the disconnect.
    pub fn disconnect(&self) -> Result<(), CanonicalError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(handle) = inner.handle.take() else {
            return Ok(());
        };
        if let Err(e) = inner.sdk.set_cooling(handle, None) {
            warn!("Could not warm up camera before disconnect: {:?}", e);
        }
        inner.sdk.disconnect(handle)?;
        info!("Disconnected camera");
        Ok(())
    }

    pub fn set_cooling(&self, setpoint: Option<f64>) -> Result<(), CanonicalError> {
        self.with_handle(|sdk, handle| sdk.set_cooling(handle, setpoint))
    }

    /// Reads temperature and cooling state together under one lock hold.
    pub fn read_telemetry(&self) -> Result<RawTelemetry, CanonicalError> {
        self.with_handle(|sdk, handle| {
            let temperature = sdk.temperature(handle)?;
            let cooling = sdk.cooling_info(handle)?;
            Ok(RawTelemetry{temperature, cooling})
        })
    }

    pub fn set_amplifier_switched(&self, switched: bool) -> Result<(), CanonicalError> {
        self.with_handle(|sdk, handle| sdk.set_amplifier_switched(handle, switched))
    }

    pub fn start_exposure(&self, seconds: f64) -> Result<(), CanonicalError> {
        self.with_handle(|sdk, handle| sdk.start_exposure(handle, seconds))
    }

    pub fn stop_exposure(&self) -> Result<(), CanonicalError> {
        self.with_handle(|sdk, handle| sdk.stop_exposure(handle))
    }

    pub fn image_ready(&self) -> Result<bool, CanonicalError> {
        self.with_handle(|sdk, handle| sdk.image_ready(handle))
    }

    pub fn fetch_image(&self) -> Result<RawImage, CanonicalError> {
        self.with_handle(|sdk, handle| sdk.fetch_image(handle))
    }

    fn with_handle<T, F>(&self, op: F) -> Result<T, CanonicalError>
    where F: FnOnce(&mut dyn CameraSdk, SdkHandle) -> Result<T, CanonicalError>
    {
        let mut inner = self.inner.lock().unwrap();
        let Some(handle) = inner.handle else {
            return Err(failed_precondition_error("Camera not connected"));
        };
        op(inner.sdk.as_mut(), handle)
    }
}

// mod tests.
