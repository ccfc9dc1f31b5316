// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! A software camera standing in for the Artemis SDK. Used by `--simulate`
//! and by tests, which also use it to observe the driver calls made by the
//! daemon and to inject failures.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error, internal_error};
use log::debug;
use rand::Rng;

use crate::camera_sdk::{CameraSdk, COOLING_FLAG_COOLING_ON, COOLING_FLAG_WARMING_UP,
                        DeviceInfo, RawCoolingInfo, RawImage, SdkHandle,
                        UsbPortPath};

const AMBIENT_TEMPERATURE: f64 = 20.0;
const MAX_COOLING_LEVEL: i32 = 255;
// The cooler can hold at most this many degrees below ambient.
const MAX_COOLING_DELTA: f64 = 40.0;

const SIM_HANDLE: SdkHandle = SdkHandle(0x5157);

#[derive(Clone, Debug)]
pub struct SimulatedDevice {
    pub port_path: UsbPortPath,
    pub in_use: bool,
}

/// Everything the simulated camera knows. Tests may inspect and alter this
/// through `SimulatedSdk::camera()`.
#[derive(Debug)]
pub struct SimulatedCamera {
    pub devices: Vec<SimulatedDevice>,
    pub connected: bool,

    pub temperature: f64,
    pub setpoint: Option<f64>,

    pub width: u32,
    pub height: u32,
    // Time from the end of integration until the image is ready.
    pub readout_time: Duration,

    pub amplifier_switched: Option<bool>,
    // Exposure durations passed to each start_exposure() call.
    pub exposure_starts: Vec<f64>,
    pub exposure_stops: usize,
    pub images_fetched: usize,
    pub disconnects: usize,

    // Fault injection.
    pub fail_connect: bool,
    pub fail_set_cooling: bool,
    // start_exposure() fails once this many calls have succeeded.
    pub fail_start_exposure_after: Option<usize>,

    ready_at: Option<Instant>,
}

#[derive(Clone)]
pub struct SimulatedSdk {
    camera: Arc<Mutex<SimulatedCamera>>,
}

impl SimulatedSdk {
    /// Creates a simulated SDK with a single free device at `port_path`.
    pub fn new(port_path: UsbPortPath) -> Self {
        SimulatedSdk{
            camera: Arc::new(Mutex::new(SimulatedCamera{
                devices: vec![SimulatedDevice{port_path, in_use: false}],
                connected: false,
                temperature: AMBIENT_TEMPERATURE,
                setpoint: None,
                width: 64,
                height: 48,
                readout_time: Duration::from_millis(50),
                amplifier_switched: None,
                exposure_starts: Vec::new(),
                exposure_stops: 0,
                images_fetched: 0,
                disconnects: 0,
                fail_connect: false,
                fail_set_cooling: false,
                fail_start_exposure_after: None,
                ready_at: None,
            })),
        }
    }

    pub fn camera(&self) -> Arc<Mutex<SimulatedCamera>> {
        self.camera.clone()
    }

    fn connected_camera(&self, handle: SdkHandle)
                        -> Result<std::sync::MutexGuard<'_, SimulatedCamera>,
                                  CanonicalError> {
        let camera = self.camera.lock().unwrap();
        if !camera.connected || handle != SIM_HANDLE {
            return Err(failed_precondition_error("Simulated camera not connected"));
        }
        Ok(camera)
    }
}

impl SimulatedCamera {
    fn cooling_target(&self) -> f64 {
        match self.setpoint {
            Some(setpoint) => setpoint.max(AMBIENT_TEMPERATURE - MAX_COOLING_DELTA),
            None => AMBIENT_TEMPERATURE,
        }
    }
}

impl CameraSdk for SimulatedSdk {
    fn list_devices(&mut self) -> Result<Vec<DeviceInfo>, CanonicalError> {
        let camera = self.camera.lock().unwrap();
        Ok(camera.devices.iter().enumerate()
           .filter(|(_, device)| !device.in_use)
           .map(|(index, device)| DeviceInfo{device_index: index as i32,
                                             port_path: device.port_path.clone()})
           .collect())
    }

    fn connect(&mut self, device_index: i32) -> Result<SdkHandle, CanonicalError> {
        let mut camera = self.camera.lock().unwrap();
        if camera.fail_connect {
            return Err(internal_error("Simulated connect failure"));
        }
        let Some(device) = camera.devices.get_mut(device_index as usize) else {
            return Err(internal_error(&format!("No device {}", device_index)));
        };
        device.in_use = true;
        camera.connected = true;
        Ok(SIM_HANDLE)
    }

    fn disconnect(&mut self, handle: SdkHandle) -> Result<(), CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        camera.connected = false;
        camera.ready_at = None;
        camera.disconnects += 1;
        for device in &mut camera.devices {
            device.in_use = false;
        }
        Ok(())
    }

    fn set_cooling(&mut self, handle: SdkHandle, setpoint: Option<f64>)
                   -> Result<(), CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        if camera.fail_set_cooling {
            return Err(internal_error("Simulated cooling failure"));
        }
        camera.setpoint = setpoint;
        Ok(())
    }

    fn cooling_info(&mut self, handle: SdkHandle)
                    -> Result<RawCoolingInfo, CanonicalError> {
        let camera = self.connected_camera(handle)?;
        let delta = (AMBIENT_TEMPERATURE - camera.temperature).max(0.0);
        let level = ((delta / MAX_COOLING_DELTA) * MAX_COOLING_LEVEL as f64)
            .round() as i32;
        let (flags, setpoint) = match camera.setpoint {
            Some(setpoint) => (COOLING_FLAG_COOLING_ON, (setpoint * 100.0).round() as i32),
            None => (if delta > 0.5 { COOLING_FLAG_WARMING_UP } else { 0 }, 0),
        };
        Ok(RawCoolingInfo{flags, level: level.min(MAX_COOLING_LEVEL),
                          min_level: 0, max_level: MAX_COOLING_LEVEL, setpoint})
    }

    // Each reading moves the sensor halfway to where the cooler is driving it.
    fn temperature(&mut self, handle: SdkHandle) -> Result<f64, CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        let target = camera.cooling_target();
        camera.temperature += (target - camera.temperature) / 2.0;
        Ok(camera.temperature)
    }

    fn set_amplifier_switched(&mut self, handle: SdkHandle, switched: bool)
                              -> Result<(), CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        camera.amplifier_switched = Some(switched);
        Ok(())
    }

    fn start_exposure(&mut self, handle: SdkHandle, seconds: f64)
                      -> Result<(), CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        if let Some(limit) = camera.fail_start_exposure_after {
            if camera.exposure_starts.len() >= limit {
                return Err(internal_error("Simulated exposure failure"));
            }
        }
        camera.exposure_starts.push(seconds);
        camera.ready_at = Some(Instant::now() + Duration::from_secs_f64(seconds) +
                               camera.readout_time);
        debug!("Simulated exposure {}s started", seconds);
        Ok(())
    }

    fn stop_exposure(&mut self, handle: SdkHandle) -> Result<(), CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        camera.exposure_stops += 1;
        camera.ready_at = None;
        Ok(())
    }

    fn image_ready(&mut self, handle: SdkHandle) -> Result<bool, CanonicalError> {
        let camera = self.connected_camera(handle)?;
        Ok(matches!(camera.ready_at, Some(ready_at) if Instant::now() >= ready_at))
    }

    fn fetch_image(&mut self, handle: SdkHandle) -> Result<RawImage, CanonicalError> {
        let mut camera = self.connected_camera(handle)?;
        match camera.ready_at {
            Some(ready_at) if Instant::now() >= ready_at => (),
            _ => return Err(failed_precondition_error("No image ready")),
        }
        camera.ready_at = None;
        camera.images_fetched += 1;
        let mut rng = rand::thread_rng();
        let num_pixels = (camera.width * camera.height) as usize;
        let pixels = (0..num_pixels).map(|_| 1000 + rng.gen_range(0..64)).collect();
        Ok(RawImage{width: camera.width, height: camera.height, pixels})
    }
}

// mod tests.
