// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Binding to the Atik Artemis SDK shared library, loaded at runtime.
//!
//! Device port paths are obtained by asking the SDK for each device's libusb
//! device and querying libusb for its bus and port chain.

use std::ffi::c_void;
use std::os::raw::{c_float, c_int};
use std::ptr;

use canonical_error::{CanonicalError, internal_error, not_found_error};
use libloading::Library;
use log::{debug, info};

use crate::camera_sdk::{CameraSdk, DeviceInfo, RawCoolingInfo, RawImage,
                        SdkHandle, UsbPortPath};

const ARTEMIS_LIBRARY: &str = "libatikcameras.so";
const LIBUSB_LIBRARY: &str = "libusb-1.0.so.0";

// Sensor index for the CCD temperature, as used by ArtemisTemperatureSensorInfo.
const CCD_TEMPERATURE_SENSOR: c_int = 1;

// USB 3.0 allows a chain of up to 7 hubs.
const MAX_PORT_DEPTH: usize = 7;

type ArtemisHandle = *mut c_void;

type DeviceCountFn = unsafe extern "C" fn() -> c_int;
type DevicePresentFn = unsafe extern "C" fn(c_int) -> bool;
type DeviceInUseFn = unsafe extern "C" fn(c_int) -> bool;
type DeviceGetLibUsbDeviceFn = unsafe extern "C" fn(c_int, *mut *mut c_void) -> c_int;
type ConnectFn = unsafe extern "C" fn(c_int) -> ArtemisHandle;
type DisconnectFn = unsafe extern "C" fn(ArtemisHandle) -> bool;
type SetCoolingFn = unsafe extern "C" fn(ArtemisHandle, c_int) -> c_int;
type CoolerWarmUpFn = unsafe extern "C" fn(ArtemisHandle) -> c_int;
type CoolingInfoFn = unsafe extern "C" fn(ArtemisHandle, *mut c_int, *mut c_int,
                                          *mut c_int, *mut c_int, *mut c_int) -> c_int;
type TemperatureSensorInfoFn = unsafe extern "C" fn(ArtemisHandle, c_int, *mut c_int) -> c_int;
type SetAmplifierSwitchedFn = unsafe extern "C" fn(ArtemisHandle, bool) -> c_int;
type StartExposureFn = unsafe extern "C" fn(ArtemisHandle, c_float) -> c_int;
type AbortExposureFn = unsafe extern "C" fn(ArtemisHandle) -> c_int;
type ImageReadyFn = unsafe extern "C" fn(ArtemisHandle) -> bool;
type GetImageDataFn = unsafe extern "C" fn(ArtemisHandle, *mut c_int, *mut c_int,
                                           *mut c_int, *mut c_int, *mut c_int,
                                           *mut c_int) -> c_int;
type ImageBufferFn = unsafe extern "C" fn(ArtemisHandle) -> *mut c_void;

type UsbGetBusNumberFn = unsafe extern "C" fn(*mut c_void) -> u8;
type UsbGetPortNumbersFn = unsafe extern "C" fn(*mut c_void, *mut u8, c_int) -> c_int;

pub struct ArtemisSdk {
    // Libraries must outlive the function pointers resolved from them.
    _artemis: Library,
    _libusb: Library,

    device_count: DeviceCountFn,
    device_present: DevicePresentFn,
    device_in_use: DeviceInUseFn,
    device_get_libusb_device: DeviceGetLibUsbDeviceFn,
    connect: ConnectFn,
    disconnect: DisconnectFn,
    set_cooling: SetCoolingFn,
    cooler_warm_up: CoolerWarmUpFn,
    cooling_info: CoolingInfoFn,
    temperature_sensor_info: TemperatureSensorInfoFn,
    set_amplifier_switched: SetAmplifierSwitchedFn,
    start_exposure: StartExposureFn,
    abort_exposure: AbortExposureFn,
    image_ready: ImageReadyFn,
    get_image_data: GetImageDataFn,
    image_buffer: ImageBufferFn,

    usb_get_bus_number: UsbGetBusNumberFn,
    usb_get_port_numbers: UsbGetPortNumbersFn,
}

fn load_library(name: &str) -> Result<Library, CanonicalError> {
    unsafe { Library::new(name) }.map_err(|e| {
        not_found_error(&format!("Could not load {}: {}", name, e))
    })
}

fn symbol<T: Copy>(library: &Library, name: &str) -> Result<T, CanonicalError> {
    let mut cname = name.as_bytes().to_vec();
    cname.push(0);
    let sym = unsafe { library.get::<T>(&cname) }.map_err(|e| {
        internal_error(&format!("Missing symbol {}: {}", name, e))
    })?;
    Ok(*sym)
}

fn artemis_error_name(code: c_int) -> &'static str {
    match code {
        0 => "OK",
        1 => "INVALID_PARAMETER",
        2 => "NOT_CONNECTED",
        3 => "NOT_IMPLEMENTED",
        4 => "NO_RESPONSE",
        5 => "INVALID_FUNCTION",
        6 => "NOT_INITIALIZED",
        7 => "OPERATION_FAILED",
        _ => "UNKNOWN",
    }
}

fn check(code: c_int, what: &str) -> Result<(), CanonicalError> {
    if code == 0 {
        return Ok(());
    }
    Err(internal_error(&format!("{} failed: {} ({})",
                                what, artemis_error_name(code), code)))
}

fn native(handle: SdkHandle) -> ArtemisHandle {
    handle.0 as ArtemisHandle
}

impl ArtemisSdk {
    pub fn load() -> Result<Self, CanonicalError> {
        let artemis = load_library(ARTEMIS_LIBRARY)?;
        let libusb = load_library(LIBUSB_LIBRARY)?;
        let sdk = ArtemisSdk{
            device_count: symbol(&artemis, "ArtemisDeviceCount")?,
            device_present: symbol(&artemis, "ArtemisDevicePresent")?,
            device_in_use: symbol(&artemis, "ArtemisDeviceInUse")?,
            device_get_libusb_device: symbol(&artemis, "ArtemisDeviceGetLibUSBDevice")?,
            connect: symbol(&artemis, "ArtemisConnect")?,
            disconnect: symbol(&artemis, "ArtemisDisconnect")?,
            set_cooling: symbol(&artemis, "ArtemisSetCooling")?,
            cooler_warm_up: symbol(&artemis, "ArtemisCoolerWarmUp")?,
            cooling_info: symbol(&artemis, "ArtemisCoolingInfo")?,
            temperature_sensor_info: symbol(&artemis, "ArtemisTemperatureSensorInfo")?,
            set_amplifier_switched: symbol(&artemis, "ArtemisSetAmplifierSwitched")?,
            start_exposure: symbol(&artemis, "ArtemisStartExposure")?,
            abort_exposure: symbol(&artemis, "ArtemisAbortExposure")?,
            image_ready: symbol(&artemis, "ArtemisImageReady")?,
            get_image_data: symbol(&artemis, "ArtemisGetImageData")?,
            image_buffer: symbol(&artemis, "ArtemisImageBuffer")?,
            usb_get_bus_number: symbol(&libusb, "libusb_get_bus_number")?,
            usb_get_port_numbers: symbol(&libusb, "libusb_get_port_numbers")?,
            _artemis: artemis,
            _libusb: libusb,
        };
        info!("Loaded {}", ARTEMIS_LIBRARY);
        Ok(sdk)
    }

    fn port_path(&self, device_index: c_int) -> Option<UsbPortPath> {
        let mut usb_device: *mut c_void = ptr::null_mut();
        let result = unsafe {
            (self.device_get_libusb_device)(device_index, &mut usb_device)
        };
        if result != 0 || usb_device.is_null() {
            debug!("No libusb device for Artemis device {}", device_index);
            return None;
        }
        let mut ports = [0_u8; MAX_PORT_DEPTH];
        let (bus, depth) = unsafe {
            ((self.usb_get_bus_number)(usb_device),
             (self.usb_get_port_numbers)(usb_device, ports.as_mut_ptr(),
                                         MAX_PORT_DEPTH as c_int))
        };
        if depth < 0 {
            debug!("libusb_get_port_numbers failed for device {}", device_index);
            return None;
        }
        Some(UsbPortPath::new(bus, ports[..depth as usize].to_vec()))
    }
}

impl CameraSdk for ArtemisSdk {
    fn list_devices(&mut self) -> Result<Vec<DeviceInfo>, CanonicalError> {
        let count = unsafe { (self.device_count)() };
        let mut devices = Vec::<DeviceInfo>::new();
        for device_index in 0..count {
            let usable = unsafe {
                (self.device_present)(device_index) &&
                    !(self.device_in_use)(device_index)
            };
            if !usable {
                continue;
            }
            if let Some(port_path) = self.port_path(device_index) {
                devices.push(DeviceInfo{device_index, port_path});
            }
        }
        Ok(devices)
    }

    fn connect(&mut self, device_index: i32) -> Result<SdkHandle, CanonicalError> {
        let handle = unsafe { (self.connect)(device_index) };
        if handle.is_null() {
            return Err(internal_error(
                &format!("ArtemisConnect failed for device {}", device_index)));
        }
        Ok(SdkHandle(handle as usize))
    }

    fn disconnect(&mut self, handle: SdkHandle) -> Result<(), CanonicalError> {
        if !unsafe { (self.disconnect)(native(handle)) } {
            return Err(internal_error("ArtemisDisconnect failed"));
        }
        Ok(())
    }

    fn set_cooling(&mut self, handle: SdkHandle, setpoint: Option<f64>)
                   -> Result<(), CanonicalError> {
        match setpoint {
            Some(degrees) => {
                let hundredths = (degrees * 100.0).round() as c_int;
                check(unsafe { (self.set_cooling)(native(handle), hundredths) },
                      "ArtemisSetCooling")
            },
            None => check(unsafe { (self.cooler_warm_up)(native(handle)) },
                          "ArtemisCoolerWarmUp"),
        }
    }

    fn cooling_info(&mut self, handle: SdkHandle)
                    -> Result<RawCoolingInfo, CanonicalError> {
        let mut info = RawCoolingInfo::default();
        check(unsafe {
            (self.cooling_info)(native(handle), &mut info.flags, &mut info.level,
                                &mut info.min_level, &mut info.max_level,
                                &mut info.setpoint)
        }, "ArtemisCoolingInfo")?;
        Ok(info)
    }

    fn temperature(&mut self, handle: SdkHandle) -> Result<f64, CanonicalError> {
        let mut hundredths: c_int = 0;
        check(unsafe {
            (self.temperature_sensor_info)(native(handle), CCD_TEMPERATURE_SENSOR,
                                           &mut hundredths)
        }, "ArtemisTemperatureSensorInfo")?;
        Ok(hundredths as f64 / 100.0)
    }

    fn set_amplifier_switched(&mut self, handle: SdkHandle, switched: bool)
                              -> Result<(), CanonicalError> {
        check(unsafe { (self.set_amplifier_switched)(native(handle), switched) },
              "ArtemisSetAmplifierSwitched")
    }

    fn start_exposure(&mut self, handle: SdkHandle, seconds: f64)
                      -> Result<(), CanonicalError> {
        check(unsafe { (self.start_exposure)(native(handle), seconds as c_float) },
              "ArtemisStartExposure")
    }

    fn stop_exposure(&mut self, handle: SdkHandle) -> Result<(), CanonicalError> {
        check(unsafe { (self.abort_exposure)(native(handle)) },
              "ArtemisAbortExposure")
    }

    fn image_ready(&mut self, handle: SdkHandle) -> Result<bool, CanonicalError> {
        Ok(unsafe { (self.image_ready)(native(handle)) })
    }

    fn fetch_image(&mut self, handle: SdkHandle) -> Result<RawImage, CanonicalError> {
        let (mut x, mut y, mut width, mut height, mut binx, mut biny) =
            (0, 0, 0, 0, 0, 0);
        check(unsafe {
            (self.get_image_data)(native(handle), &mut x, &mut y, &mut width,
                                  &mut height, &mut binx, &mut biny)
        }, "ArtemisGetImageData")?;
        if width <= 0 || height <= 0 {
            return Err(internal_error(
                &format!("Invalid image dimensions {}x{}", width, height)));
        }
        let buffer = unsafe { (self.image_buffer)(native(handle)) } as *const u16;
        if buffer.is_null() {
            return Err(internal_error("ArtemisImageBuffer returned null"));
        }
        let num_pixels = width as usize * height as usize;
        let pixels = unsafe { std::slice::from_raw_parts(buffer, num_pixels) }.to_vec();
        debug!("Fetched {}x{} image (bin {}x{})", width, height, binx, biny);
        Ok(RawImage{width: width as u32, height: height as u32, pixels})
    }
}
