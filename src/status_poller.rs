// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::camd::CoolingStatus;
use crate::camera_sdk::{COOLING_FLAG_COOLING_ON, COOLING_FLAG_WARMING_UP,
                        RawTelemetry};
use crate::driver_gateway::DriverGateway;

// Sensor must be within this many degrees of the setpoint to count as locked.
const LOCK_TOLERANCE: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoolingState {
    // Degrees C.
    pub temperature: f64,
    // None when cooling is disabled or warming up.
    pub target_temperature: Option<f64>,
    pub locked: bool,
    pub cooler_enabled: bool,
    // Percent, 0..100.
    pub cooler_power: f64,
}

impl CoolingState {
    pub fn from_telemetry(telemetry: &RawTelemetry) -> Self {
        let cooling = &telemetry.cooling;
        let cooler_enabled = cooling.flags & COOLING_FLAG_COOLING_ON != 0;
        let warming = cooling.flags & COOLING_FLAG_WARMING_UP != 0;
        let max_level = if cooling.max_level == 0 { 255 } else { cooling.max_level };
        let cooler_power = cooling.level as f64 * 100.0 / max_level as f64;

        let target_temperature = if cooler_enabled && !warming {
            Some(cooling.setpoint as f64 / 100.0)
        } else {
            None
        };
        let locked = match target_temperature {
            Some(target) => (telemetry.temperature - target).abs() < LOCK_TOLERANCE,
            None => false,
        };
        CoolingState{temperature: telemetry.temperature, target_temperature,
                     locked, cooler_enabled, cooler_power}
    }

    pub fn to_proto(&self) -> CoolingStatus {
        CoolingStatus{
            temperature: self.temperature,
            target_temperature: self.target_temperature,
            locked: self.locked,
            cooler_enabled: self.cooler_enabled,
            cooler_power: self.cooler_power,
        }
    }
}

/// Periodically reads camera telemetry through the driver gateway, keeping
/// the most recent cooling state available to status reports and to the
/// frame metadata.
pub struct StatusPoller {
    state: Arc<Mutex<PollerState>>,

    // Signalled to wake the worker early (poll request or stop request), and
    // by the worker when it exits.
    wake: Arc<Condvar>,
}

struct PollerState {
    cooling: Option<CoolingState>,
    poll_request: bool,
    stop_request: bool,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl StatusPoller {
    pub fn new(gateway: Arc<DriverGateway>, interval: Duration) -> Self {
        let poller = StatusPoller{
            state: Arc::new(Mutex::new(PollerState{
                cooling: None,
                poll_request: false,
                stop_request: false,
                worker_thread: None,
            })),
            wake: Arc::new(Condvar::new()),
        };
        let cloned_state = poller.state.clone();
        let cloned_wake = poller.wake.clone();
        poller.state.lock().unwrap().worker_thread = Some(thread::spawn(move || {
            StatusPoller::worker(gateway, interval, cloned_state, cloned_wake);
        }));
        poller
    }

    /// Most recent cooling state; None if the camera is not connected.
    pub fn cooling(&self) -> Option<CoolingState> {
        self.state.lock().unwrap().cooling
    }

    /// Asks the worker to poll now rather than at the end of its interval.
    pub fn poll_now(&self) {
        self.state.lock().unwrap().poll_request = true;
        self.wake.notify_all();
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.worker_thread.is_none() {
            return;
        }
        state.stop_request = true;
        self.wake.notify_all();
        while state.worker_thread.is_some() {
            state = self.wake.wait(state).unwrap();
        }
    }

    fn worker(gateway: Arc<DriverGateway>, interval: Duration,
              state: Arc<Mutex<PollerState>>, wake: Arc<Condvar>) {
        debug!("Starting status poller");
        loop {
            // A request arriving while we poll is kept for the next round.
            state.lock().unwrap().poll_request = false;
            let cooling = if gateway.is_connected() {
                match gateway.read_telemetry() {
                    Ok(telemetry) => Some(CoolingState::from_telemetry(&telemetry)),
                    Err(e) => {
                        warn!("Error reading camera telemetry: {:?}", e);
                        None
                    },
                }
            } else {
                None
            };
            let mut locked_state = state.lock().unwrap();
            locked_state.cooling = cooling;
            let (mut locked_state, _) = wake.wait_timeout_while(
                locked_state, interval,
                |s| !s.poll_request && !s.stop_request).unwrap();
            if locked_state.stop_request {
                debug!("Stopping status poller");
                locked_state.stop_request = false;
                locked_state.worker_thread = None;
                wake.notify_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate approx;
    use approx::assert_abs_diff_eq;
    use std::time::Instant;
    use crate::camera_sdk::{RawCoolingInfo, UsbPortPath};
    use crate::sim_sdk::SimulatedSdk;
    use super::*;

    fn telemetry(temperature: f64, flags: i32, level: i32, max_level: i32,
                 setpoint: i32) -> RawTelemetry {
        RawTelemetry{temperature,
                     cooling: RawCoolingInfo{flags, level, min_level: 0,
                                             max_level, setpoint}}
    }

    #[test]
    fn test_cooling_derivation() {
        let state = CoolingState::from_telemetry(
            &telemetry(-9.7, COOLING_FLAG_COOLING_ON, 128, 255, -1000));
        assert!(state.cooler_enabled);
        assert_eq!(state.target_temperature, Some(-10.0));
        assert!(state.locked);
        assert_abs_diff_eq!(state.cooler_power, 50.196, epsilon = 0.001);

        // Outside tolerance.
        let state = CoolingState::from_telemetry(
            &telemetry(-9.4, COOLING_FLAG_COOLING_ON, 128, 255, -1000));
        assert!(!state.locked);

        // Warming up: no target, never locked.
        let state = CoolingState::from_telemetry(
            &telemetry(-10.0, COOLING_FLAG_COOLING_ON | COOLING_FLAG_WARMING_UP,
                       10, 255, -1000));
        assert_eq!(state.target_temperature, None);
        assert!(!state.locked);

        // Zero max level is treated as 255.
        let state = CoolingState::from_telemetry(&telemetry(20.0, 0, 255, 0, 0));
        assert!(!state.cooler_enabled);
        assert_abs_diff_eq!(state.cooler_power, 100.0, epsilon = 0.001);
    }

    #[test]
    fn test_poller_tracks_connection() {
        let port_path = UsbPortPath::new(1, vec![3]);
        let gateway = Arc::new(DriverGateway::new(
            Box::new(SimulatedSdk::new(port_path.clone()))));
        let poller = StatusPoller::new(gateway.clone(), Duration::from_secs(10));
        assert_eq!(poller.cooling(), None);

        gateway.connect(&port_path).unwrap();
        gateway.set_cooling(Some(-5.0)).unwrap();
        poller.poll_now();
        let start = Instant::now();
        while poller.cooling().is_none() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        let cooling = poller.cooling().unwrap();
        assert_eq!(cooling.target_temperature, Some(-5.0));

        gateway.disconnect().unwrap();
        poller.poll_now();
        let start = Instant::now();
        while poller.cooling().is_some() && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(poller.cooling(), None);
        poller.stop();
    }

}  // mod tests.
