// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};

use canonical_error::{CanonicalError, CanonicalErrorCode};
use log::{error, info, warn};

use crate::acquisition_engine::{AcquisitionEngine, AcquisitionPhase, SequenceConfig,
                                SequenceContext, SequenceTiming};
use crate::camd::{CameraState as ReportedState, CommandStatus, StatusReport};
use crate::camera_sdk::{CameraSdk, UsbPortPath};
use crate::config::{DaemonConfig, MAX_EXPOSURE_TIME, MAX_TEMPERATURE, MIN_TEMPERATURE};
use crate::driver_gateway::DriverGateway;
use crate::exposure_counter::ExposureCounter;
use crate::frame_dispatcher::{DispatcherSettings, FrameDispatcher, FrameNotifier};
use crate::sequence_signals::SequenceSignals;
use crate::status_poller::StatusPoller;
use crate::trigger_stats::TriggerStats;

const DEFAULT_EXPOSURE_TIME: f64 = 1.0;
const RECENT_TRIGGERS: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraState {
    Disabled,
    Initializing,
    Idle,
    Acquiring,
}

/// Owns the camera lifecycle. Every command except `report_status` runs
/// under a command lock that is never waited for: a command arriving while
/// another is executing is refused with `Blocked`.
pub struct CameraController {
    command_lock: Mutex<()>,
    state: Arc<Mutex<ControllerState>>,

    gateway: Arc<DriverGateway>,
    poller: Arc<StatusPoller>,
    dispatcher: FrameDispatcher,
    signals: Arc<SequenceSignals>,
    counter: Arc<Mutex<ExposureCounter>>,
    trigger_stats: Arc<Mutex<TriggerStats>>,

    port_path: UsbPortPath,
    default_temperature: f64,
    counter_path: PathBuf,
    timing: SequenceTiming,
}

struct ControllerState {
    camera_state: CameraState,
    exposure_time: f64,
    engine: Option<AcquisitionEngine>,
}

impl Drop for CameraController {
    fn drop(&mut self) {
        let engine = self.state.lock().unwrap().engine.take();
        if let Some(mut engine) = engine {
            engine.request_stop();
            engine.join();
        }
    }
}

fn valid_temperature(temperature: f64) -> bool {
    (MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature)
}

fn valid_exposure(seconds: f64) -> bool {
    (0.0..=MAX_EXPOSURE_TIME).contains(&seconds)
}

fn failure_status(e: &CanonicalError) -> CommandStatus {
    match e.code {
        CanonicalErrorCode::NotFound => CommandStatus::DeviceNotFound,
        _ => CommandStatus::Failed,
    }
}

impl CameraController {
    pub fn new(config: &DaemonConfig, sdk: Box<dyn CameraSdk>,
               notifier: Box<dyn FrameNotifier>, software_version: &str,
               timing: SequenceTiming) -> Self {
        let gateway = Arc::new(DriverGateway::new(sdk));
        let poller = Arc::new(StatusPoller::new(gateway.clone(), config.query_interval()));
        let signals = Arc::new(SequenceSignals::new());
        let dispatcher = FrameDispatcher::new(
            DispatcherSettings{
                camera_id: config.camera_id.clone(),
                output_path: config.output_path.clone(),
                handover_timeout: config.handover_timeout(),
                software_version: software_version.to_string(),
            },
            notifier, signals.clone());
        let counter = ExposureCounter::load_or_reset(&config.expcount_path);
        CameraController{
            command_lock: Mutex::new(()),
            state: Arc::new(Mutex::new(ControllerState{
                camera_state: CameraState::Disabled,
                exposure_time: DEFAULT_EXPOSURE_TIME,
                engine: None,
            })),
            gateway,
            poller,
            dispatcher,
            signals,
            counter: Arc::new(Mutex::new(counter)),
            trigger_stats: Arc::new(Mutex::new(TriggerStats::new(RECENT_TRIGGERS))),
            port_path: config.usb_port_path(),
            default_temperature: config.temperature_setpoint,
            counter_path: config.expcount_path.clone(),
            timing,
        }
    }

    pub fn camera_state(&self) -> CameraState {
        self.state.lock().unwrap().camera_state
    }

    fn begin_command(&self) -> Option<MutexGuard<'_, ()>> {
        match self.command_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }

    /// Connects to the camera and applies the default cooling setpoint.
    pub fn initialize(&self) -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        {
            let mut state = self.state.lock().unwrap();
            if state.camera_state != CameraState::Disabled {
                return CommandStatus::AlreadyInitialized;
            }
            state.camera_state = CameraState::Initializing;
        }
        info!("Initializing camera at {}", self.port_path);
        let result = self.gateway.connect(&self.port_path).and_then(|()| {
            self.gateway.set_cooling(Some(self.default_temperature))
        });
        let status = match result {
            Ok(()) => {
                info!("Camera initialized, cooling to {}C", self.default_temperature);
                self.state.lock().unwrap().camera_state = CameraState::Idle;
                CommandStatus::Succeeded
            },
            Err(e) => {
                error!("Camera initialization failed: {}", e.message);
                if let Err(e) = self.gateway.disconnect() {
                    warn!("Error releasing camera: {}", e.message);
                }
                self.state.lock().unwrap().camera_state = CameraState::Disabled;
                failure_status(&e)
            },
        };
        self.poller.poll_now();
        status
    }

    /// Stops any running sequence, releases cooling and disconnects.
    pub fn shutdown(&self) -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        let engine = {
            let mut state = self.state.lock().unwrap();
            if state.camera_state == CameraState::Disabled {
                return CommandStatus::NotInitialized;
            }
            state.engine.take()
        };
        // The engine's completion callback takes the state lock, so it must
        // not be held here.
        if let Some(mut engine) = engine {
            engine.request_stop();
            engine.join();
        }
        let status = match self.gateway.disconnect() {
            Ok(()) => CommandStatus::Succeeded,
            Err(e) => {
                error!("Error disconnecting camera: {}", e.message);
                CommandStatus::Failed
            },
        };
        self.state.lock().unwrap().camera_state = CameraState::Disabled;
        self.poller.poll_now();
        info!("Camera shut down");
        status
    }

    // Checks that the camera is idle, for commands that require it.
    fn require_idle(&self) -> Result<(), CommandStatus> {
        let camera_state = self.camera_state();
        match camera_state {
            CameraState::Idle => Ok(()),
            CameraState::Disabled => Err(CommandStatus::NotInitialized),
            _ => Err(CommandStatus::NotIdle),
        }
    }

    /// Sets the cooling setpoint and exposure time, applying defaults for
    /// whichever is omitted.
    pub fn configure(&self, temperature: Option<f64>, exposure: Option<f64>)
                     -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        if let Err(status) = self.require_idle() {
            return status;
        }
        let temperature = temperature.unwrap_or(self.default_temperature);
        let exposure = exposure.unwrap_or(DEFAULT_EXPOSURE_TIME);
        if !valid_temperature(temperature) || !valid_exposure(exposure) {
            return CommandStatus::OutOfRange;
        }
        if let Err(e) = self.gateway.set_cooling(Some(temperature)) {
            error!("Could not set cooling: {}", e.message);
            return CommandStatus::Failed;
        }
        self.state.lock().unwrap().exposure_time = exposure;
        self.poller.poll_now();
        info!("Configured: {}C, {}s exposures", temperature, exposure);
        CommandStatus::Succeeded
    }

    pub fn set_exposure(&self, seconds: f64) -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        if let Err(status) = self.require_idle() {
            return status;
        }
        if !valid_exposure(seconds) {
            return CommandStatus::OutOfRange;
        }
        self.state.lock().unwrap().exposure_time = seconds;
        info!("Exposure time set to {}s", seconds);
        CommandStatus::Succeeded
    }

    /// `temperature` of None releases cooling and lets the camera warm up.
    /// Allowed while a sequence is running.
    pub fn set_target_temperature(&self, temperature: Option<f64>) -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        if self.camera_state() == CameraState::Disabled {
            return CommandStatus::NotInitialized;
        }
        if let Some(t) = temperature {
            if !valid_temperature(t) {
                return CommandStatus::OutOfRange;
            }
        }
        if let Err(e) = self.gateway.set_cooling(temperature) {
            error!("Could not set cooling: {}", e.message);
            return CommandStatus::Failed;
        }
        match temperature {
            Some(t) => info!("Target temperature set to {}C", t),
            None => info!("Cooling released"),
        }
        self.poller.poll_now();
        CommandStatus::Succeeded
    }

    /// Starts acquiring `count` frames; 0 means until stopped.
    pub fn start_sequence(&self, count: u32) -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        let mut state = self.state.lock().unwrap();
        match state.camera_state {
            CameraState::Idle => (),
            CameraState::Disabled => return CommandStatus::NotInitialized,
            _ => return CommandStatus::NotIdle,
        }
        let context = match self.sequence_context() {
            Ok(context) => context,
            Err(e) => {
                error!("Cannot start sequence: {}", e.message);
                return CommandStatus::Failed;
            },
        };
        // Idle means the previous sequence has reported completion; this
        // only reaps its thread.
        if let Some(mut previous) = state.engine.take() {
            previous.join();
        }
        let config = SequenceConfig{exposure_time: state.exposure_time, frame_limit: count};
        let weak_state: Weak<Mutex<ControllerState>> = Arc::downgrade(&self.state);
        let on_finished = Box::new(move || {
            if let Some(state) = weak_state.upgrade() {
                let mut state = state.lock().unwrap();
                if state.camera_state == CameraState::Acquiring {
                    state.camera_state = CameraState::Idle;
                }
            }
        });
        state.engine = Some(AcquisitionEngine::start(
            context, config, self.timing.clone(), on_finished));
        state.camera_state = CameraState::Acquiring;
        CommandStatus::Succeeded
    }

    pub fn stop_sequence(&self) -> CommandStatus {
        let Some(_command) = self.begin_command() else {
            return CommandStatus::Blocked;
        };
        let state = self.state.lock().unwrap();
        match state.camera_state {
            CameraState::Acquiring => (),
            CameraState::Disabled => return CommandStatus::NotInitialized,
            _ => return CommandStatus::NotAcquiring,
        }
        match &state.engine {
            Some(engine) if engine.request_stop() => {
                info!("Stopping sequence");
                CommandStatus::Succeeded
            },
            _ => CommandStatus::NotAcquiring,
        }
    }

    /// Snapshot of state, telemetry and sequence progress. Takes no command
    /// lock, so it can be answered while a command is executing.
    pub fn report_status(&self) -> StatusReport {
        let mut report = StatusReport{..Default::default()};
        {
            let state = self.state.lock().unwrap();
            report.exposure_time = state.exposure_time;
            let reported = match (state.camera_state, &state.engine) {
                (CameraState::Disabled, _) => ReportedState::Disabled,
                (CameraState::Initializing, _) => ReportedState::Initializing,
                (CameraState::Acquiring, Some(engine)) => {
                    let progress = engine.progress();
                    report.exposure_time = progress.exposure_time;
                    report.sequence_frame_limit = progress.frame_limit;
                    report.sequence_frame_count = progress.frame_count;
                    report.exposure_progress = progress.exposure_progress;
                    report.overlapped = progress.overlapped;
                    match progress.phase {
                        AcquisitionPhase::Waiting => ReportedState::Waiting,
                        AcquisitionPhase::Reading => ReportedState::Reading,
                        AcquisitionPhase::Aborting => ReportedState::Aborting,
                    }
                },
                _ => ReportedState::Idle,
            };
            report.set_state(reported);
            if state.camera_state != CameraState::Disabled {
                report.cooling = self.poller.cooling().map(|c| c.to_proto());
            }
        }
        {
            let counter = self.counter.lock().unwrap();
            report.exposure_count = counter.exposure_count;
            report.exposure_reference = counter.exposure_reference.clone();
        }
        report.trigger_timing = Some(self.trigger_stats.lock().unwrap().to_proto());
        report.last_fault = self.signals.last_fault();
        report
    }

    fn sequence_context(&self) -> Result<SequenceContext, CanonicalError> {
        Ok(SequenceContext{
            gateway: self.gateway.clone(),
            poller: self.poller.clone(),
            frames: self.dispatcher.queue()?,
            counter: self.counter.clone(),
            counter_path: self.counter_path.clone(),
            signals: self.signals.clone(),
            trigger_stats: self.trigger_stats.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;
    use std::time::{Duration, Instant};
    use crate::sim_sdk::{SimulatedCamera, SimulatedSdk};
    use super::*;

    struct RecordingNotifier {
        filenames: Arc<Mutex<Vec<String>>>,
    }

    impl FrameNotifier for RecordingNotifier {
        fn notify_frame(&mut self, _camera_id: &str, filename: &str,
                        _timeout: std::time::Duration) -> Result<(), CanonicalError> {
            self.filenames.lock().unwrap().push(filename.to_string());
            Ok(())
        }
    }

    struct Fixture {
        controller: CameraController,
        camera: Arc<Mutex<SimulatedCamera>>,
        filenames: Arc<Mutex<Vec<String>>>,
        _dir: tempfile::TempDir,
    }

    fn test_config(dir: &std::path::Path) -> DaemonConfig {
        DaemonConfig{
            listen_address: "127.0.0.1:9070".to_string(),
            pipeline_address: "http://127.0.0.1:9001".to_string(),
            pipeline_handover_timeout: 1.0,
            log_name: "camd_test".to_string(),
            control_machines: vec!["127.0.0.1".parse().unwrap()],
            usb_bus: 1,
            usb_port_numbers: vec![2, 4],
            camera_id: "CAM".to_string(),
            temperature_setpoint: -10.0,
            temperature_query_delay: 0.02,
            output_path: dir.to_path_buf(),
            expcount_path: dir.join("expcount.json"),
        }
    }

    fn scaled_timing() -> SequenceTiming {
        SequenceTiming{
            overlap_min_exposure: 0.3,
            trigger_exposure: 0.01,
            poll_interval: Duration::from_millis(10),
            coarse_window: Duration::from_millis(25),
            ..Default::default()
        }
    }

    // Hardware thresholds with faster polling.
    fn normal_timing() -> SequenceTiming {
        SequenceTiming{poll_interval: Duration::from_millis(10), ..Default::default()}
    }

    fn fixture_at(port_path: UsbPortPath) -> Fixture {
        fixture_with(port_path, scaled_timing())
    }

    fn fixture_with(port_path: UsbPortPath, timing: SequenceTiming) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sdk = SimulatedSdk::new(port_path);
        let camera = sdk.camera();
        camera.lock().unwrap().readout_time = Duration::from_millis(20);
        let filenames = Arc::new(Mutex::new(Vec::new()));
        let controller = CameraController::new(
            &test_config(dir.path()), Box::new(sdk),
            Box::new(RecordingNotifier{filenames: filenames.clone()}),
            "0.1.0-test", timing);
        Fixture{controller, camera, filenames, _dir: dir}
    }

    fn fixture() -> Fixture {
        fixture_at(UsbPortPath::new(1, vec![2, 4]))
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(20), "timed out: {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_idle(controller: &CameraController) {
        wait_for("idle", || controller.report_status().state() == ReportedState::Idle);
    }

    #[test]
    fn test_preconditions_when_disabled() {
        let f = fixture();
        let c = &f.controller;
        assert_eq!(c.report_status().state(), ReportedState::Disabled);
        assert_eq!(c.report_status().cooling, None);
        assert_eq!(c.shutdown(), CommandStatus::NotInitialized);
        assert_eq!(c.configure(None, None), CommandStatus::NotInitialized);
        assert_eq!(c.set_exposure(1.0), CommandStatus::NotInitialized);
        assert_eq!(c.start_sequence(1), CommandStatus::NotInitialized);
        assert_eq!(c.stop_sequence(), CommandStatus::NotInitialized);
        // No driver calls were made.
        assert!(!f.camera.lock().unwrap().connected);
    }

    #[test]
    fn test_initialize_and_shutdown() {
        let f = fixture();
        let c = &f.controller;
        assert_eq!(c.initialize(), CommandStatus::Succeeded);
        assert_eq!(c.camera_state(), CameraState::Idle);
        assert_eq!(c.initialize(), CommandStatus::AlreadyInitialized);
        assert_eq!(f.camera.lock().unwrap().setpoint, Some(-10.0));
        assert_eq!(c.stop_sequence(), CommandStatus::NotAcquiring);

        assert_eq!(c.shutdown(), CommandStatus::Succeeded);
        assert_eq!(c.camera_state(), CameraState::Disabled);
        let camera = f.camera.lock().unwrap();
        assert!(!camera.connected);
        assert_eq!(camera.setpoint, None);
    }

    #[test]
    fn test_initialize_failures() {
        let f = fixture_at(UsbPortPath::new(1, vec![2, 5]));
        assert_eq!(f.controller.initialize(), CommandStatus::DeviceNotFound);
        assert_eq!(f.controller.camera_state(), CameraState::Disabled);

        // Connected, then failed applying cooling: handle is released.
        let f = fixture();
        f.camera.lock().unwrap().fail_set_cooling = true;
        assert_eq!(f.controller.initialize(), CommandStatus::Failed);
        assert_eq!(f.controller.camera_state(), CameraState::Disabled);
        assert!(!f.camera.lock().unwrap().connected);
    }

    #[test]
    fn test_range_validation() {
        let f = fixture();
        let c = &f.controller;
        c.initialize();
        assert_eq!(c.configure(Some(-25.0), None), CommandStatus::OutOfRange);
        assert_eq!(c.configure(Some(31.0), None), CommandStatus::OutOfRange);
        assert_eq!(c.configure(None, Some(-1.0)), CommandStatus::OutOfRange);
        assert_eq!(c.set_exposure(f64::NAN), CommandStatus::OutOfRange);
        assert_eq!(c.set_exposure(f64::INFINITY), CommandStatus::OutOfRange);
        assert_eq!(c.set_exposure(1e20), CommandStatus::OutOfRange);
        assert_eq!(c.configure(None, Some(MAX_EXPOSURE_TIME + 1.0)),
                   CommandStatus::OutOfRange);
        assert_eq!(c.set_target_temperature(Some(-20.5)), CommandStatus::OutOfRange);
        // Nothing was changed.
        assert_eq!(f.camera.lock().unwrap().setpoint, Some(-10.0));
        assert_eq!(c.report_status().exposure_time, 1.0);

        assert_eq!(c.configure(Some(-20.0), Some(0.0)), CommandStatus::Succeeded);
        assert_eq!(c.report_status().exposure_time, 0.0);
        assert_eq!(c.configure(None, None), CommandStatus::Succeeded);
        assert_eq!(f.camera.lock().unwrap().setpoint, Some(-10.0));
        assert_eq!(c.report_status().exposure_time, 1.0);

        assert_eq!(c.set_exposure(MAX_EXPOSURE_TIME), CommandStatus::Succeeded);
        assert_eq!(c.report_status().exposure_time, MAX_EXPOSURE_TIME);
    }

    // Fails the first hand-off, slowly.
    struct SlowFirstHandoff {
        calls: usize,
    }

    impl FrameNotifier for SlowFirstHandoff {
        fn notify_frame(&mut self, _camera_id: &str, _filename: &str,
                        _timeout: std::time::Duration) -> Result<(), CanonicalError> {
            self.calls += 1;
            if self.calls == 1 {
                thread::sleep(Duration::from_millis(300));
                return Err(canonical_error::deadline_exceeded_error("pipeline too slow"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_earlier_handoff_failure_spares_next_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let sdk = SimulatedSdk::new(config.usb_port_path());
        sdk.camera().lock().unwrap().readout_time = Duration::from_millis(10);
        let c = CameraController::new(
            &config, Box::new(sdk), Box::new(SlowFirstHandoff{calls: 0}),
            "test", scaled_timing());
        c.initialize();
        c.set_exposure(0.02);
        assert_eq!(c.start_sequence(1), CommandStatus::Succeeded);
        wait_for_idle(&c);
        assert_eq!(c.report_status().last_fault, None);

        // The first sequence's frame is still being handed off.
        assert_eq!(c.start_sequence(0), CommandStatus::Succeeded);
        wait_for("fault", || c.report_status().last_fault.is_some());
        thread::sleep(Duration::from_millis(200));
        let report = c.report_status();
        assert!(matches!(report.state(), ReportedState::Waiting | ReportedState::Reading));
        assert!(report.last_fault.unwrap().contains("CAM-00000001.fits"));

        assert_eq!(c.stop_sequence(), CommandStatus::Succeeded);
        wait_for_idle(&c);
        assert!(c.report_status().last_fault.is_some());
    }

    // Three one-second frames.
    #[test]
    fn test_scenario_a_finite_sequence() {
        let f = fixture_with(UsbPortPath::new(1, vec![2, 4]), normal_timing());
        let c = &f.controller;
        c.initialize();
        assert_eq!(c.configure(None, Some(1.0)), CommandStatus::Succeeded);
        assert_eq!(c.start_sequence(3), CommandStatus::Succeeded);
        let report = c.report_status();
        assert!(matches!(report.state(), ReportedState::Waiting | ReportedState::Reading));
        assert!(!report.overlapped);
        assert_eq!(report.sequence_frame_limit, 3);

        wait_for_idle(c);
        wait_for("frames", || f.filenames.lock().unwrap().len() == 3);
        let filenames = f.filenames.lock().unwrap().clone();
        for (i, filename) in filenames.iter().enumerate() {
            assert!(filename.ends_with(&format!("CAM-{:08}.fits", i + 1)));
            let contents = fs::read(filename).unwrap();
            let header = String::from_utf8_lossy(&contents[..2880]).to_string();
            assert!(header.contains("EXPRQ   =             1.000000"));
            assert!(header.contains("SWVERSN = '0.1.0-test'"));
        }
        let report = c.report_status();
        assert_eq!(report.exposure_count, 3);
        assert_eq!(report.sequence_frame_count, 0);
        assert_eq!(f.camera.lock().unwrap().exposure_starts, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_scenario_b_unbounded_then_stop() {
        let f = fixture();
        let c = &f.controller;
        c.initialize();
        c.set_exposure(0.1);
        assert_eq!(c.start_sequence(0), CommandStatus::Succeeded);
        assert_eq!(c.start_sequence(0), CommandStatus::NotIdle);
        assert_eq!(c.configure(None, None), CommandStatus::NotIdle);
        wait_for("a frame", || c.report_status().sequence_frame_count >= 1);
        assert_eq!(c.stop_sequence(), CommandStatus::Succeeded);
        let state = c.report_status().state();
        assert!(state == ReportedState::Aborting || state == ReportedState::Idle);
        wait_for_idle(c);
        assert_eq!(c.stop_sequence(), CommandStatus::NotAcquiring);
        assert_eq!(c.report_status().sequence_frame_count, 0);
        // The camera can acquire again.
        assert_eq!(c.start_sequence(1), CommandStatus::Succeeded);
        wait_for_idle(c);
    }

    #[test]
    fn test_scenario_c_temperature() {
        let f = fixture();
        let c = &f.controller;
        assert_eq!(c.set_target_temperature(Some(-15.0)), CommandStatus::NotInitialized);
        c.initialize();
        assert_eq!(c.set_target_temperature(Some(-15.0)), CommandStatus::Succeeded);
        wait_for("locked", || {
            c.report_status().cooling.map_or(false, |cooling| {
                cooling.locked && cooling.target_temperature == Some(-15.0)
            })
        });
        let cooling = c.report_status().cooling.unwrap();
        assert!(cooling.cooler_enabled);
        assert!((cooling.temperature + 15.0).abs() < 0.5);

        assert_eq!(c.set_target_temperature(None), CommandStatus::Succeeded);
        wait_for("warming", || {
            c.report_status().cooling.map_or(false, |cooling| {
                cooling.target_temperature.is_none() && !cooling.locked
            })
        });
    }

    #[test]
    fn test_scenario_d_blocked() {
        let f = fixture();
        let c = &f.controller;
        c.initialize();
        {
            let _held = c.command_lock.lock().unwrap();
            assert_eq!(c.start_sequence(1), CommandStatus::Blocked);
            assert_eq!(c.shutdown(), CommandStatus::Blocked);
            // Status is still answered.
            assert_eq!(c.report_status().state(), ReportedState::Idle);
        }
        c.set_exposure(0.05);
        assert_eq!(c.start_sequence(1), CommandStatus::Succeeded);
        wait_for_idle(c);
    }

    #[test]
    fn test_scenario_e_overlapped() {
        let f = fixture();
        let c = &f.controller;
        c.initialize();
        c.set_exposure(0.3);
        assert_eq!(c.start_sequence(5), CommandStatus::Succeeded);
        let mut max_reported = 0;
        loop {
            let report = c.report_status();
            if report.state() == ReportedState::Idle {
                break;
            }
            assert!(report.overlapped);
            max_reported = max_reported.max(report.sequence_frame_count);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(max_reported, 4);
        wait_for("frames", || f.filenames.lock().unwrap().len() == 5);
        assert_eq!(f.camera.lock().unwrap().exposure_starts.len(), 6);
        let report = c.report_status();
        assert_eq!(report.exposure_count, 5);
        assert_eq!(report.trigger_timing.unwrap().trigger_count, 5);
    }

    #[test]
    fn test_progress_within_exposure() {
        let f = fixture();
        let c = &f.controller;
        c.initialize();
        c.set_exposure(0.5);
        c.start_sequence(1);
        let mut previous = 0.0;
        for _ in 0..30 {
            let progress = c.report_status().exposure_progress;
            assert!(progress >= previous);
            assert!(progress <= 1.0);
            previous = progress;
            thread::sleep(Duration::from_millis(10));
        }
        wait_for_idle(c);
        assert_eq!(c.report_status().exposure_progress, 0.0);
    }

    #[test]
    fn test_shutdown_stops_sequence() {
        let f = fixture();
        let c = &f.controller;
        c.initialize();
        c.set_exposure(0.05);
        c.start_sequence(0);
        wait_for("a frame", || c.report_status().sequence_frame_count >= 1);
        assert_eq!(c.shutdown(), CommandStatus::Succeeded);
        assert_eq!(c.report_status().state(), ReportedState::Disabled);
        assert!(!f.camera.lock().unwrap().connected);
    }

    #[test]
    fn test_counter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        for expected in [2, 4] {
            let filenames = Arc::new(Mutex::new(Vec::new()));
            let controller = CameraController::new(
                &config, Box::new(SimulatedSdk::new(config.usb_port_path())),
                Box::new(RecordingNotifier{filenames: filenames.clone()}),
                "test", scaled_timing());
            controller.initialize();
            controller.set_exposure(0.02);
            controller.start_sequence(2);
            wait_for_idle(&controller);
            assert_eq!(controller.report_status().exposure_count, expected);
        }
        let saved = ExposureCounter::load(&config.expcount_path).unwrap();
        assert_eq!(saved.exposure_count, 4);
    }

}  // mod tests.
