// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Runs one exposure sequence on a dedicated thread.
//!
//! In normal mode each frame is a single driver exposure: start, poll until
//! the image is ready, fetch. In overlapped mode the sensor integrates
//! continuously and the frame boundaries are set by short "trigger"
//! exposures issued on a wall-clock schedule; each trigger ends the frame
//! being integrated (which is then read out) and begins the next one. The
//! first trigger only flushes the sensor and establishes the timing origin.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error, internal_error,
                      invalid_argument_error};
use chrono::{DateTime, Utc};
use image::ImageBuffer;
use log::{debug, error, info, warn};

use crate::camera_sdk::RawImage;
use crate::config::MAX_EXPOSURE_TIME;
use crate::driver_gateway::DriverGateway;
use crate::exposure_counter::ExposureCounter;
use crate::frame::{Frame, Image16};
use crate::frame_dispatcher::FrameQueue;
use crate::sequence_signals::SequenceSignals;
use crate::status_poller::StatusPoller;
use crate::trigger_stats::TriggerStats;

/// Timing parameters for sequences. `Default` gives the values used with
/// real hardware; tests use scaled-down copies.
#[derive(Clone, Debug)]
pub struct SequenceTiming {
    // Exposures at least this long (seconds) use overlapped readout.
    pub overlap_min_exposure: f64,
    // Nominal duration (seconds) of the start call used as a readout trigger.
    pub trigger_exposure: f64,
    // Interval between image_ready polls, and granularity of the coarse wait.
    pub poll_interval: Duration,
    // The coarse wait ends this far ahead of a trigger time.
    pub coarse_window: Duration,
    // Sleep step used until within `fine_window` of a trigger time, after
    // which `finest_step` is used.
    pub fine_step: Duration,
    pub fine_window: Duration,
    pub finest_step: Duration,
    // Readout is abandoned if the image is not ready this long after the
    // exposure was due to end.
    pub readout_timeout: Duration,
}

impl Default for SequenceTiming {
    fn default() -> Self {
        SequenceTiming{
            overlap_min_exposure: 6.0,
            trigger_exposure: 0.098,
            poll_interval: Duration::from_millis(100),
            coarse_window: Duration::from_millis(250),
            fine_step: Duration::from_millis(1),
            fine_window: Duration::from_millis(2),
            finest_step: Duration::from_micros(100),
            readout_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SequenceConfig {
    // Seconds.
    pub exposure_time: f64,
    // Zero means run until stopped.
    pub frame_limit: u32,
}

impl SequenceConfig {
    pub fn overlapped(&self, timing: &SequenceTiming) -> bool {
        self.frame_limit != 1 && self.exposure_time >= timing.overlap_min_exposure
    }

    pub fn exposure_duration(&self) -> Result<Duration, CanonicalError> {
        if !(0.0..=MAX_EXPOSURE_TIME).contains(&self.exposure_time) {
            return Err(invalid_argument_error(
                &format!("Exposure time {}s is outside [0, {}]",
                         self.exposure_time, MAX_EXPOSURE_TIME)));
        }
        Duration::try_from_secs_f64(self.exposure_time).map_err(|e| {
            invalid_argument_error(
                &format!("Exposure time {}s: {}", self.exposure_time, e))
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionPhase {
    Waiting,
    Reading,
    Aborting,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SequenceProgress {
    // Aborting once a stop is requested. Otherwise, in normal mode Reading
    // once the exposure time has elapsed; in overlapped mode Reading while
    // the frame ended by the latest trigger is being read out.
    pub phase: AcquisitionPhase,
    pub frame_count: u32,
    pub frame_limit: u32,
    // Fraction 0..1 of the current exposure.
    pub exposure_progress: f64,
    pub exposure_time: f64,
    pub overlapped: bool,
}

/// Everything a sequence needs from the rest of the daemon.
#[derive(Clone)]
pub struct SequenceContext {
    pub gateway: Arc<DriverGateway>,
    pub poller: Arc<StatusPoller>,
    pub frames: FrameQueue,
    pub counter: Arc<Mutex<ExposureCounter>>,
    pub counter_path: PathBuf,
    pub signals: Arc<SequenceSignals>,
    pub trigger_stats: Arc<Mutex<TriggerStats>>,
}

pub struct AcquisitionEngine {
    state: Arc<Mutex<SequenceState>>,
    signals: Arc<SequenceSignals>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

struct SequenceState {
    config: SequenceConfig,
    overlapped: bool,
    // In overlapped mode this counts triggers, so it runs one ahead of the
    // frames actually read out.
    frame_count: u32,
    exposure_start: Option<Instant>,
    // Overlapped mode: a completed frame is being read out.
    reading: bool,
}

// Runs the completion callback when dropped, so that it runs even if the
// sequence thread panics.
struct FinishNotice(Option<Box<dyn FnOnce() + Send>>);

impl Drop for FinishNotice {
    fn drop(&mut self) {
        if let Some(on_finished) = self.0.take() {
            on_finished();
        }
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        if self.worker_thread.is_some() {
            self.request_stop();
            self.join();
        }
    }
}

impl AcquisitionEngine {
    /// Starts the sequence. `on_finished` is called from the sequence thread
    /// once the camera is quiescent, however the sequence ended.
    pub fn start(context: SequenceContext, config: SequenceConfig,
                 timing: SequenceTiming, on_finished: Box<dyn FnOnce() + Send>)
                 -> Self {
        let overlapped = config.overlapped(&timing);
        let sequence = context.signals.begin_sequence();
        context.trigger_stats.lock().unwrap().start_sequence();
        let state = Arc::new(Mutex::new(SequenceState{
            config, overlapped, frame_count: 0, exposure_start: None, reading: false}));
        let signals = context.signals.clone();
        let worker = SequenceWorker{context, state: state.clone(), config, timing, sequence};
        let worker_thread = thread::spawn(move || {
            let _notice = FinishNotice(Some(on_finished));
            worker.run(overlapped);
        });
        AcquisitionEngine{state, signals, worker_thread: Some(worker_thread)}
    }

    pub fn progress(&self) -> SequenceProgress {
        let state = self.state.lock().unwrap();
        let exposure_time = state.config.exposure_time;
        let elapsed = state.exposure_start.map(|start| start.elapsed().as_secs_f64());
        let exposure_progress = match elapsed {
            None => 0.0,
            Some(_) if exposure_time <= 0.0 => 1.0,
            Some(elapsed) => (elapsed / exposure_time).min(1.0),
        };
        let phase = if self.signals.should_stop() {
            AcquisitionPhase::Aborting
        } else if state.overlapped {
            if state.reading {
                AcquisitionPhase::Reading
            } else {
                AcquisitionPhase::Waiting
            }
        } else if elapsed.map_or(true, |elapsed| elapsed < exposure_time) {
            AcquisitionPhase::Waiting
        } else {
            AcquisitionPhase::Reading
        };
        let frame_limit = state.config.frame_limit;
        let frame_count = if state.overlapped && frame_limit > 0 {
            state.frame_count.min(frame_limit - 1)
        } else {
            state.frame_count
        };
        SequenceProgress{phase, frame_count, frame_limit, exposure_progress,
                         exposure_time, overlapped: state.overlapped}
    }

    /// Returns false if a stop was already requested.
    pub fn request_stop(&self) -> bool {
        self.signals.request_abort()
    }

    pub fn join(&mut self) {
        if let Some(worker_thread) = self.worker_thread.take() {
            if worker_thread.join().is_err() {
                error!("Sequence thread panicked");
            }
        }
    }
}

struct SequenceWorker {
    context: SequenceContext,
    state: Arc<Mutex<SequenceState>>,
    config: SequenceConfig,
    timing: SequenceTiming,
    sequence: u64,
}

// Wall clock and monotonic stamps of the same instant.
#[derive(Clone, Copy)]
struct Stamp {
    instant: Instant,
    time: DateTime<Utc>,
}

impl Stamp {
    fn now() -> Self {
        Stamp{instant: Instant::now(), time: Utc::now()}
    }
}

impl SequenceWorker {
    fn run(&self, overlapped: bool) {
        info!("Starting {} sequence: {}s x {}",
              if overlapped { "overlapped" } else { "normal" },
              self.config.exposure_time,
              if self.config.frame_limit == 0 { "unbounded".to_string() }
              else { self.config.frame_limit.to_string() });
        let result = if overlapped { self.run_overlapped() } else { self.run_normal() };
        if let Err(e) = result {
            error!("Sequence terminated: {:?}", e);
        }
        let signals = &self.context.signals;
        if signals.fault_raised() {
            warn!("Sequence stopped by upstream fault");
        } else if signals.abort_requested() {
            info!("Sequence aborted");
        } else {
            info!("Sequence complete");
        }
    }

    fn frame_limit_reached(&self) -> bool {
        let limit = self.config.frame_limit;
        limit > 0 && self.state.lock().unwrap().frame_count >= limit
    }

    fn set_reading(&self, reading: bool) {
        self.state.lock().unwrap().reading = reading;
    }

    fn mark_exposure_start(&self, start: Instant, new_frame: bool) {
        let mut state = self.state.lock().unwrap();
        state.exposure_start = Some(start);
        if new_frame {
            state.frame_count += 1;
        }
    }

    fn run_normal(&self) -> Result<(), CanonicalError> {
        let gateway = &self.context.gateway;
        let exposure_duration = self.config.exposure_duration()?;
        gateway.set_amplifier_switched(true)?;
        loop {
            if self.frame_limit_reached() || self.context.signals.should_stop() {
                return Ok(());
            }
            gateway.start_exposure(self.config.exposure_time)?;
            let start = Stamp::now();
            self.mark_exposure_start(start.instant, false);
            if !self.wait_for_image(start.instant + exposure_duration, false)? {
                // Aborted mid exposure; discard it.
                gateway.stop_exposure()?;
                return Ok(());
            }
            let ready = Stamp::now();
            let raw = gateway.fetch_image()?;
            let exposure_time = (ready.time - start.time).num_microseconds()
                .unwrap_or(0) as f64 / 1e6;
            let end_time = start.time +
                chrono::Duration::microseconds(exposure_duration.as_micros() as i64);
            self.emit_frame(raw, start.time, end_time, ready.time, exposure_time, false)?;
            self.state.lock().unwrap().frame_count += 1;
        }
    }

    fn run_overlapped(&self) -> Result<(), CanonicalError> {
        let gateway = &self.context.gateway;
        let trigger_exposure = self.timing.trigger_exposure;
        let exposure_duration = self.config.exposure_duration()?;
        gateway.set_amplifier_switched(false)?;

        // Priming trigger: flushes the sensor and starts the first frame.
        gateway.start_exposure(trigger_exposure)?;
        let mut frame_start = Stamp::now();
        self.mark_exposure_start(frame_start.instant, false);
        let result = self.overlapped_loop(&mut frame_start, exposure_duration);

        // Discard whatever is integrating or being read out.
        if let Err(e) = gateway.stop_exposure() {
            warn!("Could not stop exposure at end of sequence: {:?}", e);
        }
        result
    }

    fn overlapped_loop(&self, frame_start: &mut Stamp, exposure_duration: Duration)
                       -> Result<(), CanonicalError> {
        let gateway = &self.context.gateway;
        let trigger_duration = Duration::from_secs_f64(self.timing.trigger_exposure);
        if !self.wait_for_image(frame_start.instant + trigger_duration, true)? {
            return Ok(());
        }
        gateway.fetch_image()?;
        debug!("Discarded priming frame");

        loop {
            if self.frame_limit_reached() || self.context.signals.should_stop() {
                return Ok(());
            }
            let target = frame_start.instant + exposure_duration;
            if self.wait_until(target) {
                return Ok(());
            }
            gateway.start_exposure(self.timing.trigger_exposure)?;
            let trigger = Stamp::now();
            self.mark_exposure_start(trigger.instant, true);
            self.set_reading(true);
            let trigger_error = trigger.instant.saturating_duration_since(target);
            self.context.trigger_stats.lock().unwrap().add_trigger_error(
                trigger_error.as_secs_f64() * 1000.0);

            let completed_start = std::mem::replace(frame_start, trigger);
            // Read out the frame the trigger just ended. An abort here still
            // lets this readout finish and the frame be saved.
            if !self.wait_for_image(trigger.instant + trigger_duration, true)? {
                return Ok(());
            }
            let ready = Stamp::now();
            let raw = gateway.fetch_image()?;
            self.set_reading(false);
            let exposure_time = (trigger.time - completed_start.time)
                .num_microseconds().unwrap_or(0) as f64 / 1e6;
            self.emit_frame(raw, completed_start.time, trigger.time, ready.time,
                            exposure_time, true)?;
        }
    }

    // Polls for the image until it is ready. Returns false if the sequence
    // is stopping and `finish_on_stop` is false. `due` is when the image is
    // expected, used for the readout timeout.
    fn wait_for_image(&self, due: Instant, finish_on_stop: bool)
                      -> Result<bool, CanonicalError> {
        let signals = &self.context.signals;
        loop {
            let stopping = signals.wait(self.timing.poll_interval);
            if stopping {
                if !finish_on_stop {
                    return Ok(false);
                }
                // Signals stay raised, so wait() no longer sleeps.
                thread::sleep(self.timing.poll_interval);
            }
            if self.context.gateway.image_ready()? {
                return Ok(true);
            }
            if Instant::now() > due + self.timing.readout_timeout {
                return Err(deadline_exceeded_error("Timed out waiting for readout"));
            }
        }
    }

    // Sleeps until `target`, in stages of increasing precision. Returns true
    // if the sequence is stopping, in which case no trigger should be fired.
    fn wait_until(&self, target: Instant) -> bool {
        let signals = &self.context.signals;
        loop {
            let now = Instant::now();
            if now + self.timing.coarse_window >= target {
                break;
            }
            let remaining = target - now - self.timing.coarse_window;
            if signals.wait(remaining.min(self.timing.poll_interval)) {
                return true;
            }
        }
        if signals.should_stop() {
            return true;
        }
        while Instant::now() + self.timing.fine_window < target {
            thread::sleep(self.timing.fine_step);
        }
        while Instant::now() < target {
            thread::sleep(self.timing.finest_step);
        }
        signals.should_stop()
    }

    fn emit_frame(&self, raw: RawImage, start_time: DateTime<Utc>,
                  end_time: DateTime<Utc>, read_end_time: DateTime<Utc>,
                  exposure_time: f64, overlapped: bool)
                  -> Result<(), CanonicalError> {
        let (width, height) = (raw.width, raw.height);
        let image: Image16 = ImageBuffer::from_raw(width, height, raw.pixels)
            .ok_or_else(|| internal_error(
                &format!("Image buffer does not match {}x{}", width, height)))?;
        let (exposure_count, exposure_reference) = {
            let counter = self.context.counter.lock().unwrap();
            (counter.exposure_count + 1, counter.exposure_reference.clone())
        };
        let frame = Frame{
            image,
            start_time,
            end_time,
            read_end_time,
            exposure_time,
            target_exposure_time: self.config.exposure_time,
            overlapped,
            cooling: self.context.poller.cooling(),
            exposure_count,
            exposure_reference,
            sequence: self.sequence,
        };
        // Blocks while the dispatcher is still busy with the previous frame.
        self.context.frames.push(frame)?;

        let mut counter = self.context.counter.lock().unwrap();
        counter.exposure_count = exposure_count;
        if let Err(e) = counter.save(&self.context.counter_path) {
            error!("{}", e.message);
            self.context.signals.raise_fault(self.sequence, &e.message);
        }
        Ok(())
    }
}

// mod tests.
