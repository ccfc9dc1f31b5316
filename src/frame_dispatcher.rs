// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::io::BufWriter;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, data_loss_error, failed_precondition_error};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info};

use crate::fits_writer::{CardValue, HeaderCard, write_fits};
use crate::frame::Frame;
use crate::sequence_signals::SequenceSignals;

/// Hands saved frames to the downstream processing pipeline.
pub trait FrameNotifier: Send {
    fn notify_frame(&mut self, camera_id: &str, filename: &str, timeout: Duration)
                    -> Result<(), CanonicalError>;
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub camera_id: String,
    pub output_path: PathBuf,
    pub handover_timeout: Duration,
    pub software_version: String,
}

/// Sending side of the dispatch channel. The channel holds one frame; a
/// second push blocks until the worker takes the first.
#[derive(Clone)]
pub struct FrameQueue {
    sender: SyncSender<Frame>,
}

impl FrameQueue {
    pub fn push(&self, frame: Frame) -> Result<(), CanonicalError> {
        self.sender.send(frame).map_err(|_| {
            failed_precondition_error("Frame dispatcher is not running")
        })
    }
}

/// Saves frames and notifies the pipeline, on a worker thread that lives as
/// long as the dispatcher.
pub struct FrameDispatcher {
    sender: Option<SyncSender<Frame>>,
    worker_thread: Option<thread::JoinHandle<()>>,
}

impl Drop for FrameDispatcher {
    fn drop(&mut self) {
        // Closing our end of the channel ends the worker once every queue
        // handed out has also been dropped.
        self.sender = None;
        if let Some(worker) = self.worker_thread.take() {
            let _ = worker.join();
        }
    }
}

impl FrameDispatcher {
    pub fn new(settings: DispatcherSettings, notifier: Box<dyn FrameNotifier>,
               signals: Arc<SequenceSignals>) -> Self {
        let (sender, receiver) = sync_channel::<Frame>(1);
        let worker_thread = thread::spawn(move || {
            FrameDispatcher::worker(settings, notifier, signals, receiver);
        });
        FrameDispatcher{sender: Some(sender), worker_thread: Some(worker_thread)}
    }

    /// Fails if the worker thread has exited.
    pub fn queue(&self) -> Result<FrameQueue, CanonicalError> {
        let running = self.worker_thread.as_ref().map_or(false, |w| !w.is_finished());
        match &self.sender {
            Some(sender) if running => Ok(FrameQueue{sender: sender.clone()}),
            _ => Err(failed_precondition_error("Frame dispatcher is stopped")),
        }
    }

    fn worker(settings: DispatcherSettings, mut notifier: Box<dyn FrameNotifier>,
              signals: Arc<SequenceSignals>, receiver: Receiver<Frame>) {
        debug!("Starting frame dispatcher");
        for frame in receiver {
            let save_start = Instant::now();
            let path = match save_frame(&settings, &frame) {
                Ok(path) => path,
                Err(e) => {
                    let reason = format!("Frame {} not saved: {}",
                                         frame.exposure_count, e.message);
                    error!("{}", reason);
                    signals.raise_fault(frame.sequence, &reason);
                    continue;
                },
            };
            let filename = path.to_string_lossy().to_string();
            info!("Saved {} in {:?}", filename, save_start.elapsed());
            if let Err(e) = notifier.notify_frame(&settings.camera_id, &filename,
                                                  settings.handover_timeout) {
                let reason = format!("Pipeline hand-off failed for {}: {}",
                                     filename, e.message);
                error!("{}", reason);
                signals.raise_fault(frame.sequence, &reason);
            }
        }
        debug!("Stopping frame dispatcher");
    }
}

pub fn frame_filename(camera_id: &str, exposure_count: i64) -> String {
    format!("{}-{:08}.fits", camera_id, exposure_count)
}

fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn frame_header(frame: &Frame, camera_id: &str, software_version: &str)
                    -> Vec<HeaderCard> {
    let (width, height) = frame.image.dimensions();
    let cooling = frame.cooling.as_ref();
    let real_or_undefined = |value: Option<f64>| match value {
        Some(v) => CardValue::Real(v),
        None => CardValue::Undefined,
    };
    vec![
        HeaderCard::new("SWVERSN", CardValue::Text(software_version.to_string()),
                        "software version"),
        HeaderCard::new("CAMID", CardValue::Text(camera_id.to_string()), "camera id"),
        HeaderCard::new("DATE-OBS", CardValue::Text(timestamp(&frame.start_time)),
                        "exposure start time"),
        HeaderCard::new("EXPEND", CardValue::Text(timestamp(&frame.end_time)),
                        "exposure end time"),
        HeaderCard::new("READEND", CardValue::Text(timestamp(&frame.read_end_time)),
                        "readout completion time"),
        HeaderCard::new("EXPTIME", CardValue::Real(frame.exposure_time),
                        "[s] actual exposure length"),
        HeaderCard::new("EXPRQ", CardValue::Real(frame.target_exposure_time),
                        "[s] requested exposure length"),
        HeaderCard::new("OVERLAP", CardValue::Logical(frame.overlapped),
                        "readout overlapped next exposure"),
        HeaderCard::new("CCD-TEMP", real_or_undefined(cooling.map(|c| c.temperature)),
                        "[deg C] sensor temperature"),
        HeaderCard::new("TEMP-SET",
                        real_or_undefined(cooling.and_then(|c| c.target_temperature)),
                        "[deg C] cooler setpoint"),
        HeaderCard::new("TEMP-LCK", CardValue::Logical(cooling.map_or(false, |c| c.locked)),
                        "sensor temperature locked to setpoint"),
        HeaderCard::new("COOL-ON",
                        CardValue::Logical(cooling.map_or(false, |c| c.cooler_enabled)),
                        "cooler enabled"),
        HeaderCard::new("COOL-PWR", real_or_undefined(cooling.map(|c| c.cooler_power)),
                        "[%] cooler power"),
        HeaderCard::new("EXPCNT", CardValue::Integer(frame.exposure_count),
                        "exposure counter"),
        HeaderCard::new("EXPREF", CardValue::Text(frame.exposure_reference.clone()),
                        "date the exposure counter was reset"),
        HeaderCard::new("IMAG-RGN",
                        CardValue::Text(format!("[1:{}, 1:{}]", width, height)),
                        "image region"),
    ]
}

/// Writes the frame to `<output_path>/<camera_id>-<count>.fits` by way of a
/// temporary file, so a partially written frame is never visible under its
/// final name. Returns the final path.
pub fn save_frame(settings: &DispatcherSettings, frame: &Frame)
                  -> Result<PathBuf, CanonicalError> {
    let path = settings.output_path.join(
        frame_filename(&settings.camera_id, frame.exposure_count));
    let cards = frame_header(frame, &settings.camera_id, &settings.software_version);
    write_atomically(&path, |writer| write_fits(writer, &frame.image, &cards))
        .map_err(|e| data_loss_error(&format!("Could not write {:?}: {}", path, e)))?;
    Ok(path)
}

fn write_atomically<F>(path: &Path, write: F) -> std::io::Result<()>
where F: FnOnce(&mut BufWriter<fs::File>) -> std::io::Result<()>
{
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    let result = (|| {
        let mut writer = BufWriter::new(fs::File::create(&tmp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use image::{ImageBuffer, Luma};
    use crate::status_poller::CoolingState;
    use super::*;

    struct RecordingNotifier {
        notified: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    impl FrameNotifier for RecordingNotifier {
        fn notify_frame(&mut self, camera_id: &str, filename: &str, _timeout: Duration)
                        -> Result<(), CanonicalError> {
            self.notified.lock().unwrap().push((camera_id.to_string(),
                                                filename.to_string()));
            if self.fail {
                return Err(canonical_error::deadline_exceeded_error("too slow"));
            }
            Ok(())
        }
    }

    fn test_frame(exposure_count: i64) -> Frame {
        let now = Utc::now();
        Frame{
            image: ImageBuffer::from_pixel(4, 3, Luma([1000_u16])),
            start_time: now,
            end_time: now,
            read_end_time: now,
            exposure_time: 1.0,
            target_exposure_time: 1.0,
            overlapped: false,
            cooling: Some(CoolingState{temperature: -10.1, target_temperature: Some(-10.0),
                                       locked: true, cooler_enabled: true,
                                       cooler_power: 40.0}),
            exposure_count,
            exposure_reference: "2024-03-01".to_string(),
            sequence: 1,
        }
    }

    fn settings(output_path: &Path) -> DispatcherSettings {
        DispatcherSettings{camera_id: "cam1".to_string(),
                           output_path: output_path.to_path_buf(),
                           handover_timeout: Duration::from_secs(1),
                           software_version: "1.2.3".to_string()}
    }

    #[test]
    fn test_frame_header() {
        let frame = test_frame(42);
        let cards = frame_header(&frame, "cam1", "1.2.3");
        let card = |keyword: &str| cards.iter().find(|c| c.keyword == keyword)
            .unwrap().value.clone();
        assert_eq!(card("SWVERSN"), CardValue::Text("1.2.3".to_string()));
        assert_eq!(card("EXPCNT"), CardValue::Integer(42));
        assert_eq!(card("TEMP-SET"), CardValue::Real(-10.0));
        assert_eq!(card("TEMP-LCK"), CardValue::Logical(true));
        assert_eq!(card("IMAG-RGN"), CardValue::Text("[1:4, 1:3]".to_string()));

        let mut frame = test_frame(43);
        frame.cooling = None;
        let cards = frame_header(&frame, "cam1", "1.2.3");
        let ccd_temp = cards.iter().find(|c| c.keyword == "CCD-TEMP").unwrap();
        assert_eq!(ccd_temp.value, CardValue::Undefined);
    }

    #[test]
    fn test_dispatch_saves_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let signals = Arc::new(SequenceSignals::new());
        let dispatcher = FrameDispatcher::new(
            settings(dir.path()),
            Box::new(RecordingNotifier{notified: notified.clone(), fail: false}),
            signals.clone());
        let queue = dispatcher.queue().unwrap();
        queue.push(test_frame(1)).unwrap();
        queue.push(test_frame(2)).unwrap();
        drop(queue);
        drop(dispatcher);  // Joins the worker.

        let expected = dir.path().join("cam1-00000001.fits");
        assert!(expected.exists());
        assert!(dir.path().join("cam1-00000002.fits").exists());
        assert!(!dir.path().join("cam1-00000001.fits.tmp").exists());
        let notified = notified.lock().unwrap();
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[0], ("cam1".to_string(),
                                 expected.to_string_lossy().to_string()));
        assert!(!signals.should_stop());
    }

    #[test]
    fn test_failures_raise_fault() {
        let dir = tempfile::tempdir().unwrap();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let signals = Arc::new(SequenceSignals::new());
        signals.begin_sequence();
        let dispatcher = FrameDispatcher::new(
            settings(dir.path()),
            Box::new(RecordingNotifier{notified: notified.clone(), fail: true}),
            signals.clone());
        let queue = dispatcher.queue().unwrap();
        queue.push(test_frame(1)).unwrap();
        queue.push(test_frame(2)).unwrap();
        drop(queue);
        drop(dispatcher);
        assert!(signals.fault_raised());
        assert!(signals.last_fault().unwrap().contains("cam1-00000002.fits"));
        // Both frames were processed despite the first failure.
        assert_eq!(notified.lock().unwrap().len(), 2);

        // Unwritable output path.
        let signals = Arc::new(SequenceSignals::new());
        signals.begin_sequence();
        let dispatcher = FrameDispatcher::new(
            settings(&dir.path().join("missing")),
            Box::new(RecordingNotifier{notified: notified.clone(), fail: false}),
            signals.clone());
        dispatcher.queue().unwrap().push(test_frame(3)).unwrap();
        drop(dispatcher);
        assert!(signals.fault_raised());
        assert!(signals.last_fault().unwrap().starts_with("Frame 3 not saved"));
        assert_eq!(notified.lock().unwrap().len(), 2);
    }

    struct PanickingNotifier;

    impl FrameNotifier for PanickingNotifier {
        fn notify_frame(&mut self, _camera_id: &str, _filename: &str, _timeout: Duration)
                        -> Result<(), CanonicalError> {
            panic!("notifier failed");
        }
    }

    #[test]
    fn test_queue_fails_after_worker_exit() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = FrameDispatcher::new(
            settings(dir.path()), Box::new(PanickingNotifier),
            Arc::new(SequenceSignals::new()));
        dispatcher.queue().unwrap().push(test_frame(1)).unwrap();
        let start = Instant::now();
        while dispatcher.queue().is_ok() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        let err = dispatcher.queue().err().unwrap();
        assert!(matches!(err.code, canonical_error::CanonicalErrorCode::FailedPrecondition));
    }

}  // mod tests.
