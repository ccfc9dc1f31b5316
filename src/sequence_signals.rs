// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

/// Cancellation shared by the controller, the acquisition engine and the
/// frame dispatcher. A user abort and an upstream fault (frame save or
/// hand-off failure) both stop the running sequence; waiters are woken as
/// soon as either is raised.
///
/// Each sequence gets a number from `begin_sequence`. Frames carry the
/// number of the sequence that produced them, and a fault attributed to an
/// earlier sequence is recorded but does not stop the current one.
pub struct SequenceSignals {
    state: Mutex<SignalState>,
    raised: Condvar,
}

#[derive(Default)]
struct SignalState {
    sequence: u64,
    abort: bool,
    fault: bool,
    last_fault: Option<String>,
}

impl SignalState {
    fn stopping(&self) -> bool {
        self.abort || self.fault
    }
}

impl Default for SequenceSignals {
    fn default() -> Self {
        SequenceSignals::new()
    }
}

impl SequenceSignals {
    pub fn new() -> Self {
        SequenceSignals{state: Mutex::new(SignalState::default()),
                        raised: Condvar::new()}
    }

    /// Clears both signals and returns the new sequence's number.
    pub fn begin_sequence(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.sequence += 1;
        state.abort = false;
        state.fault = false;
        state.sequence
    }

    /// Returns false if an abort was already requested.
    pub fn request_abort(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.abort {
            return false;
        }
        state.abort = true;
        self.raised.notify_all();
        true
    }

    /// Records a failure while handling output of `sequence`. Stops that
    /// sequence if it is the current one.
    pub fn raise_fault(&self, sequence: u64, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.last_fault = Some(reason.to_string());
        if sequence != state.sequence {
            warn!("Fault from sequence {} does not stop sequence {}",
                  sequence, state.sequence);
            return;
        }
        state.fault = true;
        self.raised.notify_all();
    }

    /// Most recent fault since startup, from any sequence.
    pub fn last_fault(&self) -> Option<String> {
        self.state.lock().unwrap().last_fault.clone()
    }

    pub fn abort_requested(&self) -> bool {
        self.state.lock().unwrap().abort
    }

    pub fn fault_raised(&self) -> bool {
        self.state.lock().unwrap().fault
    }

    pub fn should_stop(&self) -> bool {
        self.state.lock().unwrap().stopping()
    }

    /// Waits up to `timeout` for either signal. Returns true if the sequence
    /// should stop.
    pub fn wait(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self.raised.wait_timeout_while(
            state, timeout, |s| !s.stopping()).unwrap();
        state.stopping()
    }
}

// mod tests.
