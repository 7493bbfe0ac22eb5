//! Callback fence
//!
//! Every driver callback enters the gate before touching bridge state and
//! leaves it when its [`CallbackPermit`] drops. [`CallbackGate::fence`] shuts
//! the gate and blocks until the permits already handed out are gone, so
//! once it returns no callback is running and none will start.

use std::sync::{Condvar, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct GateState {
    fenced: bool,
    in_flight: usize,
}

#[derive(Debug, Default)]
pub struct CallbackGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl CallbackGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a callback, or returns `None` once the gate is fenced.
    pub fn enter(&self) -> Option<CallbackPermit<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fenced {
            return None;
        }
        state.in_flight += 1;
        Some(CallbackPermit { gate: self })
    }

    /// Shuts the gate and waits for in-flight callbacks to finish.
    ///
    /// Must not be called from inside a callback holding a permit.
    pub fn fence(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.fenced = true;
        if state.in_flight > 0 {
            debug!("Waiting for {} in-flight callbacks", state.in_flight);
        }
        while state.in_flight > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_fenced(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fenced
    }

    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
    }

    fn leave(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }
}

/// Proof that a callback is inside the gate. Leaves on drop, unwinding
/// included.
#[derive(Debug)]
pub struct CallbackPermit<'a> {
    gate: &'a CallbackGate,
}

impl Drop for CallbackPermit<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fenced_gate_rejects_new_callbacks() {
        let gate = CallbackGate::new();
        assert!(gate.enter().is_some());
        assert_eq!(gate.in_flight(), 0);

        gate.fence();
        assert!(gate.is_fenced());
        assert!(gate.enter().is_none());
    }

    #[test]
    fn fence_waits_for_in_flight_permit() {
        let gate = Arc::new(CallbackGate::new());
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let worker = {
            let gate = Arc::clone(&gate);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let _permit = gate.enter().unwrap();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            })
        };

        entered_rx.recv().unwrap();
        gate.fence();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(gate.in_flight(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn permit_is_released_on_panic() {
        let gate = Arc::new(CallbackGate::new());
        let result = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _permit = gate.enter().unwrap();
                panic!("callback failed");
            })
            .join()
        };

        assert!(result.is_err());
        assert_eq!(gate.in_flight(), 0);
        gate.fence();
    }
}
