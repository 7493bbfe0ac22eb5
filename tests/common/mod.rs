#![allow(dead_code)]

use gcadapter::bridge::{ContextHandle, Driver, DriverCallbacks, DriverError};
use gcadapter::controller::{ControllerIdentity, RawControllerState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Driver whose events are fired by the test itself.
#[derive(Default)]
pub struct ManualDriver {
    callbacks: Mutex<Option<Arc<dyn DriverCallbacks>>>,
    pulled: Mutex<HashMap<ControllerIdentity, RawControllerState>>,
    pub opened: AtomicUsize,
    pub deleted: AtomicUsize,
    pub fail_open: bool,
    pub fail_close: bool,
}

impl ManualDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Driver whose `open_context` always fails.
    pub fn failing_open() -> Arc<Self> {
        Arc::new(Self {
            fail_open: true,
            ..Default::default()
        })
    }

    /// Driver whose `close_context` reports an error after counting the call.
    pub fn failing_close() -> Arc<Self> {
        Arc::new(Self {
            fail_close: true,
            ..Default::default()
        })
    }

    /// Callbacks installed by the bridge. Panics if none are installed.
    pub fn callbacks(&self) -> Arc<dyn DriverCallbacks> {
        self.callbacks
            .lock()
            .unwrap()
            .clone()
            .expect("no callbacks installed")
    }

    pub fn has_callbacks(&self) -> bool {
        self.callbacks.lock().unwrap().is_some()
    }

    pub fn set_pulled(&self, id: ControllerIdentity, raw: RawControllerState) {
        self.pulled.lock().unwrap().insert(id, raw);
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }
}

impl Driver for ManualDriver {
    fn open_context(&self) -> Result<ContextHandle, DriverError> {
        if self.fail_open {
            return Err(DriverError::Unavailable("adapter missing".to_string()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(ContextHandle(n + 1))
    }

    fn close_context(&self, _context: ContextHandle) -> Result<(), DriverError> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(DriverError::CallFailed("context_delete failed".to_string()));
        }
        Ok(())
    }

    fn set_callbacks(
        &self,
        _context: ContextHandle,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<(), DriverError> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }

    fn clear_callbacks(&self, _context: ContextHandle) {
        self.callbacks.lock().unwrap().take();
    }

    fn latest_state(
        &self,
        _context: ContextHandle,
        id: ControllerIdentity,
    ) -> Option<RawControllerState> {
        self.pulled.lock().unwrap().get(&id).copied()
    }
}

/// Raw input whose every field is derived from `seed`.
pub fn raw_from_seed(seed: u8) -> RawControllerState {
    RawControllerState {
        buttons: seed as u16,
        stick_x: seed,
        stick_y: seed,
        c_stick_x: seed,
        c_stick_y: seed,
        trigger_l: seed,
        trigger_r: seed,
    }
}
