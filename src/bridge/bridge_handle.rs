//! Bridge Handle - owns a driver context and feeds the registry
//!
//! The bridge translates driver events into registry operations:
//!
//! ```text
//! Driver thread                    Bridge                        Registry
//! on_plug(adapter, port)   ──►  identity + handle   ──►  register(id)
//! on_unplug(handle)        ──►  release handle      ──►  unregister(id)
//! on_state(handle, raw)    ──►  resolve + normalize ──►  update(id, state)
//! ```
//!
//! # Failure boundary
//!
//! Callbacks run on a thread this crate does not own. Nothing raised inside
//! a callback is allowed back into the driver: benign races (stale handle,
//! update after unplug) are logged and dropped, and panics are caught at the
//! callback boundary.
//!
//! # Teardown
//!
//! [`Bridge::close`] fences the callback gate before touching the driver, so
//! once it returns no callback is running and later ones are no-ops. The
//! context is destroyed exactly once; a second `close` only waits for the
//! fence. Dropping the bridge closes it.

use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

use super::driver::{ContextHandle, Driver, DriverCallbacks, DriverError, NativeHandle};
use super::gate::CallbackGate;
use super::handle_table::HandleTable;
use super::observer::{ControllerObserver, NoopObserver};
use crate::controller::{
    clamp_deadzone, ControllerIdentity, ControllerState, RawControllerState, Registry,
    RegistryError, RegistryReader,
};

/// Translation settings applied to every state event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Per-axis stick deadzone as a fraction of full travel, clamped to
    /// `[0, 0.99]` when the bridge opens
    pub stick_deadzone: f32,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            stick_deadzone: 0.0,
        }
    }
}

/// Errors surfaced by [`Bridge::open`] and [`Bridge::close`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The driver context could not be created or destroyed
    #[error("Driver unavailable: {0}")]
    DriverUnavailable(#[from] DriverError),
}

// State shared between the bridge and the callbacks installed in the driver
struct BridgeShared {
    driver: Arc<dyn Driver>,
    context: ContextHandle,
    registry: Arc<Registry>,
    handles: Mutex<HandleTable>,
    gate: CallbackGate,
    observer: Arc<dyn ControllerObserver>,
    settings: BridgeSettings,
}

impl BridgeShared {
    fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plug(&self, adapter: u8, port: u8) -> NativeHandle {
        let id = ControllerIdentity::new(adapter, port);

        let handle = {
            let mut handles = self.handles();
            match self.registry.register(id) {
                Ok(()) => {}
                Err(RegistryError::Duplicate(_)) => {
                    warn!("Duplicate plug for controller {}, resetting its state", id);
                    if let Err(e) = self.registry.update(id, ControllerState::default()) {
                        warn!("Failed to reset controller {}: {}", id, e);
                    }
                }
                Err(e) => {
                    warn!("Failed to register controller {}: {}", id, e);
                    return NativeHandle::NULL;
                }
            }
            handles.insert(id)
        };

        info!(
            "Controller {} plugged in (virtual id {}, handle {})",
            id,
            id.virtual_id(),
            handle
        );
        self.observer.on_connect(id);
        handle
    }

    fn unplug(&self, handle: NativeHandle) {
        let id = {
            let mut handles = self.handles();
            match handles.release(handle) {
                Some(id) => {
                    self.registry.unregister(id);
                    id
                }
                None => {
                    debug!("Ignoring unplug for released handle {}", handle);
                    return;
                }
            }
        };

        info!("Controller {} unplugged", id);
        self.observer.on_disconnect(id);
    }

    fn state(&self, handle: NativeHandle, raw: Option<RawControllerState>) {
        let Some(id) = self.handles().resolve(handle) else {
            debug!("Ignoring state for released handle {}", handle);
            return;
        };

        let raw = match raw {
            Some(raw) => raw,
            None => match self.driver.latest_state(self.context, id) {
                Some(raw) => raw,
                None => {
                    debug!("No state available yet for controller {}", id);
                    return;
                }
            },
        };

        self.apply(id, raw);
    }

    fn apply(&self, id: ControllerIdentity, raw: RawControllerState) -> bool {
        let state = raw.normalize(self.settings.stick_deadzone);
        match self.registry.update(id, state) {
            Ok(()) => {
                self.observer.on_update(id, state);
                true
            }
            Err(RegistryError::NotFound(_)) => {
                debug!("Dropping late state update for unplugged controller {}", id);
                false
            }
            Err(e) => {
                warn!("Failed to update controller {}: {}", id, e);
                false
            }
        }
    }
}

// Entry points installed into the driver
struct BridgeCallbacks {
    shared: Weak<BridgeShared>,
}

impl BridgeCallbacks {
    // Runs a callback body inside the gate, containing any panic
    fn guarded<R>(&self, name: &str, fallback: R, body: impl FnOnce(&BridgeShared) -> R) -> R {
        let Some(shared) = self.shared.upgrade() else {
            debug!("Bridge gone, ignoring {} callback", name);
            return fallback;
        };
        let Some(_permit) = shared.gate.enter() else {
            debug!("Bridge closing, ignoring {} callback", name);
            return fallback;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| body(&*shared))) {
            Ok(result) => result,
            Err(_) => {
                error!("Panic in {} callback contained at driver boundary", name);
                fallback
            }
        }
    }
}

impl DriverCallbacks for BridgeCallbacks {
    fn on_plug(&self, adapter: u8, port: u8) -> NativeHandle {
        self.guarded("plug", NativeHandle::NULL, |shared| {
            shared.plug(adapter, port)
        })
    }

    fn on_unplug(&self, handle: NativeHandle) {
        self.guarded("unplug", (), |shared| shared.unplug(handle))
    }

    fn on_state(&self, handle: NativeHandle, raw: Option<RawControllerState>) {
        self.guarded("state", (), |shared| shared.state(handle, raw))
    }
}

/// Owns one driver context and the registry it feeds.
pub struct Bridge {
    shared: Arc<BridgeShared>,
    closed: AtomicBool,
}

impl Bridge {
    /// Creates the driver context and starts receiving events.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DriverUnavailable`] if the context cannot be created or
    /// the callbacks cannot be installed.
    pub fn open(
        driver: Arc<dyn Driver>,
        mut settings: BridgeSettings,
        observer: Arc<dyn ControllerObserver>,
    ) -> Result<Self, BridgeError> {
        info!("Opening controller bridge with settings: {:?}", settings);

        let deadzone = clamp_deadzone(settings.stick_deadzone);
        if deadzone != settings.stick_deadzone {
            warn!(
                "Stick deadzone {} out of range, using {}",
                settings.stick_deadzone, deadzone
            );
            settings.stick_deadzone = deadzone;
        }

        let context = driver.open_context().map_err(|e| {
            error!("Failed to create driver context: {}", e);
            BridgeError::DriverUnavailable(e)
        })?;
        debug!("Created driver context {}", context);

        let shared = Arc::new(BridgeShared {
            driver: Arc::clone(&driver),
            context,
            registry: Arc::new(Registry::new()),
            handles: Mutex::new(HandleTable::new()),
            gate: CallbackGate::new(),
            observer,
            settings,
        });

        let callbacks = Arc::new(BridgeCallbacks {
            shared: Arc::downgrade(&shared),
        });
        if let Err(e) = driver.set_callbacks(context, callbacks) {
            error!("Failed to install driver callbacks: {}", e);
            if let Err(close_err) = driver.close_context(context) {
                warn!("Failed to destroy context {}: {}", context, close_err);
            }
            return Err(BridgeError::DriverUnavailable(e));
        }

        info!("Controller bridge open on {}", context);
        Ok(Self {
            shared,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a bridge with default settings and no observer.
    pub fn open_default(driver: Arc<dyn Driver>) -> Result<Self, BridgeError> {
        Self::open(driver, BridgeSettings::default(), Arc::new(NoopObserver))
    }

    /// Stops event delivery and destroys the driver context.
    ///
    /// Returns only after every in-flight callback has finished. Calling it
    /// again does nothing beyond that wait. Must not be called from an
    /// observer.
    pub fn close(&self) -> Result<(), BridgeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Bridge on {} already closed", self.shared.context);
            self.shared.gate.fence();
            return Ok(());
        }

        let context = self.shared.context;
        info!("Closing controller bridge on {}", context);

        self.shared.gate.fence();
        debug!("Callback gate fenced");

        self.shared.driver.clear_callbacks(context);
        let result = self.shared.driver.close_context(context);

        let released = self.shared.handles().drain();
        let dropped = self.shared.registry.clear();
        debug!(
            "Released {} handles, dropped {} controllers",
            released.len(),
            dropped.len()
        );

        match result {
            Ok(()) => {
                info!("Controller bridge closed");
                Ok(())
            }
            Err(e) => {
                error!("Failed to destroy driver context {}: {}", context, e);
                Err(BridgeError::DriverUnavailable(e))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn context(&self) -> ContextHandle {
        self.shared.context
    }

    pub fn snapshot(&self) -> Vec<(ControllerIdentity, ControllerState)> {
        self.shared.registry.snapshot()
    }

    pub fn get(&self, id: ControllerIdentity) -> Option<ControllerState> {
        self.shared.registry.get(id)
    }

    /// Read-only registry view that can be moved to another thread.
    pub fn registry(&self) -> RegistryReader {
        RegistryReader::new(Arc::clone(&self.shared.registry))
    }

    /// Pulls the latest state of every connected controller from the driver.
    ///
    /// For drivers that do not push state with their events. Returns the
    /// number of controllers refreshed.
    pub fn refresh(&self) -> usize {
        // Shares the gate with callbacks so close() also waits for a refresh
        let Some(_permit) = self.shared.gate.enter() else {
            return 0;
        };

        let mut refreshed = 0;
        for id in self.shared.registry.identities() {
            match self.shared.driver.latest_state(self.shared.context, id) {
                Some(raw) => {
                    if self.shared.apply(id, raw) {
                        refreshed += 1;
                    }
                }
                None => debug!("Driver has no state for controller {}", id),
            }
        }
        refreshed
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing bridge on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("context", &self.shared.context)
            .field("open", &self.is_open())
            .field("controllers", &self.shared.registry.len())
            .finish()
    }
}
