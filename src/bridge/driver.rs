//! Driver boundary
//!
//! A driver owns the USB polling context and a thread of its own. It reports
//! three events through [`DriverCallbacks`] from that thread:
//!
//! ```text
//! on_plug(adapter, port) -> NativeHandle
//! on_unplug(NativeHandle)
//! on_state(NativeHandle, Option<RawControllerState>)
//! ```
//!
//! The handle returned by `on_plug` is threaded back by the driver through
//! later unplug and state events for the same controller. A state event
//! either carries the raw input inline or leaves it to the bridge to pull
//! through [`Driver::latest_state`].

use std::fmt;
use std::sync::Arc;

use crate::controller::{ControllerIdentity, RawControllerState};

/// Native polling context created by [`Driver::open_context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Opaque per-controller token handed to the driver at plug time.
///
/// Zero is never issued and stands for "no handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// Driver errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("Driver unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown driver context: {0}")]
    UnknownContext(ContextHandle),

    #[error("Driver call failed: {0}")]
    CallFailed(String),
}

/// Entry points a driver invokes from its own thread.
pub trait DriverCallbacks: Send + Sync {
    fn on_plug(&self, adapter: u8, port: u8) -> NativeHandle;
    fn on_unplug(&self, handle: NativeHandle);
    fn on_state(&self, handle: NativeHandle, raw: Option<RawControllerState>);
}

/// A native polling driver.
pub trait Driver: Send + Sync {
    /// Creates the polling context. Events start flowing once callbacks
    /// are installed with [`Driver::set_callbacks`].
    fn open_context(&self) -> Result<ContextHandle, DriverError>;

    /// Destroys the context. Only called once no callback is in flight.
    fn close_context(&self, context: ContextHandle) -> Result<(), DriverError>;

    fn set_callbacks(
        &self,
        context: ContextHandle,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<(), DriverError>;

    /// Drops the installed callbacks; no further events are delivered.
    fn clear_callbacks(&self, context: ContextHandle);

    /// Latest input the driver sampled for `id`, for pull-style delivery.
    fn latest_state(
        &self,
        context: ContextHandle,
        id: ControllerIdentity,
    ) -> Option<RawControllerState>;
}
