//! Native event bridge
//!
//! 1. [`driver`] - the driver boundary and its event contract
//! 2. [`handle_table`] - checked native handles, one per connected controller
//! 3. [`gate`] - callback fence used during teardown
//! 4. [`observer`] - application hooks for connect, disconnect and update
//! 5. [`bridge_handle`] - the bridge itself: open, close and event translation
//!
//! # Architecture
//!
//! ```text
//! Driver thread ──► BridgeCallbacks ──► Registry ──► snapshot() / Poller
//!                        │
//!                        └──► ControllerObserver
//! ```

pub mod bridge_handle;
pub mod driver;
pub mod gate;
pub mod handle_table;
pub mod observer;

pub use bridge_handle::{Bridge, BridgeError, BridgeSettings};
pub use driver::{ContextHandle, Driver, DriverCallbacks, DriverError, NativeHandle};
pub use observer::{ChannelObserver, ControllerEvent, ControllerObserver, NoopObserver};
