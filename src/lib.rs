//! Bridge between a GameCube controller adapter driver and application code.
//!
//! A driver reports plug, unplug and state events from its own thread. The
//! [`bridge::Bridge`] turns them into operations on a shared
//! [`controller::Registry`] that the application reads at its own cadence,
//! either directly or through a [`poller::PollerHandle`].
//!
//! ```text
//! Driver thread ──► Bridge ──► Registry ──► Application (snapshot / Poller)
//! ```

pub mod bridge;
pub mod config;
pub mod controller;
pub mod driver;
pub mod ffi;
pub mod poller;

pub use bridge::{Bridge, BridgeError, BridgeSettings, ControllerEvent, ControllerObserver};
pub use controller::{Buttons, ControllerIdentity, ControllerState, RawControllerState};
