//! Controller data model and the shared registry
//!
//! 1. [`state`] - identities, button masks and normalized controller state
//! 2. [`registry`] - concurrent table of connected controllers
//!
//! # Architecture
//!
//! ```text
//! Driver thread ──► Registry ◄── Application thread
//!   (register/unregister/update)   (get/snapshot)
//! ```

pub mod registry;
pub mod state;

pub use registry::{Registry, RegistryError, RegistryReader};
pub use state::{
    clamp_deadzone, Buttons, ControllerIdentity, ControllerState, RawControllerState,
    MAX_STICK_DEADZONE, PORTS_PER_ADAPTER,
};
