//! Driver implementations
//!
//! [`sim`] drives the bridge from virtual adapters on a 100 Hz thread, for
//! demos and tests. Native driver libraries plug in through [`crate::ffi`].

pub mod sim;

pub use sim::{SimulatedDriver, SimulationSettings, StateDelivery};
