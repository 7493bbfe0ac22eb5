//! Simulated adapter driver
//!
//! Stands in for the native USB driver: each context owns a driver thread
//! that samples a scene of virtual adapters at a fixed rate (100 Hz by
//! default) and reports the differences through the installed callbacks.
//!
//! ```text
//! attach_adapter / plug / set_input ──► Scene ──► driver thread (tick)
//!                                                   ├─ on_unplug for ports that went empty
//!                                                   ├─ on_plug for ports that filled
//!                                                   └─ on_state for every plugged port
//! ```
//!
//! Callbacks are invoked without any scene or context lock held.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bridge::{ContextHandle, Driver, DriverCallbacks, DriverError, NativeHandle};
use crate::controller::{ControllerIdentity, RawControllerState, PORTS_PER_ADAPTER};

/// How state events carry controller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateDelivery {
    /// Input travels with each state event
    #[default]
    Inline,
    /// State events carry nothing; the bridge pulls via `latest_state`
    Pull,
}

// Simulation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub tick_hz: u32,
    pub state_delivery: StateDelivery,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_hz: 100, // USB polling rate of the adapter
            state_delivery: StateDelivery::Inline,
        }
    }
}

type Ports = [Option<RawControllerState>; PORTS_PER_ADAPTER as usize];

// Virtual adapters by USB address; a filled port is a plugged controller
#[derive(Debug, Default)]
struct Scene {
    adapters: BTreeMap<u8, Ports>,
}

impl Scene {
    fn sample(&self) -> Vec<(ControllerIdentity, RawControllerState)> {
        self.adapters
            .iter()
            .flat_map(|(address, ports)| {
                ports.iter().enumerate().filter_map(move |(port, input)| {
                    input.map(|raw| (ControllerIdentity::new(*address, port as u8), raw))
                })
            })
            .collect()
    }
}

// Callbacks slot with a generation that changes on every install or clear
#[derive(Default)]
struct CallbackSlot {
    generation: u64,
    callbacks: Option<Arc<dyn DriverCallbacks>>,
}

struct SimContext {
    callbacks: Arc<Mutex<CallbackSlot>>,
    latest: Arc<Mutex<HashMap<ControllerIdentity, RawControllerState>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct SimShared {
    settings: SimulationSettings,
    scene: Mutex<Scene>,
    contexts: Mutex<HashMap<ContextHandle, SimContext>>,
    next_context: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_open: AtomicBool,
    ticks: AtomicU64,
}

/// Driver over virtual adapters, driven by a background thread per context.
#[derive(Clone)]
pub struct SimulatedDriver {
    shared: Arc<SimShared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedDriver {
    pub fn new(settings: SimulationSettings) -> Self {
        info!("Creating simulated driver with settings: {:?}", settings);
        Self {
            shared: Arc::new(SimShared {
                settings,
                scene: Mutex::new(Scene::default()),
                contexts: Mutex::new(HashMap::new()),
                next_context: AtomicU64::new(1),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                fail_open: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
            }),
        }
    }

    /// Makes later `open_context` calls fail, as when no USB stack is present.
    pub fn fail_open(&self, fail: bool) {
        self.shared.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn attach_adapter(&self, address: u8) {
        let mut scene = lock(&self.shared.scene);
        if scene.adapters.contains_key(&address) {
            warn!("Adapter {} already attached", address);
            return;
        }
        scene.adapters.insert(address, Ports::default());
        info!("Attached virtual adapter {}", address);
    }

    /// Removes an adapter; its controllers are reported unplugged on the
    /// next tick.
    pub fn detach_adapter(&self, address: u8) -> bool {
        let removed = lock(&self.shared.scene).adapters.remove(&address).is_some();
        if removed {
            info!("Detached virtual adapter {}", address);
        }
        removed
    }

    /// Plugs a controller at rest into `port`. Returns false if the adapter
    /// is not attached or the port does not exist.
    pub fn plug(&self, address: u8, port: u8) -> bool {
        self.with_port(address, port, |slot| {
            if slot.is_none() {
                *slot = Some(RawControllerState::neutral());
            }
        })
    }

    pub fn unplug(&self, address: u8, port: u8) -> bool {
        self.with_port(address, port, |slot| {
            slot.take();
        })
    }

    /// Sets the input of a plugged controller. Returns false if the port is
    /// empty.
    pub fn set_input(&self, address: u8, port: u8, raw: RawControllerState) -> bool {
        let mut plugged = false;
        let found = self.with_port(address, port, |slot| {
            if let Some(input) = slot.as_mut() {
                *input = raw;
                plugged = true;
            }
        });
        found && plugged
    }

    pub fn contexts_opened(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }

    /// Blocks until the driver threads have completed `count` more ticks.
    /// Returns false on timeout.
    pub fn wait_ticks(&self, count: u64, timeout: Duration) -> bool {
        let target = self.ticks() + count;
        let deadline = Instant::now() + timeout;
        while self.ticks() < target {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    fn with_port(&self, address: u8, port: u8, f: impl FnOnce(&mut Option<RawControllerState>)) -> bool {
        if port >= PORTS_PER_ADAPTER {
            warn!("Port {} out of range", port);
            return false;
        }
        let mut scene = lock(&self.shared.scene);
        match scene.adapters.get_mut(&address) {
            Some(ports) => {
                f(&mut ports[port as usize]);
                true
            }
            None => {
                warn!("Adapter {} is not attached", address);
                false
            }
        }
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulationSettings::default())
    }
}

impl Driver for SimulatedDriver {
    fn open_context(&self) -> Result<ContextHandle, DriverError> {
        if self.shared.fail_open.load(Ordering::SeqCst) {
            return Err(DriverError::Unavailable(
                "simulated USB subsystem unavailable".to_string(),
            ));
        }

        let handle = ContextHandle(self.shared.next_context.fetch_add(1, Ordering::SeqCst));
        let callbacks = Arc::new(Mutex::new(CallbackSlot::default()));
        let latest = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = DriverThread {
            shared: Arc::downgrade(&self.shared),
            callbacks: Arc::clone(&callbacks),
            latest: Arc::clone(&latest),
            stop: Arc::clone(&stop),
        };
        let thread = thread::Builder::new()
            .name(format!("gcadapter-sim-{}", handle.0))
            .spawn(move || worker.run())
            .map_err(|e| DriverError::Unavailable(format!("failed to spawn driver thread: {}", e)))?;

        lock(&self.shared.contexts).insert(
            handle,
            SimContext {
                callbacks,
                latest,
                stop,
                thread: Some(thread),
            },
        );
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        info!("Simulated driver context {} opened", handle);
        Ok(handle)
    }

    fn close_context(&self, context: ContextHandle) -> Result<(), DriverError> {
        let mut entry = lock(&self.shared.contexts)
            .remove(&context)
            .ok_or(DriverError::UnknownContext(context))?;

        entry.stop.store(true, Ordering::SeqCst);
        lock(&entry.callbacks).callbacks = None;

        if let Some(thread) = entry.thread.take() {
            if thread.thread().id() == thread::current().id() {
                warn!("Context {} closed from its own driver thread", context);
            } else if thread.join().is_err() {
                error!("Driver thread for {} panicked", context);
            }
        }

        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        info!("Simulated driver context {} closed", context);
        Ok(())
    }

    fn set_callbacks(
        &self,
        context: ContextHandle,
        callbacks: Arc<dyn DriverCallbacks>,
    ) -> Result<(), DriverError> {
        let contexts = lock(&self.shared.contexts);
        let entry = contexts
            .get(&context)
            .ok_or(DriverError::UnknownContext(context))?;

        let mut slot = lock(&entry.callbacks);
        slot.generation += 1;
        slot.callbacks = Some(callbacks);
        debug!("Callbacks installed on {}", context);
        Ok(())
    }

    fn clear_callbacks(&self, context: ContextHandle) {
        if let Some(entry) = lock(&self.shared.contexts).get(&context) {
            let mut slot = lock(&entry.callbacks);
            slot.generation += 1;
            slot.callbacks = None;
            debug!("Callbacks cleared on {}", context);
        }
    }

    fn latest_state(
        &self,
        context: ContextHandle,
        id: ControllerIdentity,
    ) -> Option<RawControllerState> {
        let contexts = lock(&self.shared.contexts);
        let entry = contexts.get(&context)?;
        let latest = lock(&entry.latest);
        latest.get(&id).copied()
    }
}

// Body of one context's driver thread
struct DriverThread {
    shared: Weak<SimShared>,
    callbacks: Arc<Mutex<CallbackSlot>>,
    latest: Arc<Mutex<HashMap<ControllerIdentity, RawControllerState>>>,
    stop: Arc<AtomicBool>,
}

impl DriverThread {
    fn run(self) {
        let Some(settings) = self.shared.upgrade().map(|shared| shared.settings.clone()) else {
            return;
        };
        let period = Duration::from_secs_f64(1.0 / settings.tick_hz.max(1) as f64);
        info!("Driver thread started ({:?} per tick)", period);

        // Controllers reported to the current callbacks, with their handles
        let mut plugged: HashMap<ControllerIdentity, NativeHandle> = HashMap::new();
        let mut seen_generation = 0;

        while !self.stop.load(Ordering::SeqCst) {
            let tick_start = Instant::now();

            // The driver itself is gone
            let Some(shared) = self.shared.upgrade() else {
                break;
            };

            let sampled = lock(&shared.scene).sample();
            *lock(&self.latest) = sampled.iter().copied().collect();

            let (generation, callbacks) = {
                let slot = lock(&self.callbacks);
                (slot.generation, slot.callbacks.clone())
            };
            if generation != seen_generation {
                // Handles belong to the callbacks that issued them
                plugged.clear();
                seen_generation = generation;
            }

            if let Some(callbacks) = callbacks {
                self.report(callbacks.as_ref(), &sampled, &mut plugged, settings.state_delivery);
            }

            shared.ticks.fetch_add(1, Ordering::SeqCst);
            drop(shared);

            if let Some(remaining) = period.checked_sub(tick_start.elapsed()) {
                thread::sleep(remaining);
            }
        }

        info!("Driver thread stopped");
    }

    fn report(
        &self,
        callbacks: &dyn DriverCallbacks,
        sampled: &[(ControllerIdentity, RawControllerState)],
        plugged: &mut HashMap<ControllerIdentity, NativeHandle>,
        delivery: StateDelivery,
    ) {
        let gone: Vec<ControllerIdentity> = plugged
            .keys()
            .filter(|id| !sampled.iter().any(|(sampled_id, _)| sampled_id == *id))
            .copied()
            .collect();
        for id in gone {
            if let Some(handle) = plugged.remove(&id) {
                debug!("Reporting unplug of {}", id);
                callbacks.on_unplug(handle);
            }
        }

        for (id, raw) in sampled {
            let handle = match plugged.get(id) {
                Some(handle) => *handle,
                None => {
                    debug!("Reporting plug of {}", id);
                    let handle = callbacks.on_plug(id.adapter, id.port);
                    if handle.is_null() {
                        warn!("Plug of {} rejected, retrying next tick", id);
                        continue;
                    }
                    plugged.insert(*id, handle);
                    handle
                }
            };

            match delivery {
                StateDelivery::Inline => callbacks.on_state(handle, Some(*raw)),
                StateDelivery::Pull => callbacks.on_state(handle, None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_samples_plugged_ports_in_order() {
        let driver = SimulatedDriver::default();
        driver.attach_adapter(2);
        driver.attach_adapter(1);
        assert!(driver.plug(2, 0));
        assert!(driver.plug(1, 3));
        assert!(!driver.plug(3, 0));
        assert!(!driver.plug(1, 4));

        let sampled = lock(&driver.shared.scene).sample();
        let ids: Vec<_> = sampled.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            ids,
            vec![ControllerIdentity::new(1, 3), ControllerIdentity::new(2, 0)]
        );
    }

    #[test]
    fn set_input_requires_plugged_controller() {
        let driver = SimulatedDriver::default();
        driver.attach_adapter(1);
        assert!(!driver.set_input(1, 0, RawControllerState::neutral()));

        driver.plug(1, 0);
        assert!(driver.set_input(1, 0, RawControllerState::default()));
        driver.unplug(1, 0);
        assert!(!driver.set_input(1, 0, RawControllerState::neutral()));
    }

    #[test]
    fn failed_open_creates_no_context() {
        let driver = SimulatedDriver::default();
        driver.fail_open(true);
        assert!(driver.open_context().is_err());
        assert_eq!(driver.contexts_opened(), 0);
    }

    #[test]
    fn close_stops_driver_thread_once() {
        let driver = SimulatedDriver::default();
        let context = driver.open_context().unwrap();
        assert!(driver.wait_ticks(2, Duration::from_secs(2)));

        driver.close_context(context).unwrap();
        assert_eq!(driver.contexts_closed(), 1);
        assert!(matches!(
            driver.close_context(context),
            Err(DriverError::UnknownContext(_))
        ));
        assert_eq!(driver.contexts_closed(), 1);
    }

    #[test]
    fn latest_state_tracks_scene() {
        let driver = SimulatedDriver::default();
        driver.attach_adapter(1);
        driver.plug(1, 1);
        let context = driver.open_context().unwrap();
        assert!(driver.wait_ticks(2, Duration::from_secs(2)));

        assert_eq!(
            driver.latest_state(context, ControllerIdentity::new(1, 1)),
            Some(RawControllerState::neutral())
        );
        assert_eq!(driver.latest_state(context, ControllerIdentity::new(1, 0)), None);
        driver.close_context(context).unwrap();
    }
}
