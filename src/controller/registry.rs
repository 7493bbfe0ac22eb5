//! Controller Registry - shared table of connected controllers
//!
//! The registry maps a [`ControllerIdentity`] to the latest [`ControllerState`]
//! of that controller. It is written from the driver thread (plug, unplug and
//! state callbacks) and read from the application thread at its own cadence.
//!
//! # Locking
//!
//! ```text
//! RwLock<HashMap<Id, Arc<RwLock<State>>>>
//!   outer lock: exclusive only for register / unregister
//!   entry lock: exclusive for update, shared for get / snapshot
//! ```
//!
//! `update` holds the outer lock shared while it writes the entry, so an
//! update is either applied before an `unregister` of the same id or fails
//! with [`RegistryError::NotFound`]. Updates to different ids never contend.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, trace};

use super::state::{ControllerIdentity, ControllerState};

// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Controller {0} is not registered")]
    NotFound(ControllerIdentity),

    #[error("Controller {0} is already registered")]
    Duplicate(ControllerIdentity),
}

type Entry = Arc<RwLock<ControllerState>>;

/// Concurrent map of connected controllers.
///
/// `ControllerState` is `Copy` and every write replaces it wholesale, so a
/// lock poisoned by a panicking holder still guards a complete value; poison
/// is therefore ignored rather than propagated.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<ControllerIdentity, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a default state for `id`.
    ///
    /// A second registration of a live id fails with
    /// [`RegistryError::Duplicate`] and leaves the stored state untouched.
    pub fn register(&self, id: ControllerIdentity) -> Result<(), RegistryError> {
        let mut entries = self.write_entries();
        if entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }

        entries.insert(id, Arc::new(RwLock::new(ControllerState::default())));
        debug!("Registered controller {} ({} connected)", id, entries.len());
        Ok(())
    }

    /// Removes `id` and returns its last state, or `None` if it was absent.
    pub fn unregister(&self, id: ControllerIdentity) -> Option<ControllerState> {
        let removed = self.write_entries().remove(&id)?;
        let state = *read_entry(&removed);
        debug!("Unregistered controller {}", id);
        Some(state)
    }

    /// Replaces the stored state of `id` wholesale.
    pub fn update(
        &self,
        id: ControllerIdentity,
        state: ControllerState,
    ) -> Result<(), RegistryError> {
        let entries = self.read_entries();
        let entry = entries.get(&id).ok_or(RegistryError::NotFound(id))?;
        *entry.write().unwrap_or_else(PoisonError::into_inner) = state;
        trace!("Updated controller {}", id);
        Ok(())
    }

    pub fn get(&self, id: ControllerIdentity) -> Option<ControllerState> {
        self.read_entries().get(&id).map(|entry| *read_entry(entry))
    }

    /// Copies out every entry, sorted by identity.
    ///
    /// Each state is read atomically; the set as a whole is not a single
    /// transaction across controllers.
    pub fn snapshot(&self) -> Vec<(ControllerIdentity, ControllerState)> {
        let mut snapshot: Vec<_> = self
            .read_entries()
            .iter()
            .map(|(id, entry)| (*id, *read_entry(entry)))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);
        snapshot
    }

    pub fn contains(&self, id: ControllerIdentity) -> bool {
        self.read_entries().contains_key(&id)
    }

    pub fn identities(&self) -> Vec<ControllerIdentity> {
        let mut ids: Vec<_> = self.read_entries().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Removes every entry, returning what was stored.
    pub fn clear(&self) -> Vec<(ControllerIdentity, ControllerState)> {
        let mut drained: Vec<_> = self
            .write_entries()
            .drain()
            .map(|(id, entry)| (id, *read_entry(&entry)))
            .collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<ControllerIdentity, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<ControllerIdentity, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_entry(entry: &Entry) -> RwLockReadGuard<'_, ControllerState> {
    entry.read().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only view of a [`Registry`] handed to application code.
///
/// Membership changes only through plug and unplug events, so consumers get
/// the read half of the registry and nothing else.
#[derive(Debug, Clone)]
pub struct RegistryReader {
    registry: Arc<Registry>,
}

impl RegistryReader {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn get(&self, id: ControllerIdentity) -> Option<ControllerState> {
        self.registry.get(id)
    }

    pub fn snapshot(&self) -> Vec<(ControllerIdentity, ControllerState)> {
        self.registry.snapshot()
    }

    pub fn contains(&self, id: ControllerIdentity) -> bool {
        self.registry.contains(id)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}
