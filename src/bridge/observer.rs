//! Application observer hooks
//!
//! The bridge calls an observer synchronously from its translation step,
//! after the registry has been changed. Observers only ever see identities
//! and plain state values, never native handles.

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::debug;

use crate::controller::{ControllerIdentity, ControllerState};

/// Receives controller lifecycle and state changes.
///
/// Called on the driver's thread; implementations must return quickly and
/// must not call [`Bridge::close`](super::Bridge::close).
pub trait ControllerObserver: Send + Sync {
    fn on_connect(&self, _id: ControllerIdentity) {}
    fn on_disconnect(&self, _id: ControllerIdentity) {}
    fn on_update(&self, _id: ControllerIdentity, _state: ControllerState) {}
}

// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ControllerObserver for NoopObserver {}

// Controller event with a local timestamp
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Connected {
        id: ControllerIdentity,
        timestamp: DateTime<Local>,
    },
    Disconnected {
        id: ControllerIdentity,
        timestamp: DateTime<Local>,
    },
    Updated {
        id: ControllerIdentity,
        state: ControllerState,
        timestamp: DateTime<Local>,
    },
}

impl ControllerEvent {
    pub fn id(&self) -> ControllerIdentity {
        match self {
            ControllerEvent::Connected { id, .. }
            | ControllerEvent::Disconnected { id, .. }
            | ControllerEvent::Updated { id, .. } => *id,
        }
    }
}

/// Forwards events into a bounded channel without blocking the driver
/// thread. Events that do not fit are dropped.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::Sender<ControllerEvent>,
    forward_updates: bool,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::Sender<ControllerEvent>) -> Self {
        Self {
            sender,
            forward_updates: true,
        }
    }

    /// Creates an observer and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControllerEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }

    /// Only forward connect and disconnect events.
    pub fn lifecycle_only(mut self) -> Self {
        self.forward_updates = false;
        self
    }

    fn forward(&self, event: ControllerEvent) {
        if let Err(e) = self.sender.try_send(event) {
            debug!("Dropped controller event: {}", e);
        }
    }
}

impl ControllerObserver for ChannelObserver {
    fn on_connect(&self, id: ControllerIdentity) {
        self.forward(ControllerEvent::Connected {
            id,
            timestamp: Local::now(),
        });
    }

    fn on_disconnect(&self, id: ControllerIdentity) {
        self.forward(ControllerEvent::Disconnected {
            id,
            timestamp: Local::now(),
        });
    }

    fn on_update(&self, id: ControllerIdentity, state: ControllerState) {
        if self.forward_updates {
            self.forward(ControllerEvent::Updated {
                id,
                state,
                timestamp: Local::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_observer_forwards_in_order() {
        let (observer, mut receiver) = ChannelObserver::channel(8);
        let id = ControllerIdentity::new(1, 2);

        observer.on_connect(id);
        observer.on_update(id, ControllerState::default());
        observer.on_disconnect(id);

        assert!(matches!(
            receiver.try_recv(),
            Ok(ControllerEvent::Connected { .. })
        ));
        assert!(matches!(
            receiver.try_recv(),
            Ok(ControllerEvent::Updated { .. })
        ));
        let last = receiver.try_recv().unwrap();
        assert!(matches!(last, ControllerEvent::Disconnected { .. }));
        assert_eq!(last.id(), id);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (observer, mut receiver) = ChannelObserver::channel(1);
        let id = ControllerIdentity::new(1, 0);

        observer.on_connect(id);
        observer.on_disconnect(id);

        assert!(matches!(
            receiver.try_recv(),
            Ok(ControllerEvent::Connected { .. })
        ));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn lifecycle_only_skips_updates() {
        let (observer, mut receiver) = ChannelObserver::channel(4);
        let observer = observer.lifecycle_only();
        let id = ControllerIdentity::new(1, 0);

        observer.on_update(id, ControllerState::default());
        assert!(receiver.try_recv().is_err());
    }
}
