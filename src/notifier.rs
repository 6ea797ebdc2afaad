//! Connection status notifications towards the embedding layer.
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::wire::ParticipantId;

/// Connection status of a remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// An agreed session with the participant exists.
    Connected,
    /// No agreed session with the participant exists.
    NotConnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::NotConnected => write!(f, "NotConnected"),
        }
    }
}

/// Observer of participant connection changes.
///
/// Listeners are invoked under the framework lock, on the thread that caused
/// the transition. A listener must not call back into the connection system.
pub trait ConnectionListener: Send + Sync {
    /// A participant reached an agreed session.
    fn new_participant_has_connected(&self, pid: ParticipantId);

    /// A previously connected participant lost its session.
    fn participant_has_disconnected(&self, pid: ParticipantId);
}

/// Dispatches connection status changes to registered listeners.
///
/// The engines guarantee that per participant the emitted sequence strictly
/// alternates Connected / NotConnected and never repeats a status.
pub struct ConnectionStatusNotifier {
    listeners: Vec<Arc<dyn ConnectionListener>>,
    dispatching: Cell<bool>,
}

impl ConnectionStatusNotifier {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Vec::new(),
            dispatching: Cell::new(false),
        }
    }

    /// Register a listener for connection updates.
    pub fn register(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.push(listener);
    }

    /// Unregister a previously registered listener.
    pub fn unregister(&mut self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn notify(&self, pid: ParticipantId, status: ConnectionStatus) {
        debug!(target: "connsys", "notify {} {}", pid, status);

        // Listeners must not re-enter the engine; catch violations in tests.
        debug_assert!(!self.dispatching.get(), "listener re-entered the notifier");
        self.dispatching.set(true);
        for listener in &self.listeners {
            match status {
                ConnectionStatus::Connected => listener.new_participant_has_connected(pid),
                ConnectionStatus::NotConnected => listener.participant_has_disconnected(pid),
            }
        }
        self.dispatching.set(false);
    }
}

impl fmt::Debug for ConnectionStatusNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStatusNotifier")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ParticipantId, ConnectionStatus)>>,
    }

    impl ConnectionListener for Recorder {
        fn new_participant_has_connected(&self, pid: ParticipantId) {
            self.seen
                .lock()
                .unwrap()
                .push((pid, ConnectionStatus::Connected));
        }

        fn participant_has_disconnected(&self, pid: ParticipantId) {
            self.seen
                .lock()
                .unwrap()
                .push((pid, ConnectionStatus::NotConnected));
        }
    }

    #[test]
    fn registered_listener_receives_both_statuses() {
        let mut notifier = ConnectionStatusNotifier::new();
        let recorder = Arc::new(Recorder::default());
        notifier.register(recorder.clone());

        let pid = ParticipantId::new(7);
        notifier.notify(pid, ConnectionStatus::Connected);
        notifier.notify(pid, ConnectionStatus::NotConnected);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (pid, ConnectionStatus::Connected),
                (pid, ConnectionStatus::NotConnected)
            ]
        );
    }

    #[test]
    fn unregistered_listener_is_silent() {
        let mut notifier = ConnectionStatusNotifier::new();
        let recorder = Arc::new(Recorder::default());
        notifier.register(recorder.clone());
        let dyn_listener: Arc<dyn ConnectionListener> = recorder.clone();
        notifier.unregister(&dyn_listener);

        notifier.notify(ParticipantId::new(7), ConnectionStatus::Connected);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
