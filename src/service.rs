//! Threaded wrapper: the framework lock and the keep-alive worker.
//!
//! [`ConnectionService`] owns the [`ConnectionSystem`] behind a mutex (the
//! framework lock) and runs a single worker thread for the whole system.
//! The worker takes the lock, performs one pass over all peers, and then
//! waits on a condition variable until the computed deadline passes or an
//! engine action changed the set of pending deadlines.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::common::time::{Clock, LocalDuration};
use crate::config::Config;
use crate::error::ConfigError;
use crate::fsm::system::ConnectionSystem;
use crate::stack::Stack;
use crate::wire::{MsgHeader, ParticipantId};

#[derive(Default)]
pub(crate) struct WorkerShared {
    wake: Condvar,
    cancel: AtomicBool,
}

/// Handle used to wake the keep-alive worker when deadlines changed.
///
/// A detached waker (the default) does nothing, which keeps the lock-free
/// core usable without a worker thread.
#[derive(Clone, Default)]
pub struct WorkerWaker {
    shared: Option<Arc<WorkerShared>>,
}

impl WorkerWaker {
    pub(crate) fn noop() -> Self {
        Self { shared: None }
    }

    fn attached(shared: Arc<WorkerShared>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    /// Wake the worker so it recomputes its deadline.
    pub fn wake(&self) {
        if let Some(shared) = &self.shared {
            shared.wake.notify_all();
        }
    }
}

/// A [`ConnectionSystem`] together with its framework lock and keep-alive
/// worker thread.
pub struct ConnectionService<S: Stack, C: Clock> {
    system: Arc<Mutex<ConnectionSystem<S, C>>>,
    shared: Arc<WorkerShared>,
    keep_alive_interval: LocalDuration,
    keep_alive_timeout: LocalDuration,
    worker: Option<thread::JoinHandle<()>>,
}

impl<S, C> ConnectionService<S, C>
where
    S: Stack + Send + 'static,
    S::InstanceId: Send + 'static,
    C: Clock + Send + 'static,
{
    /// Create a new service. The worker thread is started by
    /// [`connect`](Self::connect).
    pub fn new(
        stack: S,
        self_pid: ParticipantId,
        config: Config,
        rng: fastrand::Rng,
        clock: C,
    ) -> Result<Self, ConfigError> {
        let keep_alive_interval = config.keep_alive_interval;
        let keep_alive_timeout = config.keep_alive_timeout;

        let shared = Arc::new(WorkerShared::default());
        let mut system = ConnectionSystem::new(stack, self_pid, config, rng, clock)?;
        system.set_waker(WorkerWaker::attached(shared.clone()));

        Ok(Self {
            system: Arc::new(Mutex::new(system)),
            shared,
            keep_alive_interval,
            keep_alive_timeout,
            worker: None,
        })
    }

    /// Connect the system and start the keep-alive worker.
    pub fn connect(&mut self) -> bool {
        if !self.system.lock().unwrap().connect() {
            return false;
        }

        if !self.keep_alive_interval.is_zero() {
            self.shared.cancel.store(false, Ordering::SeqCst);

            let system = Arc::clone(&self.system);
            let shared = Arc::clone(&self.shared);
            let interval = self.keep_alive_interval;
            let timeout = self.keep_alive_timeout;

            self.worker = Some(
                thread::Builder::new()
                    .name("connsys-keepalive".into())
                    .spawn(move || worker_loop(system, shared, interval, timeout))
                    .expect("spawning the keep-alive worker failed"),
            );
        }
        true
    }

    /// Cancel the worker, wait for it to finish and disconnect the system.
    pub fn disconnect(&mut self) -> bool {
        self.cancel_worker();
        self.system.lock().unwrap().disconnect()
    }

    fn cancel_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.cancel.store(true, Ordering::SeqCst);
            self.shared.wake.notify_all();
            if handle.join().is_err() {
                warn!(target: "connsys", "keep-alive worker panicked");
            }
        }
    }

    /// A service instance became available.
    pub fn handle_service_available(&self, iid: S::InstanceId) {
        self.system.lock().unwrap().handle_service_available(iid);
    }

    /// A service instance went away.
    pub fn handle_service_unavailable(&self, iid: S::InstanceId) {
        self.system.lock().unwrap().handle_service_unavailable(iid);
    }

    /// A participant-info message arrived.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_participant_info(
        &self,
        header: MsgHeader,
        protocol_version: u16,
        minor_protocol_version: u32,
        sender_iid: S::InstanceId,
        expected_receiver_pid: u64,
        clock_type: u8,
        timestamp_now: u64,
    ) {
        self.system.lock().unwrap().handle_participant_info(
            header,
            protocol_version,
            minor_protocol_version,
            sender_iid,
            expected_receiver_pid,
            clock_type,
            timestamp_now,
        );
    }

    /// A keep-alive message arrived.
    pub fn handle_keep_alive(
        &self,
        header: MsgHeader,
        timestamp_now: u64,
        using_previous_message_id: bool,
    ) {
        self.system.lock().unwrap().handle_keep_alive(
            header,
            timestamp_now,
            using_previous_message_id,
        );
    }

    /// Run `f` under the framework lock, e.g. for sending or listener
    /// registration.
    pub fn with_system<R>(&self, f: impl FnOnce(&mut ConnectionSystem<S, C>) -> R) -> R {
        f(&mut self.system.lock().unwrap())
    }
}

fn worker_loop<S, C>(
    system: Arc<Mutex<ConnectionSystem<S, C>>>,
    shared: Arc<WorkerShared>,
    interval: LocalDuration,
    timeout: LocalDuration,
) where
    S: Stack,
    C: Clock,
{
    info!(target: "connsys", "keep-alive worker started");

    let mut guard = system.lock().unwrap();
    while !shared.cancel.load(Ordering::SeqCst) {
        let deadline = guard.do_one_thread_loop(interval, timeout);
        let now = guard.now();
        let wait: Duration = (deadline - now).into();

        // The lock is released while waiting; a waker notification or the
        // deadline resumes the loop.
        let (g, _) = shared.wake.wait_timeout(guard, wait).unwrap();
        guard = g;
    }
    drop(guard);

    info!(target: "connsys", "keep-alive worker canceled");
}

impl<S: Stack, C: Clock> Drop for ConnectionService<S, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.cancel.store(true, Ordering::SeqCst);
            self.shared.wake.notify_all();
            let _ = handle.join();
        }
        if let Ok(mut system) = self.system.lock() {
            if system.is_started() {
                system.disconnect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::common::time::{LocalDuration, SystemClock};
    use crate::config::Config;
    use crate::fsm::tests::{MockStack, Sent, PROTO};
    use crate::wire::{MsgHeader, ParticipantId};

    use super::ConnectionService;

    fn service(
        interval: u64,
        timeout: u64,
    ) -> ConnectionService<MockStack, SystemClock> {
        let config = Config {
            communication_user_id: 1,
            protocol_version: PROTO,
            enable_initiator_responder: true,
            keep_alive_interval: LocalDuration::from_millis(interval as u128),
            keep_alive_timeout: LocalDuration::from_millis(timeout as u128),
        };
        ConnectionService::new(
            MockStack::new(5),
            ParticipantId::new(4),
            config,
            fastrand::Rng::with_seed(3),
            SystemClock,
        )
        .expect("valid service config")
    }

    #[test]
    fn worker_emits_keep_alives_for_a_connected_peer() {
        let mut service = service(20, 500);
        assert!(service.connect());

        service.handle_service_available(1);
        let session = service.with_system(|sys| {
            sys.stack()
                .sent
                .iter()
                .find_map(|s| match s {
                    Sent::ParticipantInfo { header, .. } => Some(header.session_id),
                    _ => None,
                })
                .expect("announcement was sent")
        });
        service.handle_participant_info(
            MsgHeader {
                participant_id: 2,
                session_id: session,
                message_id: 1,
            },
            PROTO,
            1,
            1,
            0,
            0,
            0,
        );

        std::thread::sleep(Duration::from_millis(120));

        let keep_alives = service.with_system(|sys| {
            sys.stack()
                .sent
                .iter()
                .filter(|s| matches!(s, Sent::KeepAlive { .. }))
                .count()
        });
        assert!(keep_alives >= 1, "worker sent no keep-alives");

        assert!(service.disconnect());
    }

    #[test]
    fn disabled_keep_alive_runs_without_a_worker() {
        let mut service = service(0, 0);
        assert!(service.connect());
        assert!(service.worker.is_none());
        assert!(service.disconnect());
    }

    #[test]
    fn disconnect_without_connect_fails() {
        let mut service = service(20, 500);
        assert!(!service.disconnect());
    }
}
