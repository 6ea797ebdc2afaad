//! The connection system: validation, engine routing and the send surface.
//!
//! Every incoming transport event is handed to exactly one engine. The
//! responsibility rule is the minor protocol version last received from a
//! peer: version 0 belongs to the [`legacy`](super::legacy) engine, version 1
//! and above to the [`initres`](super::initres) engine. Availability is
//! tracked by both so that nothing is lost when a peer switches versions.
//!
//! All methods must be called under the framework lock; see
//! [`ConnectionService`](crate::service::ConnectionService) for the threaded
//! wrapper that owns the lock and the keep-alive worker.
use tracing::{debug, error, info, warn};

use crate::common::time::{Clock, LocalDuration, LocalTime};
use crate::config::Config;
use crate::error::{ConfigError, SendError};
use crate::notifier::ConnectionStatusNotifier;
use crate::service::WorkerWaker;
use crate::stack::Stack;
use crate::wire::{MsgHeader, ParticipantId};

use super::initres::{InitResEngine, ParticipantState};
use super::legacy::LegacyEngine;
use super::RecvOutcome;

/// Connection management core for one service type.
///
/// Owns the per-peer state machines, the transport stack handle and the
/// notifier. The embedding layer drives it with the stack callbacks and uses
/// [`send_unicast`](Self::send_unicast) /
/// [`send_broadcast`](Self::send_broadcast) for outgoing application
/// traffic.
pub struct ConnectionSystem<S: Stack, C: Clock> {
    config: Config,
    self_pid: ParticipantId,
    self_iid: S::InstanceId,

    stack: S,
    clock: C,
    notifier: ConnectionStatusNotifier,

    legacy: LegacyEngine<S::InstanceId, C>,
    ir: InitResEngine<S::InstanceId, C>,

    started: bool,
    waker: WorkerWaker,
}

impl<S: Stack, C: Clock> ConnectionSystem<S, C> {
    /// Create a new connection system around the given stack.
    pub fn new(
        stack: S,
        self_pid: ParticipantId,
        config: Config,
        mut rng: fastrand::Rng,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !self_pid.is_valid() {
            error!(target: "connsys", "invalid own participant id");
            return Err(ConfigError::InvalidParticipantId);
        }

        let self_iid = stack.service_instance_id();
        let announced_minor = if config.enable_initiator_responder {
            crate::wire::INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION
        } else {
            crate::wire::FALLBACK_MINOR_PROTOCOL_VERSION
        };

        let legacy_rng = rng.fork();
        Ok(Self {
            legacy: LegacyEngine::new(
                self_pid,
                self_iid,
                config.protocol_version,
                announced_minor,
                legacy_rng,
                clock.clone(),
            ),
            ir: InitResEngine::new(
                self_pid,
                self_iid,
                config.protocol_version,
                rng,
                clock.clone(),
            ),
            config,
            self_pid,
            self_iid,
            stack,
            clock,
            notifier: ConnectionStatusNotifier::new(),
            started: false,
            waker: WorkerWaker::noop(),
        })
    }

    /// Bring the system up. The stack is connected; peers are handled as
    /// soon as the stack reports them.
    pub fn connect(&mut self) -> bool {
        info!(
            target: "connsys",
            "connect: user {}, keep-alive interval {}, timeout {}",
            self.config.communication_user_id,
            self.config.keep_alive_interval,
            self.config.keep_alive_timeout
        );

        if self.started {
            error!(target: "connsys", "connect: already connected");
            return false;
        }
        if !self.stack.connect() {
            return false;
        }
        if self.config.enable_initiator_responder {
            self.ir.start();
        }
        self.started = true;
        true
    }

    /// Tear the system down. Every connected participant is reported as
    /// NotConnected before the per-peer state is dropped.
    pub fn disconnect(&mut self) -> bool {
        if !self.started {
            error!(target: "connsys", "disconnect: not connected");
            return false;
        }
        if !self.stack.disconnect() {
            return false;
        }

        self.ir.shutdown(&self.notifier);
        self.legacy.shutdown(&self.notifier);
        self.started = false;
        true
    }

    /// Whether [`connect`](Self::connect) succeeded and
    /// [`disconnect`](Self::disconnect) was not called yet.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Access to the notifier for listener registration.
    pub fn notifier_mut(&mut self) -> &mut ConnectionStatusNotifier {
        &mut self.notifier
    }

    /// Current time of the injected clock.
    pub fn now(&self) -> LocalTime {
        self.clock.local_time()
    }

    /// The configuration the system was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn set_waker(&mut self, waker: WorkerWaker) {
        self.waker = waker;
    }

    /// A service instance was reported available by the stack.
    pub fn handle_service_available(&mut self, iid: S::InstanceId) {
        if !self.started {
            debug!(target: "connsys", "service available for {} dropped, not started", iid);
            return;
        }
        if iid == self.self_iid {
            error!(target: "connsys", "service available for own iid {}", iid);
            return;
        }

        let responsible = self.config.enable_initiator_responder
            && self
                .ir
                .handle_service_available(iid, &mut self.stack, &self.notifier);

        // Availability is shared across the engines; the legacy engine only
        // announces when the instance has no initiator/responder owner.
        self.legacy
            .service_available(iid, !responsible, &mut self.stack, &self.notifier);

        self.waker.wake();
    }

    /// A service instance was reported unavailable by the stack.
    pub fn handle_service_unavailable(&mut self, iid: S::InstanceId) {
        if !self.started {
            debug!(target: "connsys", "service unavailable for {} dropped, not started", iid);
            return;
        }
        if iid == self.self_iid {
            error!(target: "connsys", "service unavailable for own iid {}", iid);
            return;
        }

        if self.config.enable_initiator_responder {
            self.ir.handle_service_unavailable(iid, &self.notifier);
        }
        // An extra down never hurts the engine that was not responsible.
        self.legacy.service_unavailable(iid, &self.notifier);

        self.waker.wake();
    }

    /// A participant-info message arrived from the stack.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_participant_info(
        &mut self,
        header: MsgHeader,
        protocol_version: u16,
        minor_protocol_version: u32,
        sender_iid: S::InstanceId,
        _expected_receiver_pid: u64,
        _clock_type: u8,
        _timestamp_now: u64,
    ) {
        if !self.started {
            debug!(target: "connsys", "participant info dropped, not started");
            return;
        }

        let pid = ParticipantId::new(header.participant_id);
        if protocol_version != self.config.protocol_version {
            warn!(
                target: "connsys",
                "ignore participant info from iid {}, {}: protocol version {} expected {}",
                sender_iid, pid, protocol_version, self.config.protocol_version
            );
            return;
        }
        if !pid.is_valid() {
            error!(target: "connsys", "participant info with invalid pid from iid {}", sender_iid);
            return;
        }
        if pid == self.self_pid {
            error!(target: "connsys", "participant info from own pid, iid {}", sender_iid);
            return;
        }
        if sender_iid == self.self_iid {
            error!(target: "connsys", "participant info from own iid, {}", pid);
            return;
        }
        if header.session_id == 0 {
            error!(target: "connsys", "participant info with impossible session id 0 from {}", pid);
            return;
        }
        if header.message_id == 0 {
            error!(target: "connsys", "participant info with impossible message id 0 from {}", pid);
            return;
        }

        let mut handled = false;
        if self.config.enable_initiator_responder {
            // Send-state of the legacy announce, consulted by the
            // initiator for the direct connect. Captured before the
            // hand-over resets the legacy session.
            let (sid, mid, sent) = self.legacy.send_state_for_handover(sender_iid);

            if self.ir.is_responsible_for_minor_version(minor_protocol_version) {
                // A NotConnected from the old owner must precede whatever
                // the new owner emits.
                self.legacy.release_participant(pid, &self.notifier);
            }

            handled = self.ir.handle_participant_info(
                header,
                minor_protocol_version,
                sender_iid,
                sid,
                mid,
                sent,
                &mut self.stack,
                &self.notifier,
            );
        }
        if !handled {
            self.legacy
                .handle_participant_info(header, sender_iid, &mut self.stack, &self.notifier);
        }

        self.waker.wake();
    }

    /// A keep-alive message arrived from the stack.
    pub fn handle_keep_alive(
        &mut self,
        header: MsgHeader,
        _timestamp_now: u64,
        using_previous_message_id: bool,
    ) {
        if !self.started {
            debug!(target: "connsys", "keep-alive dropped, not started");
            return;
        }

        let handled = self.config.enable_initiator_responder
            && self.ir.handle_keep_alive(
                header,
                using_previous_message_id,
                &mut self.stack,
                &self.notifier,
            );
        if !handled {
            self.legacy
                .handle_keep_alive(header, &mut self.stack, &self.notifier);
        }

        self.waker.wake();
    }

    /// Check the header of a received application message. Returns the
    /// sending participant when the message should be delivered to the
    /// embedding layer, `None` when it must be discarded.
    pub fn process_received_message_header(&mut self, header: MsgHeader) -> Option<ParticipantId> {
        if !self.started {
            warn!(target: "connsys", "message dropped, not started");
            return None;
        }

        let outcome = if self.config.enable_initiator_responder {
            self.ir
                .process_received_message_header(header, &mut self.stack, &self.notifier)
        } else {
            RecvOutcome::NotResponsible
        };

        let result = match outcome {
            RecvOutcome::Deliver(pid) => Some(pid),
            RecvOutcome::Dropped => None,
            RecvOutcome::NotResponsible => self.legacy.process_received_message_header(
                header,
                &mut self.stack,
                &self.notifier,
            ),
        };

        self.waker.wake();
        result
    }

    /// Send a message to a single connected participant. `send` receives
    /// the destination instance and the prepared header; it must return
    /// whether the transport accepted the frame.
    pub fn send_unicast<F>(&mut self, to: ParticipantId, send: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut S, S::InstanceId, MsgHeader) -> bool,
    {
        if !self.started {
            error!(target: "connsys", "send_unicast called without being connected");
            return Err(SendError::NotStarted);
        }

        let result = if self.config.enable_initiator_responder
            && self.ir.is_responsible_for_participant(to)
        {
            self.ir
                .send_unicast(to, &mut self.stack, &self.notifier, send)
        } else {
            self.legacy
                .send_unicast(to, &mut self.stack, &self.notifier, send)
        };

        self.waker.wake();
        result
    }

    /// Send a message to every connected participant. Per-peer send
    /// failures reset the affected session but do not fail the broadcast.
    pub fn send_broadcast<F>(&mut self, mut send: F) -> Result<(), SendError>
    where
        F: FnMut(&mut S, S::InstanceId, MsgHeader) -> bool,
    {
        if !self.started {
            error!(target: "connsys", "send_broadcast called without being connected");
            return Err(SendError::NotStarted);
        }

        if self.config.enable_initiator_responder {
            self.ir
                .send_broadcast(&mut self.stack, &self.notifier, &mut send);
        }
        self.legacy
            .send_broadcast(&mut self.stack, &self.notifier, &mut send);

        self.waker.wake();
        Ok(())
    }

    /// One pass of the keep-alive worker: trigger receive timeouts, emit
    /// periodic traffic and compute the next wake-up deadline.
    pub fn do_one_thread_loop(
        &mut self,
        keep_alive_interval: LocalDuration,
        keep_alive_timeout: LocalDuration,
    ) -> LocalTime {
        debug_assert!(!keep_alive_interval.is_zero());
        debug_assert!(keep_alive_interval < keep_alive_timeout);

        let now = self.clock.local_time();

        let ir = &self.ir;
        let mut next_wakeup = self.legacy.do_thread_loop(
            now,
            keep_alive_interval,
            keep_alive_timeout,
            &mut self.stack,
            &self.notifier,
            |iid| ir.is_responsible_for_instance(iid),
        );

        if self.config.enable_initiator_responder {
            next_wakeup = next_wakeup.min(self.ir.do_thread_loop(
                now,
                keep_alive_interval,
                keep_alive_timeout,
                &mut self.stack,
                &self.notifier,
            ));
        }

        // The returned deadline is always in the future so the worker never
        // spins.
        let floor = now + LocalDuration::from_millis(1);
        next_wakeup.max(floor)
    }

    /// Read-only view of the initiator/responder record for an instance.
    pub fn participant_state(&self, iid: S::InstanceId) -> Option<&ParticipantState<S::InstanceId>> {
        self.ir.participant_state(iid)
    }

    #[cfg(test)]
    pub(crate) fn legacy_engine(&self) -> &LegacyEngine<S::InstanceId, C> {
        &self.legacy
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &S {
        &self.stack
    }

    #[cfg(test)]
    pub(crate) fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    /// Dump the state of both engines and the stack for logging.
    pub fn write_connection_info(&self) -> String {
        let mut out = format!(
            "ConnectionSystem({}): pid {}, iid {}, started {}",
            self.config.communication_user_id, self.self_pid, self.self_iid, self.started
        );
        self.ir.write_state(&mut out);
        self.legacy.write_state(&mut out);
        self.stack.log_connection_state(&mut out);
        out
    }

    /// Log the state of both engines and the stack.
    pub fn log_connection_info(&self) {
        info!(target: "connsys", "{}", self.write_connection_info());
    }
}
