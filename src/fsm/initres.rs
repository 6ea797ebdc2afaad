//! Engine for the initiator/responder handshake (minor protocol version 1).
//!
//! The handshake role of a peer pair is fixed by comparing instance ids: the
//! smaller id is always the responder. Exactly one of the two role state
//! machines is active per peer. Only the initiator ever originates a
//! session; the responder adopts whatever session the initiator announces
//! and signals errors back through keep-alives with message id 0.
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, error, info, trace, warn};

use crate::common::time::{Clock, LocalDuration, LocalTime};
use crate::error::SendError;
use crate::notifier::{ConnectionStatus, ConnectionStatusNotifier};
use crate::stack::{InstanceId, Stack};
use crate::wire::{MsgHeader, ParticipantId, INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION};

use super::{Handle, RecvOutcome};

/// State of the initiator side of a peer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    /// No participant info was seen yet.
    Invalid,
    /// The peer is known but its service is down.
    Unavailable,
    /// A session was announced, waiting for the responder's reply.
    WaitForSessionReply,
    /// An agreed session exists.
    Connected,
}

/// State of the responder side of a peer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// No participant info was seen yet.
    Invalid,
    /// The peer is known but its service is down.
    Unavailable,
    /// A session was adopted but the service is not up yet.
    WaitForUp,
    /// The service is up but no valid session exists.
    WaitForSession,
    /// An agreed session exists.
    Connected,
}

impl fmt::Display for InitiatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "Invalid",
            Self::Unavailable => "Unavailable",
            Self::WaitForSessionReply => "WaitForSessionReply",
            Self::Connected => "Connected",
        };
        write!(f, "{}", name)
    }
}

impl fmt::Display for ResponderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "Invalid",
            Self::Unavailable => "Unavailable",
            Self::WaitForUp => "WaitForUp",
            Self::WaitForSession => "WaitForSession",
            Self::Connected => "Connected",
        };
        write!(f, "{}", name)
    }
}

/// Per-peer record of the initiator/responder engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantState<I> {
    /// Identity of the peer; unknown until the first participant info.
    pub remote_pid: Option<ParticipantId>,
    /// Transport address of the peer.
    pub remote_iid: I,

    /// Role of the local side for this pair, derived from the instance ids.
    pub self_is_initiator: bool,

    pub last_sent_time: LocalTime,
    pub last_receive_time: LocalTime,

    /// Zero while no session exists.
    pub active_session_id: u64,
    pub last_sent_message_id: u64,
    pub last_received_message_id: u64,

    pub initiator_state: InitiatorState,
    pub responder_state: ResponderState,
}

pub(crate) struct InitResEngine<I, C> {
    self_pid: ParticipantId,
    self_iid: I,
    protocol_version: u16,

    started: bool,
    states: Vec<ParticipantState<I>>,
    known: HashMap<ParticipantId, Handle>,
    connected: HashMap<ParticipantId, Handle>,
    available: HashMap<I, Handle>,

    rng: fastrand::Rng,
    clock: C,
}

impl<I: InstanceId, C: Clock> InitResEngine<I, C> {
    pub(crate) fn new(
        self_pid: ParticipantId,
        self_iid: I,
        protocol_version: u16,
        rng: fastrand::Rng,
        clock: C,
    ) -> Self {
        Self {
            self_pid,
            self_iid,
            protocol_version,
            started: false,
            states: Vec::new(),
            known: HashMap::new(),
            connected: HashMap::new(),
            available: HashMap::new(),
            rng,
            clock,
        }
    }

    pub(crate) fn start(&mut self) {
        info!(
            target: "connsys",
            "initres: start, minor protocol version {}",
            INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION
        );
        self.started = true;
    }

    /// Emit NotConnected for every connected peer and forget all state.
    pub(crate) fn shutdown(&mut self, notifier: &ConnectionStatusNotifier) {
        if !self.started {
            return;
        }
        let connected: Vec<ParticipantId> = self.connected.keys().copied().collect();
        for pid in connected {
            notifier.notify(pid, ConnectionStatus::NotConnected);
        }
        self.known.clear();
        self.connected.clear();
        self.available.clear();
        self.states.clear();
        self.started = false;
    }

    pub(crate) fn is_responsible_for_minor_version(&self, version: u32) -> bool {
        version >= INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION
    }

    /// The smaller instance id is always the responder.
    fn is_self_initiator(&self, remote_iid: I) -> bool {
        debug_assert!(remote_iid != self.self_iid);
        remote_iid < self.self_iid
    }

    fn add_state(&mut self, pid: Option<ParticipantId>, iid: I) -> Handle {
        let handle = Handle(self.states.len());
        self.states.push(ParticipantState {
            remote_pid: pid,
            remote_iid: iid,
            self_is_initiator: self.is_self_initiator(iid),
            last_sent_time: LocalTime::default(),
            last_receive_time: LocalTime::default(),
            active_session_id: 0,
            last_sent_message_id: 0,
            last_received_message_id: 0,
            initiator_state: InitiatorState::Invalid,
            responder_state: ResponderState::Invalid,
        });
        handle
    }

    fn find_by_iid(&self, iid: I) -> Option<Handle> {
        self.states
            .iter()
            .position(|p| p.remote_iid == iid)
            .map(Handle)
    }

    fn state(&self, handle: Handle) -> &ParticipantState<I> {
        &self.states[handle.index()]
    }

    fn state_mut(&mut self, handle: Handle) -> &mut ParticipantState<I> {
        &mut self.states[handle.index()]
    }

    fn is_connected(&self, handle: Handle) -> bool {
        self.state(handle)
            .remote_pid
            .map_or(false, |pid| self.connected.contains_key(&pid))
    }

    fn is_service_available(&self, handle: Handle) -> bool {
        self.available.contains_key(&self.state(handle).remote_iid)
    }

    pub(crate) fn is_instance_available(&self, iid: I) -> bool {
        self.available.contains_key(&iid)
    }

    /// Responsible for an instance once a participant info linked a pid.
    pub(crate) fn is_responsible_for_instance(&self, iid: I) -> bool {
        self.available
            .get(&iid)
            .map_or(false, |h| self.state(*h).remote_pid.is_some())
    }

    pub(crate) fn is_responsible_for_participant(&self, pid: ParticipantId) -> bool {
        self.known.contains_key(&pid)
    }

    fn header_for(&mut self, handle: Handle) -> MsgHeader {
        let participant_id = self.self_pid.get();
        let p = self.state_mut(handle);
        p.last_sent_message_id += 1;
        MsgHeader {
            participant_id,
            session_id: p.active_session_id,
            message_id: p.last_sent_message_id,
        }
    }

    fn disconnect_participant(&mut self, handle: Handle, notifier: &ConnectionStatusNotifier) {
        debug_assert!(self.is_connected(handle));
        let pid = self.state(handle).remote_pid.expect("connected has a pid");
        self.connected.remove(&pid);
        notifier.notify(pid, ConnectionStatus::NotConnected);
    }

    fn connect_participant(
        &mut self,
        handle: Handle,
        notifier: &ConnectionStatusNotifier,
        from: &str,
    ) {
        let pid = self.state(handle).remote_pid.expect("connecting requires a pid");
        info!(target: "connsys", "initres: connected {} from state {}", pid, from);
        self.connected.insert(pid, handle);
        notifier.notify(pid, ConnectionStatus::Connected);
    }

    /// Start a fresh session towards the responder and announce it.
    fn initiator_init_session<S: Stack<InstanceId = I>>(
        &mut self,
        handle: Handle,
        reason: &str,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        debug_assert!(self.state(handle).self_is_initiator);
        debug_assert!(self.is_service_available(handle));

        if self.is_connected(handle) {
            warn!(
                target: "connsys",
                "initres: disconnect {} because {}",
                self.state(handle).remote_pid.expect("connected has a pid"),
                reason
            );
            debug_assert_eq!(self.state(handle).initiator_state, InitiatorState::Connected);
            self.disconnect_participant(handle, notifier);
        }

        let now = self.clock.local_time();
        let session = self.rng.u64(1..u64::MAX);
        {
            let p = self.state_mut(handle);
            p.active_session_id = session;
            p.last_sent_message_id = 0;
            p.last_received_message_id = 0;
            // Set even when sending fails below to prevent init-session spam;
            // the receive side gets a full timeout for the reply.
            p.last_sent_time = now;
            p.last_receive_time = now;
        }

        let header = self.header_for(handle);
        let (iid, receiver) = {
            let p = self.state(handle);
            (p.remote_iid, p.remote_pid.map(ParticipantId::get).unwrap_or(0))
        };
        info!(
            target: "connsys",
            "initres: init session to iid {}, receiver pid {}, {}, state {} -> {} ({})",
            iid,
            receiver,
            header,
            self.state(handle).initiator_state,
            InitiatorState::WaitForSessionReply,
            reason
        );

        if !stack.send_participant_info(
            iid,
            header,
            self.protocol_version,
            INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION,
            self.self_iid,
            receiver,
            0,
            0,
        ) {
            warn!(
                target: "connsys",
                "initres: sending participant info to iid {} failed, will retry after timeout",
                iid
            );
        }

        self.state_mut(handle).initiator_state = InitiatorState::WaitForSessionReply;
    }

    /// Disconnect, signal the error to the initiator and wait for a new
    /// session.
    fn responder_send_error<S: Stack<InstanceId = I>>(
        &mut self,
        handle: Handle,
        reason: &str,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        debug_assert!(!self.state(handle).self_is_initiator);
        debug_assert_eq!(self.state(handle).responder_state, ResponderState::Connected);

        warn!(
            target: "connsys",
            "initres: disconnect {} because {}",
            self.state(handle).remote_pid.expect("connected has a pid"),
            reason
        );
        self.disconnect_participant(handle, notifier);

        // Keep-alive with message id 0 is the error signal. The send result
        // has no effect on state.
        let header = MsgHeader {
            participant_id: self.self_pid.get(),
            session_id: self.state(handle).active_session_id,
            message_id: 0,
        };
        let iid = self.state(handle).remote_iid;
        if stack.send_keep_alive(iid, header, 0, true) {
            info!(target: "connsys", "initres: sent error to iid {}, {}", iid, header);
        } else {
            warn!(target: "connsys", "initres: failed to send error to iid {}, {}", iid, header);
        }

        let p = self.state_mut(handle);
        p.active_session_id = 0;
        p.responder_state = ResponderState::WaitForSession;
    }

    /// Signal an error for a session this responder does not know. State is
    /// untouched; stale traffic from a peer that moved on is tolerated.
    fn responder_send_error_for_invalid_sid<S: Stack<InstanceId = I>>(
        &mut self,
        handle: Handle,
        session_id: u64,
        stack: &mut S,
    ) {
        debug_assert!(!self.state(handle).self_is_initiator);

        let header = MsgHeader {
            participant_id: self.self_pid.get(),
            session_id,
            message_id: 0,
        };
        let iid = self.state(handle).remote_iid;
        let sent = stack.send_keep_alive(iid, header, 0, true);
        warn!(
            target: "connsys",
            "initres: dropped message with invalid session {} in state {}, expected {}, error send {}",
            session_id,
            self.state(handle).responder_state,
            self.state(handle).active_session_id,
            if sent { "ok" } else { "failed" }
        );
    }

    /// Answer the initiator's session with an own participant info.
    fn responder_send_session_reply<S: Stack<InstanceId = I>>(
        &mut self,
        handle: Handle,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        debug_assert!(!self.state(handle).self_is_initiator);
        debug_assert_ne!(self.state(handle).active_session_id, 0);
        debug_assert!(!self.is_connected(handle));

        self.state_mut(handle).last_sent_message_id = 0;
        let header = self.header_for(handle);
        let (iid, receiver) = {
            let p = self.state(handle);
            (p.remote_iid, p.remote_pid.map(ParticipantId::get).unwrap_or(0))
        };
        info!(
            target: "connsys",
            "initres: session reply to iid {}, {}, state {}",
            iid, header, self.state(handle).responder_state
        );

        if stack.send_participant_info(
            iid,
            header,
            self.protocol_version,
            INITIATOR_RESPONDER_MINOR_PROTOCOL_VERSION,
            self.self_iid,
            receiver,
            0,
            0,
        ) {
            let now = self.clock.local_time();
            let p = self.state_mut(handle);
            p.last_sent_time = now;
            p.responder_state = ResponderState::Connected;
            self.connect_participant(handle, notifier, "session reply");
        } else {
            warn!(
                target: "connsys",
                "initres: failed to send session reply to iid {} for session {}",
                iid,
                self.state(handle).active_session_id
            );
            let p = self.state_mut(handle);
            p.responder_state = ResponderState::WaitForSession;
            p.active_session_id = 0;
        }
    }

    /// A service instance became available. Returns whether this engine is
    /// responsible for the instance.
    pub(crate) fn handle_service_available<S: Stack<InstanceId = I>>(
        &mut self,
        iid: I,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        if self.is_instance_available(iid) {
            return self.is_responsible_for_instance(iid);
        }

        let handle = match self.find_by_iid(iid) {
            Some(handle) => {
                info!(
                    target: "connsys",
                    "initres: instance {} up again, pid {:?}", iid, self.state(handle).remote_pid
                );
                handle
            }
            None => {
                info!(target: "connsys", "initres: new instance {} up", iid);
                self.add_state(None, iid)
            }
        };
        debug_assert!(
            self.state(handle).remote_pid.is_none() || !self.is_connected(handle)
        );
        self.available.insert(iid, handle);

        if self.state(handle).self_is_initiator {
            if self.state(handle).initiator_state == InitiatorState::Invalid {
                // Not responsible until a participant info names the pid.
                info!(
                    target: "connsys",
                    "initres(I): stay in {} for iid {}, no participant info yet",
                    InitiatorState::Invalid, iid
                );
                return false;
            }

            // A fresh session is always started when the service comes up.
            self.initiator_init_session(handle, "service up", stack, notifier);
        } else {
            match self.state(handle).responder_state {
                ResponderState::Invalid => {
                    info!(
                        target: "connsys",
                        "initres(R): stay in {} for iid {}, no participant info yet",
                        ResponderState::Invalid, iid
                    );
                    return false;
                }
                ResponderState::Unavailable => {
                    debug!(
                        target: "connsys",
                        "initres(R): {} -> {} for iid {}",
                        ResponderState::Unavailable, ResponderState::WaitForSession, iid
                    );
                    self.state_mut(handle).responder_state = ResponderState::WaitForSession;
                }
                ResponderState::WaitForUp => {
                    self.responder_send_session_reply(handle, stack, notifier);
                }
                // All other states imply the service was already up.
                state => debug_assert!(false, "unexpected responder state {} on up", state),
            }
        }

        true
    }

    /// A service instance went away. Returns whether this engine was
    /// responsible for the instance.
    pub(crate) fn handle_service_unavailable(
        &mut self,
        iid: I,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        let Some(handle) = self.available.remove(&iid) else {
            return false;
        };

        if self.state(handle).remote_pid.is_none() {
            debug_assert_eq!(self.state(handle).initiator_state, InitiatorState::Invalid);
            debug_assert_eq!(self.state(handle).responder_state, ResponderState::Invalid);
            return false;
        }

        if self.is_connected(handle) {
            info!(
                target: "connsys",
                "initres: disconnect {}, instance {} down",
                self.state(handle).remote_pid.expect("checked above"), iid
            );
            self.disconnect_participant(handle, notifier);
        } else {
            info!(
                target: "connsys",
                "initres: instance {} down, pid {:?} was not connected",
                iid, self.state(handle).remote_pid
            );
        }

        let p = self.state_mut(handle);
        if p.self_is_initiator {
            p.initiator_state = InitiatorState::Unavailable;
        } else {
            p.responder_state = ResponderState::Unavailable;
        }
        p.active_session_id = 0;

        true
    }

    /// Handle a participant info. `last_sent_*` is the legacy engine's
    /// send-state for the sender instance, consulted for the hand-over
    /// direct-connect. Returns whether this engine took the message.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn handle_participant_info<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        minor_protocol_version: u32,
        sender_iid: I,
        last_sent_session_id: u64,
        last_sent_message_id: u64,
        last_sent_time: LocalTime,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        let pid = ParticipantId::new(header.participant_id);

        if !self.is_responsible_for_minor_version(minor_protocol_version) {
            // A peer that downgraded is handed back to the legacy engine.
            if let Some(&handle) = self.known.get(&pid) {
                warn!(
                    target: "connsys",
                    "initres: minor protocol version downgrade for {}, iid {}, hand over",
                    pid, sender_iid
                );
                self.clear_participant_state_for_reuse(handle, notifier);
            }
            return false;
        }

        // One pid on several instances is not supported; drop the message
        // rather than confuse the existing link.
        if let Some(&handle) = self.known.get(&pid) {
            if self.state(handle).remote_iid != sender_iid {
                error!(
                    target: "connsys",
                    "initres: {} used by iid {} but already linked to iid {}, dropping",
                    pid, sender_iid, self.state(handle).remote_iid
                );
                return true;
            }
        }

        // By definition a participant info is the first message of a session.
        if header.message_id != 1 {
            info!(
                target: "connsys",
                "initres: participant info {} with unusual message id, treated as 1", header
            );
        }

        if self.is_self_initiator(sender_iid) {
            self.initiator_participant_info(
                header,
                pid,
                sender_iid,
                last_sent_session_id,
                last_sent_message_id,
                last_sent_time,
                stack,
                notifier,
            );
        } else {
            self.responder_participant_info(header, pid, sender_iid, stack, notifier);
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn initiator_participant_info<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        pid: ParticipantId,
        sender_iid: I,
        last_sent_session_id: u64,
        last_sent_message_id: u64,
        last_sent_time: LocalTime,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        let handle = match self.find_by_iid(sender_iid) {
            Some(handle) => {
                info!(
                    target: "connsys",
                    "initres(I): {} from iid {}, old pid {:?}, session {}, state {}",
                    header,
                    sender_iid,
                    self.state(handle).remote_pid,
                    self.state(handle).active_session_id,
                    self.state(handle).initiator_state
                );
                if let Some(old_pid) = self.state(handle).remote_pid {
                    if old_pid != pid {
                        error!(
                            target: "connsys",
                            "initres(I): pid for iid {} changed from {} to {}, not supported",
                            sender_iid, old_pid, pid
                        );
                        return;
                    }
                }
                handle
            }
            None => {
                info!(
                    target: "connsys",
                    "initres(I): first {} from iid {}", header, sender_iid
                );
                self.add_state(Some(pid), sender_iid)
            }
        };
        debug_assert_eq!(self.state(handle).responder_state, ResponderState::Invalid);

        let service_up = self.is_service_available(handle);
        let now = self.clock.local_time();

        match self.state(handle).initiator_state {
            InitiatorState::Invalid if !service_up => {
                // Store the identity and wait for the service.
                self.state_mut(handle).remote_pid = Some(pid);
                self.known.insert(pid, handle);
                debug!(
                    target: "connsys",
                    "initres(I): {} state {} -> {}",
                    pid, InitiatorState::Invalid, InitiatorState::Unavailable
                );
                self.state_mut(handle).initiator_state = InitiatorState::Unavailable;
            }
            InitiatorState::Invalid => {
                self.state_mut(handle).remote_pid = Some(pid);
                self.known.insert(pid, handle);

                if header.session_id == last_sent_session_id {
                    // The remote replied to the session announced before the
                    // hand-over; take over the counters and connect directly.
                    let p = self.state_mut(handle);
                    p.active_session_id = last_sent_session_id;
                    p.last_sent_message_id = last_sent_message_id;
                    p.last_received_message_id = 1;
                    p.last_sent_time = last_sent_time;
                    p.last_receive_time = now;
                    p.initiator_state = InitiatorState::Connected;
                    self.connect_participant(handle, notifier, "Invalid");
                } else {
                    // Unknown session during startup, open a fresh one.
                    self.initiator_init_session(handle, "new participant info", stack, notifier);
                }
            }
            InitiatorState::Unavailable => {
                debug_assert!(!service_up);
                debug_assert!(!self.is_connected(handle));
                info!(
                    target: "connsys",
                    "initres(I): {} stays in {}", pid, InitiatorState::Unavailable
                );
            }
            InitiatorState::WaitForSessionReply => {
                debug_assert!(service_up);
                debug_assert!(!self.is_connected(handle));

                if header.session_id == self.state(handle).active_session_id {
                    let p = self.state_mut(handle);
                    p.last_received_message_id = 1;
                    p.last_receive_time = now;
                    p.initiator_state = InitiatorState::Connected;
                    self.connect_participant(handle, notifier, "WaitForSessionReply");
                } else {
                    warn!(
                        target: "connsys",
                        "initres(I): ignore unexpected session {} from {}, active {} in state {}",
                        header.session_id,
                        pid,
                        self.state(handle).active_session_id,
                        self.state(handle).initiator_state
                    );
                }
            }
            InitiatorState::Connected => {
                debug_assert!(service_up);
                debug_assert!(self.is_connected(handle));

                if header.session_id == self.state(handle).active_session_id {
                    // A participant info within the active session is always
                    // a protocol violation, whatever it carries.
                    warn!(
                        target: "connsys",
                        "initres(I): disconnect {} because of protocol violation", pid
                    );
                    self.disconnect_participant(handle, notifier);
                    self.initiator_init_session(handle, "protocol violation", stack, notifier);
                } else {
                    warn!(
                        target: "connsys",
                        "initres(I): ignore unexpected session {} from {}, active {} in state {}",
                        header.session_id,
                        pid,
                        self.state(handle).active_session_id,
                        self.state(handle).initiator_state
                    );
                }
            }
        }
    }

    fn responder_participant_info<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        pid: ParticipantId,
        sender_iid: I,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        let handle = match self.find_by_iid(sender_iid) {
            Some(handle) => {
                info!(
                    target: "connsys",
                    "initres(R): {} from iid {}, old pid {:?}, session {}, state {}",
                    header,
                    sender_iid,
                    self.state(handle).remote_pid,
                    self.state(handle).active_session_id,
                    self.state(handle).responder_state
                );
                if let Some(old_pid) = self.state(handle).remote_pid {
                    if old_pid != pid {
                        // Relink the instance to the new identity and start
                        // over from a clean state.
                        error!(
                            target: "connsys",
                            "initres(R): pid for iid {} changed from {} to {}, relinking",
                            sender_iid, old_pid, pid
                        );
                        if self.is_connected(handle) {
                            self.disconnect_participant(handle, notifier);
                        }
                        self.known.remove(&old_pid);
                        let p = self.state_mut(handle);
                        p.responder_state = ResponderState::Invalid;
                        p.active_session_id = 0;
                        p.last_received_message_id = 0;
                        p.last_sent_message_id = 0;
                    }
                }
                handle
            }
            None => {
                info!(
                    target: "connsys",
                    "initres(R): first {} from iid {}", header, sender_iid
                );
                self.add_state(Some(pid), sender_iid)
            }
        };
        debug_assert_eq!(self.state(handle).initiator_state, InitiatorState::Invalid);

        self.state_mut(handle).remote_pid = Some(pid);
        self.known.insert(pid, handle);

        let service_up = self.is_service_available(handle);
        let now = self.clock.local_time();

        let adopt = |this: &mut Self| {
            let p = this.state_mut(handle);
            p.last_receive_time = now;
            p.active_session_id = header.session_id;
            p.last_received_message_id = 1;
            p.last_sent_message_id = 0;
        };

        match self.state(handle).responder_state {
            ResponderState::Invalid if service_up => {
                adopt(&mut *self);
                self.responder_send_session_reply(handle, stack, notifier);
            }
            ResponderState::Invalid | ResponderState::Unavailable | ResponderState::WaitForUp => {
                debug_assert!(!self.is_connected(handle));
                debug_assert!(!service_up);

                // Cannot reply yet, but there is an active session now.
                adopt(&mut *self);
                debug!(
                    target: "connsys",
                    "initres(R): {} state {} -> {}",
                    pid, self.state(handle).responder_state, ResponderState::WaitForUp
                );
                self.state_mut(handle).responder_state = ResponderState::WaitForUp;
            }
            ResponderState::WaitForSession => {
                debug_assert!(!self.is_connected(handle));

                adopt(&mut *self);
                if service_up {
                    self.responder_send_session_reply(handle, stack, notifier);
                } else {
                    self.state_mut(handle).responder_state = ResponderState::WaitForUp;
                }
            }
            ResponderState::Connected => {
                debug_assert!(self.is_connected(handle));
                debug_assert!(service_up);

                // A participant info from the peer is always a new session.
                adopt(&mut *self);
                warn!(
                    target: "connsys",
                    "initres(R): disconnect {} because of new session {}",
                    pid,
                    self.state(handle).active_session_id
                );
                self.disconnect_participant(handle, notifier);
                self.responder_send_session_reply(handle, stack, notifier);
            }
        }
    }

    /// Handle a keep-alive. Returns whether this engine owns the sender.
    pub(crate) fn handle_keep_alive<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        using_previous_message_id: bool,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        let pid = ParticipantId::new(header.participant_id);
        let Some(&handle) = self.known.get(&pid) else {
            return false;
        };

        // Note: the receive timestamp is refreshed on accepted traffic only.
        // Ignored traffic must still run into the receive timeout, which is
        // what reinitializes a session whose opening message was lost.
        let now = self.clock.local_time();

        let expected_mid = if using_previous_message_id {
            self.state(handle).last_received_message_id
        } else {
            self.state(handle).last_received_message_id + 1
        };

        if self.state(handle).self_is_initiator {
            match self.state(handle).initiator_state {
                InitiatorState::Invalid | InitiatorState::Unavailable => {
                    // Nothing to check against, ignore.
                }
                InitiatorState::WaitForSessionReply => {
                    debug_assert!(self.is_service_available(handle));

                    // Only a participant info is valid here; a keep-alive on
                    // the active session means the reply got lost.
                    if header.session_id == self.state(handle).active_session_id {
                        warn!(
                            target: "connsys",
                            "initres(I): unexpected {} in state {}, expected mid {}",
                            header, InitiatorState::WaitForSessionReply, expected_mid
                        );
                        self.initiator_init_session(
                            handle,
                            "keep-alive while waiting for session reply",
                            stack,
                            notifier,
                        );
                    }
                }
                InitiatorState::Connected => {
                    debug_assert!(self.is_service_available(handle));
                    debug_assert!(self.is_connected(handle));
                    debug_assert!(self.state(handle).last_received_message_id > 0);

                    // Invalid session ids are ignored.
                    if header.session_id == self.state(handle).active_session_id {
                        if header.message_id == expected_mid {
                            let p = self.state_mut(handle);
                            p.last_received_message_id = header.message_id;
                            p.last_receive_time = now;
                        } else {
                            let reason = if header.message_id == 0 {
                                warn!(
                                    target: "connsys",
                                    "initres(I): received error {} in state {}",
                                    header, InitiatorState::Connected
                                );
                                "received error"
                            } else {
                                warn!(
                                    target: "connsys",
                                    "initres(I): wrong mid in {} in state {}, expected {}",
                                    header, InitiatorState::Connected, expected_mid
                                );
                                "keep-alive mid mismatch"
                            };
                            self.initiator_init_session(handle, reason, stack, notifier);
                        }
                    }
                }
            }
        } else {
            match self.state(handle).responder_state {
                ResponderState::Invalid | ResponderState::Unavailable => {
                    // Nothing to check against, ignore.
                }
                ResponderState::WaitForSession => {
                    // Every session is wrong here; replying with an error
                    // speeds up recovery when the initiator's participant
                    // info got lost.
                    self.responder_send_error_for_invalid_sid(handle, header.session_id, stack);
                }
                ResponderState::WaitForUp => {
                    debug_assert!(!self.is_service_available(handle));

                    if header.session_id == self.state(handle).active_session_id
                        && header.message_id == expected_mid
                    {
                        let p = self.state_mut(handle);
                        p.last_received_message_id = header.message_id;
                        p.last_receive_time = now;
                    } else {
                        warn!(
                            target: "connsys",
                            "initres(R): invalid {} in state {}, expected sid {}, mid {}",
                            header,
                            ResponderState::WaitForUp,
                            self.state(handle).active_session_id,
                            expected_mid
                        );
                        let p = self.state_mut(handle);
                        p.active_session_id = 0;
                        p.responder_state = ResponderState::Unavailable;
                    }
                }
                ResponderState::Connected => {
                    debug_assert!(self.is_service_available(handle));
                    debug_assert!(self.is_connected(handle));

                    if header.session_id == self.state(handle).active_session_id
                        && header.message_id == expected_mid
                    {
                        let p = self.state_mut(handle);
                        p.last_received_message_id = header.message_id;
                        p.last_receive_time = now;
                    } else if header.session_id == self.state(handle).active_session_id {
                        warn!(
                            target: "connsys",
                            "initres(R): invalid {} in state {}, expected sid {}, mid {}",
                            header,
                            ResponderState::Connected,
                            self.state(handle).active_session_id,
                            expected_mid
                        );
                        self.responder_send_error(handle, "mid mismatch", stack, notifier);
                    } else {
                        // Stale session, signal it but keep the connection.
                        self.responder_send_error_for_invalid_sid(
                            handle,
                            header.session_id,
                            stack,
                        );
                    }
                }
            }
        }

        true
    }

    /// Check the header of a received application message.
    pub(crate) fn process_received_message_header<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> RecvOutcome {
        let pid = ParticipantId::new(header.participant_id);
        if !self.started || !self.known.contains_key(&pid) {
            return RecvOutcome::NotResponsible;
        }
        let handle = *self.known.get(&pid).expect("checked above");

        let now = self.clock.local_time();
        let expected_mid = self.state(handle).last_received_message_id + 1;

        if self.state(handle).self_is_initiator {
            debug_assert_eq!(self.state(handle).responder_state, ResponderState::Invalid);

            match self.state(handle).initiator_state {
                InitiatorState::Connected => {
                    debug_assert!(self.is_service_available(handle));
                    debug_assert!(self.is_connected(handle));

                    if header.session_id == self.state(handle).active_session_id {
                        if header.message_id == expected_mid {
                            let p = self.state_mut(handle);
                            p.last_received_message_id = header.message_id;
                            p.last_receive_time = now;
                            return RecvOutcome::Deliver(pid);
                        }
                        warn!(
                            target: "connsys",
                            "initres(I): received {} with invalid mid, expected {}",
                            header, expected_mid
                        );
                        self.initiator_init_session(handle, "mid mismatch", stack, notifier);
                    }
                    // Invalid session ids are ignored.
                }
                InitiatorState::WaitForSessionReply => {
                    debug_assert!(self.is_service_available(handle));
                    debug_assert!(!self.is_connected(handle));

                    // Any message on the active session is an error here.
                    if header.session_id == self.state(handle).active_session_id {
                        warn!(
                            target: "connsys",
                            "initres(I): unexpected {} in state {}",
                            header, InitiatorState::WaitForSessionReply
                        );
                        self.initiator_init_session(handle, "mid mismatch", stack, notifier);
                    }
                }
                InitiatorState::Invalid | InitiatorState::Unavailable => {}
            }
        } else {
            debug_assert_eq!(self.state(handle).initiator_state, InitiatorState::Invalid);

            match self.state(handle).responder_state {
                ResponderState::Connected => {
                    debug_assert!(self.is_service_available(handle));
                    debug_assert!(self.is_connected(handle));

                    if header.session_id == self.state(handle).active_session_id {
                        if header.message_id == expected_mid {
                            let p = self.state_mut(handle);
                            p.last_received_message_id = header.message_id;
                            p.last_receive_time = now;
                            return RecvOutcome::Deliver(pid);
                        }
                        warn!(
                            target: "connsys",
                            "initres(R): received {} with invalid mid, expected {}",
                            header, expected_mid
                        );
                        self.responder_send_error(handle, "mid mismatch", stack, notifier);
                    } else {
                        self.responder_send_error_for_invalid_sid(
                            handle,
                            header.session_id,
                            stack,
                        );
                    }
                }
                ResponderState::WaitForSession => {
                    self.responder_send_error_for_invalid_sid(handle, header.session_id, stack);
                }
                ResponderState::WaitForUp => {
                    // Cannot connect directly on up after unexpected traffic.
                    warn!(
                        target: "connsys",
                        "initres(R): unexpected {} in state {}, change to {}",
                        header, ResponderState::WaitForUp, ResponderState::Unavailable
                    );
                    let p = self.state_mut(handle);
                    p.active_session_id = 0;
                    p.responder_state = ResponderState::Unavailable;
                }
                ResponderState::Invalid | ResponderState::Unavailable => {}
            }
        }

        RecvOutcome::Dropped
    }

    fn state_for_sending(&self, to: ParticipantId) -> Result<Handle, SendError> {
        if !self.started {
            return Err(SendError::NotStarted);
        }
        if let Some(&handle) = self.connected.get(&to) {
            Ok(handle)
        } else if self.known.contains_key(&to) {
            Err(SendError::NotConnected(to))
        } else {
            Err(SendError::UnknownParticipant(to))
        }
    }

    fn handle_send_result<S: Stack<InstanceId = I>>(
        &mut self,
        handle: Handle,
        ok: bool,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        debug_assert!(self.is_connected(handle));

        if ok {
            let now = self.clock.local_time();
            self.state_mut(handle).last_sent_time = now;
            return true;
        }

        if self.state(handle).self_is_initiator {
            self.initiator_init_session(handle, "sending failed", stack, notifier);
        } else {
            self.responder_send_error(handle, "sending failed", stack, notifier);
        }
        false
    }

    pub(crate) fn send_unicast<S, F>(
        &mut self,
        to: ParticipantId,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
        send: F,
    ) -> Result<(), SendError>
    where
        S: Stack<InstanceId = I>,
        F: FnOnce(&mut S, I, MsgHeader) -> bool,
    {
        let handle = self.state_for_sending(to).map_err(|e| {
            error!(target: "connsys", "initres: {}", e);
            e
        })?;
        let header = self.header_for(handle);
        let iid = self.state(handle).remote_iid;
        let sent = send(&mut *stack, iid, header);
        if self.handle_send_result(handle, sent, stack, notifier) {
            Ok(())
        } else {
            Err(SendError::Transport(to))
        }
    }

    pub(crate) fn send_broadcast<S, F>(
        &mut self,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
        send: &mut F,
    ) where
        S: Stack<InstanceId = I>,
        F: FnMut(&mut S, I, MsgHeader) -> bool,
    {
        // Iterate over available instances; connected membership can change
        // when an earlier send fails.
        let targets: Vec<Handle> = self.available.values().copied().collect();
        for handle in targets {
            if !self.is_connected(handle) {
                continue;
            }
            let header = self.header_for(handle);
            let iid = self.state(handle).remote_iid;
            let sent = send(&mut *stack, iid, header);
            self.handle_send_result(handle, sent, stack, notifier);
        }
    }

    /// One pass of the periodic worker over this engine's peers.
    pub(crate) fn do_thread_loop<S: Stack<InstanceId = I>>(
        &mut self,
        now: LocalTime,
        keep_alive_interval: LocalDuration,
        keep_alive_timeout: LocalDuration,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> LocalTime {
        debug_assert!(!keep_alive_interval.is_zero());
        debug_assert!(keep_alive_interval < keep_alive_timeout);

        let mut next_wakeup = now + keep_alive_interval;

        for index in 0..self.states.len() {
            let handle = Handle(index);

            // Receive timeouts.
            if self.state(handle).last_receive_time + keep_alive_timeout <= now {
                let p = self.state(handle);
                match (p.initiator_state, p.responder_state) {
                    (InitiatorState::WaitForSessionReply | InitiatorState::Connected, _) => {
                        warn!(
                            target: "connsys",
                            "initres(I): receive timeout from {:?} in state {}, last receive {} ago",
                            p.remote_pid, p.initiator_state, now - p.last_receive_time
                        );
                        self.initiator_init_session(handle, "receive timeout", stack, notifier);
                    }
                    (_, ResponderState::WaitForUp) => {
                        warn!(
                            target: "connsys",
                            "initres(R): receive timeout from {:?} in state {}, change to {}",
                            p.remote_pid, p.responder_state, ResponderState::Unavailable
                        );
                        let p = self.state_mut(handle);
                        p.active_session_id = 0;
                        p.responder_state = ResponderState::Unavailable;
                    }
                    (_, ResponderState::Connected) => {
                        warn!(
                            target: "connsys",
                            "initres(R): receive timeout from {:?} in state {}",
                            p.remote_pid, p.responder_state
                        );
                        self.responder_send_error(handle, "receive timeout", stack, notifier);
                    }
                    _ => {}
                }
            }

            // Wake up again when the next receive timeout could fire.
            {
                let p = self.state(handle);
                if matches!(
                    p.initiator_state,
                    InitiatorState::WaitForSessionReply | InitiatorState::Connected
                ) || matches!(
                    p.responder_state,
                    ResponderState::WaitForUp | ResponderState::Connected
                ) {
                    next_wakeup = next_wakeup.min(p.last_receive_time + keep_alive_timeout);
                }
            }

            // Periodic sending. A peer waiting for the session reply also
            // gets keep-alives: when the announcement was lost the responder
            // answers them with an error, which reinitializes the session
            // much faster than the receive timeout.
            let p = self.state(handle);
            if matches!(
                p.initiator_state,
                InitiatorState::WaitForSessionReply | InitiatorState::Connected
            ) || matches!(p.responder_state, ResponderState::Connected)
            {
                debug_assert!(p.remote_pid.is_some());
                debug_assert!(self.is_service_available(handle));

                if p.last_sent_time + keep_alive_interval <= now {
                    // Keep-alives repeat the last sent message id.
                    let header = MsgHeader {
                        participant_id: self.self_pid.get(),
                        session_id: p.active_session_id,
                        message_id: p.last_sent_message_id,
                    };
                    let iid = p.remote_iid;
                    if stack.send_keep_alive(iid, header, 0, true) {
                        trace!(
                            target: "connsys",
                            "initres: sent keep-alive to iid {} {}", iid, header
                        );
                    } else {
                        // A failed keep-alive alone must not drop the
                        // connection.
                        warn!(
                            target: "connsys",
                            "initres: failed to send keep-alive to iid {} {}", iid, header
                        );
                    }

                    // Updated even on failure to avoid flooding.
                    self.state_mut(handle).last_sent_time = now;
                }

                next_wakeup =
                    next_wakeup.min(self.state(handle).last_sent_time + keep_alive_interval);
            }
        }

        next_wakeup
    }

    /// Forget everything about a participant so another engine can claim it.
    fn clear_participant_state_for_reuse(
        &mut self,
        handle: Handle,
        notifier: &ConnectionStatusNotifier,
    ) {
        let pid = self.state(handle).remote_pid.expect("known record has a pid");
        debug_assert!(self.known.contains_key(&pid));

        if self.is_connected(handle) {
            self.disconnect_participant(handle, notifier);
        }
        self.known.remove(&pid);

        let p = self.state_mut(handle);
        p.remote_pid = None;
        p.last_sent_time = LocalTime::default();
        p.last_receive_time = LocalTime::default();
        p.active_session_id = 0;
        p.last_sent_message_id = 0;
        p.last_received_message_id = 0;
        p.initiator_state = InitiatorState::Invalid;
        p.responder_state = ResponderState::Invalid;
    }

    pub(crate) fn participant_state(&self, iid: I) -> Option<&ParticipantState<I>> {
        self.find_by_iid(iid).map(|h| self.state(h))
    }

    pub(crate) fn write_state(&self, out: &mut String) {
        use std::fmt::Write;

        for p in &self.states {
            let avail = if self.available.contains_key(&p.remote_iid) { "+" } else { "-" };
            let _ = write!(
                out,
                "\n  - initres {:?}/{}{} ",
                p.remote_pid, p.remote_iid, avail
            );
            if p.self_is_initiator {
                let _ = write!(out, "I/{}", p.initiator_state);
            } else {
                let _ = write!(out, "R/{}", p.responder_state);
            }
            let _ = write!(
                out,
                " sid:{} recv-mid:{} sent-mid:{}",
                p.active_session_id, p.last_received_message_id, p.last_sent_message_id
            );
        }
    }
}
