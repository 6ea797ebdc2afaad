//! Engine for peers on minor protocol version 0.
//!
//! A single combined state machine without explicit roles: both sides may
//! open a session by sending a participant-info, and both sides detect lost
//! messages through the per-session counters. Reconnection ping-pong on
//! simultaneous session changes is broken by the one-shot
//! `skip_send_pinfo_on_next_mismatch` flag.
//!
//! This engine also bootstraps fresh peers: when a service instance comes up
//! and no protocol version is known for it yet, it announces the local
//! participant by sending a participant-info right away.
use std::collections::HashMap;

use tracing::{debug, error, info, trace, warn};

use crate::common::time::{Clock, LocalDuration, LocalTime};
use crate::error::SendError;
use crate::notifier::{ConnectionStatus, ConnectionStatusNotifier};
use crate::stack::{InstanceId, Stack};
use crate::wire::{MsgHeader, ParticipantId};

use super::Handle;

/// Per-peer record of the legacy engine.
#[derive(Debug)]
pub(crate) struct PeerState<I> {
    pub(crate) pid: Option<ParticipantId>,
    pub(crate) iid: I,

    pub(crate) send_session_id: u64,
    /// Next message id to send within the current session.
    pub(crate) send_message_id: u64,
    pub(crate) last_sent: LocalTime,

    /// Zero while open for a new session from the remote.
    pub(crate) expected_recv_session_id: u64,
    pub(crate) expected_recv_message_id: u64,
    pub(crate) last_recv: LocalTime,

    /// One-shot flag, reset on every received participant-info. When set,
    /// the next counter mismatch on a received participant-info keeps the
    /// previously announced session instead of sending a new one.
    pub(crate) skip_send_pinfo_on_next_mismatch: bool,
}

pub(crate) struct LegacyEngine<I, C> {
    self_pid: ParticipantId,
    self_iid: I,
    protocol_version: u16,
    announced_minor_version: u32,

    states: Vec<PeerState<I>>,
    known: HashMap<ParticipantId, Handle>,
    connected: HashMap<ParticipantId, Handle>,
    available: HashMap<I, Handle>,

    rng: fastrand::Rng,
    clock: C,
}

impl<I: InstanceId, C: Clock> LegacyEngine<I, C> {
    pub(crate) fn new(
        self_pid: ParticipantId,
        self_iid: I,
        protocol_version: u16,
        announced_minor_version: u32,
        rng: fastrand::Rng,
        clock: C,
    ) -> Self {
        Self {
            self_pid,
            self_iid,
            protocol_version,
            announced_minor_version,
            states: Vec::new(),
            known: HashMap::new(),
            connected: HashMap::new(),
            available: HashMap::new(),
            rng,
            clock,
        }
    }

    fn add_state(&mut self, pid: Option<ParticipantId>, iid: I) -> Handle {
        let now = self.clock.local_time();
        let handle = Handle(self.states.len());
        self.states.push(PeerState {
            pid,
            iid,
            send_session_id: self.rng.u64(1..=u64::MAX),
            send_message_id: 1,
            last_sent: now,
            expected_recv_session_id: 0,
            expected_recv_message_id: 1,
            last_recv: now,
            skip_send_pinfo_on_next_mismatch: false,
        });
        handle
    }

    fn find_by_iid(&self, iid: I) -> Option<Handle> {
        self.states
            .iter()
            .position(|p| p.iid == iid)
            .map(Handle)
    }

    fn state(&self, handle: Handle) -> &PeerState<I> {
        &self.states[handle.index()]
    }

    fn state_mut(&mut self, handle: Handle) -> &mut PeerState<I> {
        &mut self.states[handle.index()]
    }

    /// Start a new send session with a random session id. The remote is
    /// expected to open a new session too, unless nothing but the session
    /// opener was ever sent.
    fn init_new_session(&mut self, handle: Handle) {
        let session = self.rng.u64(1..=u64::MAX);
        let p = self.state_mut(handle);
        if p.send_message_id > 1 {
            p.expected_recv_message_id = 1;
            p.expected_recv_session_id = 0;
        }
        p.send_message_id = 1;
        p.send_session_id = session;
    }

    fn header_for(&self, handle: Handle) -> MsgHeader {
        let p = self.state(handle);
        MsgHeader {
            participant_id: self.self_pid.get(),
            session_id: p.send_session_id,
            message_id: p.send_message_id,
        }
    }

    fn handle_send_result(
        &mut self,
        handle: Handle,
        ok: bool,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        if ok {
            let now = self.clock.local_time();
            let p = self.state_mut(handle);
            p.send_message_id += 1;
            p.last_sent = now;
            return true;
        }

        if let Some(pid) = self.state(handle).pid {
            if self.connected.remove(&pid).is_some() {
                warn!(
                    target: "connsys",
                    "legacy: disconnect {} because sending failed", pid
                );
                notifier.notify(pid, ConnectionStatus::NotConnected);
            } else {
                warn!(target: "connsys", "legacy: sending to {} failed", pid);
            }
        }

        // The frame is lost for good, only a new session can recover.
        self.init_new_session(handle);
        false
    }

    fn try_send_participant_info<S: Stack<InstanceId = I>>(
        &mut self,
        handle: Handle,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> bool {
        debug_assert!(self.available.contains_key(&self.state(handle).iid));

        let header = self.header_for(handle);
        let (iid, receiver) = {
            let p = self.state(handle);
            (p.iid, p.pid.map(ParticipantId::get).unwrap_or(0))
        };
        info!(
            target: "connsys",
            "legacy: send participant info to iid {}, receiver pid {}, {}",
            iid, receiver, header
        );
        let sent = stack.send_participant_info(
            iid,
            header,
            self.protocol_version,
            self.announced_minor_version,
            self.self_iid,
            receiver,
            0,
            0,
        );
        let result = self.handle_send_result(handle, sent, notifier);

        // Record the send timestamp even on failure to prevent flooding.
        if !result {
            let now = self.clock.local_time();
            self.state_mut(handle).last_sent = now;
        }
        result
    }

    fn connect_participant(
        &mut self,
        handle: Handle,
        notifier: &ConnectionStatusNotifier,
    ) {
        let pid = self.state(handle).pid.expect("connecting requires a pid");
        info!(
            target: "connsys",
            "legacy: connected {} on iid {}", pid, self.state(handle).iid
        );
        self.connected.insert(pid, handle);
        notifier.notify(pid, ConnectionStatus::Connected);
    }

    /// A service instance became available. With `announce` the local
    /// participant info is sent right away to bootstrap the handshake.
    pub(crate) fn service_available<S: Stack<InstanceId = I>>(
        &mut self,
        iid: I,
        announce: bool,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        if self.available.contains_key(&iid) {
            return;
        }

        let handle = match self.find_by_iid(iid) {
            Some(handle) => {
                info!(
                    target: "connsys",
                    "legacy: instance {} up again, pid {:?}", iid, self.state(handle).pid
                );
                handle
            }
            None => {
                info!(target: "connsys", "legacy: new instance {} up", iid);
                self.add_state(None, iid)
            }
        };
        self.available.insert(iid, handle);

        if !announce {
            return;
        }

        if self.try_send_participant_info(handle, stack, notifier) {
            // Become connected right away when a session from the remote was
            // already adopted while the service was down.
            if self.state(handle).expected_recv_session_id != 0 {
                self.connect_participant(handle, notifier);
            }
        }
    }

    pub(crate) fn service_unavailable(&mut self, iid: I, notifier: &ConnectionStatusNotifier) {
        let Some(handle) = self.available.remove(&iid) else {
            return;
        };

        // Start over when the instance comes back.
        self.init_new_session(handle);

        if let Some(pid) = self.state(handle).pid {
            if self.connected.remove(&pid).is_some() {
                info!(target: "connsys", "legacy: disconnect {}, instance {} down", pid, iid);
                notifier.notify(pid, ConnectionStatus::NotConnected);
            } else {
                info!(
                    target: "connsys",
                    "legacy: instance {} down, pid {} was not connected", iid, pid
                );
            }
        }
    }

    /// Handle a participant-info addressed to this engine. Header contents
    /// have already been validated by the dispatcher.
    pub(crate) fn handle_participant_info<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        sender_iid: I,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        let pid = ParticipantId::new(header.participant_id);
        let now = self.clock.local_time();

        // Locate the peer record: by pid, by available instance, by instance
        // seen earlier, or create one.
        let handle = if let Some(&handle) = self.known.get(&pid) {
            self.state_mut(handle).last_recv = now;

            if self.state(handle).iid != sender_iid {
                let prev_up = self.available.contains_key(&self.state(handle).iid);
                let new_up = self.available.contains_key(&sender_iid);
                error!(
                    target: "connsys",
                    "legacy: {} changed from iid {} (up:{}) to iid {} (up:{}), not supported",
                    pid, self.state(handle).iid, prev_up, sender_iid, new_up
                );
                return;
            }
            debug!(target: "connsys", "legacy: participant info again from {}/{}", pid, sender_iid);
            handle
        } else if let Some(&handle) = self.available.get(&sender_iid) {
            if let Some(old_pid) = self.state(handle).pid {
                // The instance now has a new pid; known pids take the branch
                // above, so the old link must be dropped.
                warn!(
                    target: "connsys",
                    "legacy: iid {} changed from {} to {}", sender_iid, old_pid, pid
                );
                if self.connected.remove(&old_pid).is_some() {
                    warn!(
                        target: "connsys",
                        "legacy: disconnect {} because instance changed pid", old_pid
                    );
                    notifier.notify(old_pid, ConnectionStatus::NotConnected);
                }
                self.known.remove(&old_pid);
                self.state_mut(handle).pid = None;
            }

            info!(target: "connsys", "legacy: iid {} now linked to {}", sender_iid, pid);
            self.known.insert(pid, handle);
            let p = self.state_mut(handle);
            p.pid = Some(pid);
            p.last_recv = now;
            handle
        } else {
            let handle = match self.find_by_iid(sender_iid) {
                Some(handle) => {
                    // Service was up once but currently is not.
                    info!(
                        target: "connsys",
                        "legacy: reuse record for unavailable iid {}", sender_iid
                    );
                    if let Some(old_pid) = self.state(handle).pid {
                        if old_pid != pid {
                            self.known.remove(&old_pid);
                        }
                    }
                    let p = self.state_mut(handle);
                    p.pid = Some(pid);
                    p.last_recv = now;
                    handle
                }
                None => {
                    info!(
                        target: "connsys",
                        "legacy: new record for {}, iid {}", pid, sender_iid
                    );
                    self.add_state(Some(pid), sender_iid)
                }
            };
            self.known.insert(pid, handle);
            handle
        };

        // The skip flag is one-shot; every received pinfo resets it.
        let prev_skip = self.state(handle).skip_send_pinfo_on_next_mismatch;
        self.state_mut(handle).skip_send_pinfo_on_next_mismatch = false;

        let expected_sid = self.state(handle).expected_recv_session_id;
        let expected_mid = self.state(handle).expected_recv_message_id;

        if expected_sid == 0 && expected_mid == 1 && header.message_id == 1 {
            // Open for a new session and the message starts one.
            {
                let p = self.state_mut(handle);
                p.expected_recv_session_id = header.session_id;
                p.expected_recv_message_id += 1;
            }

            if !self.available.contains_key(&sender_iid) {
                info!(
                    target: "connsys",
                    "legacy: initial participant info from {} but iid {} not up", pid, sender_iid
                );
            } else if self.state(handle).send_message_id <= 1 {
                info!(
                    target: "connsys",
                    "legacy: initial participant info from {} but own send to iid {} did not succeed yet",
                    pid, sender_iid
                );
            } else {
                self.connect_participant(handle, notifier);
            }
        } else if expected_sid == header.session_id && expected_mid == header.message_id {
            debug!(target: "connsys", "legacy: valid participant info from {}", pid);
            self.state_mut(handle).expected_recv_message_id += 1;
        } else {
            warn!(
                target: "connsys",
                "legacy: counter mismatch from {}, expected {}:{}, got {}:{}",
                pid, expected_sid, expected_mid, header.session_id, header.message_id
            );

            if self.connected.remove(&pid).is_some() {
                warn!(target: "connsys", "legacy: disconnect {}", pid);
                notifier.notify(pid, ConnectionStatus::NotConnected);
            }

            let prev_send_session_id = self.state(handle).send_session_id;
            let prev_send_message_id = self.state(handle).send_message_id;
            self.init_new_session(handle);

            if !self.available.contains_key(&sender_iid) {
                info!(
                    target: "connsys",
                    "legacy: new session for {} but iid {} not up", pid, sender_iid
                );
            } else {
                if prev_skip && prev_send_message_id == 2 {
                    // Assume the previously announced session reached the
                    // remote and is treated as valid there; answering with
                    // yet another session would ping-pong forever.
                    warn!(
                        target: "connsys",
                        "legacy: skip sending participant info to {}, keep session {}:{}",
                        pid, prev_send_session_id, prev_send_message_id
                    );
                    let p = self.state_mut(handle);
                    p.send_session_id = prev_send_session_id;
                    p.send_message_id = prev_send_message_id;
                } else {
                    if prev_skip {
                        warn!(
                            target: "connsys",
                            "legacy: will not skip participant info to {}, data was already sent in session {}:{}",
                            pid, prev_send_session_id, prev_send_message_id
                        );
                    }
                    if !self.try_send_participant_info(handle, stack, notifier) {
                        info!(
                            target: "connsys",
                            "legacy: new session for {} but sending participant info failed", pid
                        );
                        return;
                    }
                    self.state_mut(handle).skip_send_pinfo_on_next_mismatch = true;
                }

                // Only a participant info may start a session, so the
                // expected counters are taken over here.
                {
                    let p = self.state_mut(handle);
                    p.expected_recv_session_id = header.session_id;
                    p.expected_recv_message_id += 1;
                }
                self.connect_participant(handle, notifier);
            }
        }
    }

    /// Common checks for non-participant-info messages. Refreshes the
    /// receive timestamp of a known sender even when the content is invalid.
    fn process_generic(&mut self, header: MsgHeader, caller: &str) -> Option<Handle> {
        let pid = ParticipantId::new(header.participant_id);
        let Some(&handle) = self.known.get(&pid) else {
            warn!(target: "connsys", "legacy: got {} from unknown {}", caller, pid);
            return None;
        };

        let now = self.clock.local_time();
        trace!(
            target: "connsys",
            "legacy: refresh last receive time for {} at {}", pid, now
        );
        self.state_mut(handle).last_recv = now;

        if header.session_id == 0 {
            error!(
                target: "connsys",
                "legacy: received impossible session id 0 from {}", pid
            );
            return None;
        }
        if header.message_id <= 1 {
            error!(
                target: "connsys",
                "legacy: received impossible message id {} on {} from {}",
                header.message_id, caller, pid
            );
            return None;
        }
        Some(handle)
    }

    pub(crate) fn handle_keep_alive<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) {
        let Some(handle) = self.process_generic(header, "keep-alive") else {
            return;
        };

        let p = self.state(handle);
        if header.session_id == p.expected_recv_session_id
            && header.message_id == p.expected_recv_message_id
        {
            self.state_mut(handle).expected_recv_message_id += 1;
            return;
        }

        let pid = self.state(handle).pid.expect("known record has a pid");
        warn!(
            target: "connsys",
            "legacy: keep-alive counter mismatch from {}, expected {}:{}, got {}:{}",
            pid,
            self.state(handle).expected_recv_session_id,
            self.state(handle).expected_recv_message_id,
            header.session_id,
            header.message_id
        );

        if self.connected.remove(&pid).is_some() {
            notifier.notify(pid, ConnectionStatus::NotConnected);
        }
        self.init_new_session(handle);
        if self.available.contains_key(&self.state(handle).iid) {
            self.try_send_participant_info(handle, stack, notifier);
        }
    }

    /// Check the header of a received application message. Returns the
    /// sending participant when the message should be delivered.
    pub(crate) fn process_received_message_header<S: Stack<InstanceId = I>>(
        &mut self,
        header: MsgHeader,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
    ) -> Option<ParticipantId> {
        let handle = self.process_generic(header, "message")?;
        let pid = self.state(handle).pid.expect("known record has a pid");

        if !self.connected.contains_key(&pid) {
            warn!(
                target: "connsys",
                "legacy: ignore message from not connected {} {}", pid, header
            );
            return None;
        }
        debug_assert_ne!(self.state(handle).expected_recv_session_id, 0);

        let p = self.state(handle);
        if header.session_id == p.expected_recv_session_id
            && header.message_id == p.expected_recv_message_id
        {
            self.state_mut(handle).expected_recv_message_id += 1;
            return Some(pid);
        }

        warn!(
            target: "connsys",
            "legacy: message counter mismatch from {}, expected {}:{}, got {}:{}",
            pid,
            p.expected_recv_session_id,
            p.expected_recv_message_id,
            header.session_id,
            header.message_id
        );

        self.connected.remove(&pid);
        notifier.notify(pid, ConnectionStatus::NotConnected);
        self.init_new_session(handle);
        self.try_send_participant_info(handle, stack, notifier);
        None
    }

    fn state_for_sending(&self, to: ParticipantId) -> Result<Handle, SendError> {
        if let Some(&handle) = self.connected.get(&to) {
            Ok(handle)
        } else if self.known.contains_key(&to) {
            Err(SendError::NotConnected(to))
        } else {
            Err(SendError::UnknownParticipant(to))
        }
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
            error!(target: "connsys", "legacy: {}", e);
            e
        })?;
        let header = self.header_for(handle);
        let iid = self.state(handle).iid;
        let sent = send(stack, iid, header);
        if self.handle_send_result(handle, sent, notifier) {
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
            let Some(pid) = self.state(handle).pid else {
                continue;
            };
            if !self.connected.contains_key(&pid) {
                continue;
            }
            let header = self.header_for(handle);
            let iid = self.state(handle).iid;
            let sent = send(&mut *stack, iid, header);
            self.handle_send_result(handle, sent, notifier);
        }
    }

    /// One pass of the periodic worker over this engine's peers. Instances
    /// for which `skip` returns true are owned by the other engine.
    pub(crate) fn do_thread_loop<S, P>(
        &mut self,
        now: LocalTime,
        keep_alive_interval: LocalDuration,
        keep_alive_timeout: LocalDuration,
        stack: &mut S,
        notifier: &ConnectionStatusNotifier,
        skip: P,
    ) -> LocalTime
    where
        S: Stack<InstanceId = I>,
        P: Fn(I) -> bool,
    {
        let mut next_wakeup = now + keep_alive_interval;

        let entries: Vec<(I, Handle)> = self.available.iter().map(|(i, h)| (*i, *h)).collect();
        for (iid, handle) in entries {
            if skip(iid) {
                continue;
            }

            // Receive timeout for connected peers.
            if let Some(pid) = self.state(handle).pid {
                if self.connected.contains_key(&pid) {
                    let last_recv = self.state(handle).last_recv;
                    if last_recv + keep_alive_timeout <= now {
                        warn!(
                            target: "connsys",
                            "legacy: disconnect {} because last receive was {} ago",
                            pid, now - last_recv
                        );
                        self.connected.remove(&pid);
                        notifier.notify(pid, ConnectionStatus::NotConnected);
                        self.init_new_session(handle);
                    } else {
                        next_wakeup = next_wakeup.min(last_recv + keep_alive_timeout);
                    }
                }
            }

            // Periodic sending.
            if self.state(handle).last_sent + keep_alive_interval <= now {
                if self.state(handle).send_message_id == 1 {
                    // The session opener never went out, try again.
                    warn!(
                        target: "connsys",
                        "legacy: try to recover connection to iid {}, pid {:?}",
                        iid, self.state(handle).pid
                    );
                    if self.try_send_participant_info(handle, stack, notifier)
                        && self.state(handle).expected_recv_session_id != 0
                    {
                        self.connect_participant(handle, notifier);
                    }
                } else {
                    trace!(target: "connsys", "legacy: send keep-alive to iid {}", iid);
                    let header = self.header_for(handle);
                    let sent = stack.send_keep_alive(iid, header, 0, false);
                    self.handle_send_result(handle, sent, notifier);
                }
            }
            next_wakeup = next_wakeup.min(self.state(handle).last_sent + keep_alive_interval);
        }

        next_wakeup
    }

    /// Send-state of the instance, used when the initiator/responder engine
    /// takes over a peer: `(session id, last sent message id, last sent)`.
    pub(crate) fn send_state_for_handover(&self, iid: I) -> (u64, u64, LocalTime) {
        match self.find_by_iid(iid) {
            Some(handle) => {
                let p = self.state(handle);
                (
                    p.send_session_id,
                    p.send_message_id.saturating_sub(1),
                    p.last_sent,
                )
            }
            None => (0, 0, LocalTime::default()),
        }
    }

    pub(crate) fn knows_participant(&self, pid: ParticipantId) -> bool {
        self.known.contains_key(&pid)
    }

    /// Drop the claim on a participant that moved to the
    /// initiator/responder protocol.
    pub(crate) fn release_participant(
        &mut self,
        pid: ParticipantId,
        notifier: &ConnectionStatusNotifier,
    ) {
        let Some(handle) = self.known.remove(&pid) else {
            return;
        };
        warn!(
            target: "connsys",
            "legacy: hand over {} to the initiator/responder protocol", pid
        );
        if self.connected.remove(&pid).is_some() {
            notifier.notify(pid, ConnectionStatus::NotConnected);
        }
        let p = self.state_mut(handle);
        p.expected_recv_session_id = 0;
        p.expected_recv_message_id = 1;
        self.init_new_session(handle);
    }

    /// Emit NotConnected for every connected peer and forget all state.
    pub(crate) fn shutdown(&mut self, notifier: &ConnectionStatusNotifier) {
        let connected: Vec<ParticipantId> = self.connected.keys().copied().collect();
        for pid in connected {
            notifier.notify(pid, ConnectionStatus::NotConnected);
        }
        self.known.clear();
        self.connected.clear();
        self.available.clear();
        self.states.clear();
    }

    #[cfg(test)]
    pub(crate) fn participant_state(&self, iid: I) -> Option<&PeerState<I>> {
        self.find_by_iid(iid).map(|h| self.state(h))
    }

    pub(crate) fn write_state(&self, out: &mut String) {
        use std::fmt::Write;

        for p in &self.states {
            let avail = if self.available.contains_key(&p.iid) { "+" } else { "-" };
            let status = match p.pid {
                Some(pid) if self.connected.contains_key(&pid) => "conn",
                Some(_) => "known",
                None => "anon",
            };
            let _ = write!(
                out,
                "\n  - legacy {:?}/{}{} {} send {}:{} recv {}:{}",
                p.pid,
                p.iid,
                avail,
                status,
                p.send_session_id,
                p.send_message_id,
                p.expected_recv_session_id,
                p.expected_recv_message_id
            );
        }
    }
}
