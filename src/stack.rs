//! The transport capability required by the connection system.
use std::fmt;
use std::hash::Hash;

use crate::wire::MsgHeader;

/// Transport-level address of a service instance.
///
/// Instance ids are ordered; the ordering decides the handshake role of a
/// peer pair (the smaller id is always the responder). An id may change when
/// a peer restarts, unlike the participant id.
pub trait InstanceId: Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display {}

impl<T> InstanceId for T where T: Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display {}

/// What the connection system requires of its transport stack.
///
/// The stack delivers incoming traffic by calling back into the owning
/// [`ConnectionSystem`](crate::ConnectionSystem) under the framework lock;
/// this trait covers the outgoing direction plus lifecycle.
///
/// Send primitives return `false` when the message could not be handed to
/// the transport. The connection system treats that as a local disconnect
/// trigger and recovers on its own; it never retries a frame.
pub trait Stack {
    /// Address type used by this transport.
    type InstanceId: InstanceId;

    /// Bring the transport up.
    fn connect(&mut self) -> bool;

    /// Tear the transport down.
    fn disconnect(&mut self) -> bool;

    /// The service instance id of this side. Immutable for the lifetime of
    /// the stack.
    fn service_instance_id(&self) -> Self::InstanceId;

    /// Send a participant-info message, opening or answering a session.
    ///
    /// `expected_receiver_pid`, `clock_type` and `timestamp_now` travel on
    /// the wire but are not consulted by the receiving state machines.
    #[allow(clippy::too_many_arguments)]
    fn send_participant_info(
        &mut self,
        to: Self::InstanceId,
        header: MsgHeader,
        protocol_version: u16,
        minor_protocol_version: u32,
        sender_iid: Self::InstanceId,
        expected_receiver_pid: u64,
        clock_type: u8,
        timestamp_now: u64,
    ) -> bool;

    /// Send a keep-alive message.
    ///
    /// With `using_previous_message_id` the header repeats the last sent
    /// message id instead of consuming a new one; combined with
    /// `message_id == 0` it encodes the responder error signal.
    fn send_keep_alive(
        &mut self,
        to: Self::InstanceId,
        header: MsgHeader,
        timestamp_now: u64,
        using_previous_message_id: bool,
    ) -> bool;

    /// Append a description of the transport state to a log dump.
    fn log_connection_state(&self, _out: &mut String) {}
}
