//! Connection system errors.
use thiserror::Error;

use crate::wire::ParticipantId;

/// A constructor argument error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The communication user id must be non-zero.
    #[error("invalid communication user id 0")]
    InvalidUserId,
    /// The protocol version must be non-zero.
    #[error("invalid protocol version 0")]
    InvalidProtocolVersion,
    /// The own participant id must be valid.
    #[error("invalid own participant id")]
    InvalidParticipantId,
    /// Keep-alive timeout must be larger than the interval, and the interval
    /// non-zero. Both zero disables the keep-alive worker (testing only).
    #[error("keep-alive value mismatch: timeout must be > interval and interval != 0")]
    InvalidKeepAlive,
}

/// An error raised by the send entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The destination participant was never seen.
    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),
    /// The destination participant is known but currently has no session.
    #[error("participant {0} is not connected")]
    NotConnected(ParticipantId),
    /// The connection system was not started.
    #[error("connection system is not started")]
    NotStarted,
    /// The transport rejected the message. The session has been reset.
    #[error("transport rejected message to {0}")]
    Transport(ParticipantId),
}
