//! Participant connection management.
//!
//! Two peers, each exposed on the transport through a dynamic instance id
//! and carrying a stable participant id, establish an agreed session, detect
//! lost messages through per-session counters, notice when the other side
//! goes away and recover on their own. The crate contains the state
//! machines, the counter protocol and the keep-alive supervision; the
//! transport itself stays behind the [`Stack`] trait.
//!
//! Two protocol generations co-exist: the combined legacy machine (minor
//! protocol version 0) and the deterministic initiator/responder handshake
//! (version 1), where the peer with the smaller instance id is always the
//! responder. A single peer can talk to remotes of both generations at the
//! same time.
//!
//! The embedding layer either drives a [`ConnectionSystem`] directly under
//! its own lock, or uses [`ConnectionService`] which owns the lock and runs
//! the keep-alive worker thread.
pub mod common;
pub mod config;
pub mod error;
pub mod fsm;
pub mod notifier;
pub mod service;
pub mod stack;
pub mod wire;

pub use common::time::{Clock, LocalDuration, LocalTime, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ConfigError, SendError};
pub use fsm::initres::{InitiatorState, ParticipantState, ResponderState};
pub use fsm::system::ConnectionSystem;
pub use notifier::{ConnectionListener, ConnectionStatus, ConnectionStatusNotifier};
pub use service::{ConnectionService, WorkerWaker};
pub use stack::{InstanceId, Stack};
pub use wire::{MsgHeader, ParticipantId};
