//! Session lifecycle for one keysign round.

pub mod coordinator;
pub mod types;

pub use coordinator::{Role, SessionCoordinator};
pub use types::{ParticipantSet, Session, SessionState, quorum_threshold};
