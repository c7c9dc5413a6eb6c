//! Core of the collaboration hub: access control, invitations, presence,
//! chat and the per-connection session state machine.

pub mod access;
pub mod auth;
pub mod chat;
pub mod error;
pub mod invitation;
pub mod model;
pub mod policy;
pub mod presence;
pub mod session;
pub mod storage;

pub use access::AccessControl;
pub use error::{ErrorKind, HubError, Result};
pub use invitation::Invitations;
pub use session::{ClientMessage, CollabSession, Flow, ServerMessage, SessionManager};
