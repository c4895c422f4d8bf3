//! # Sessions
//!
//! Session and message types plus the in-memory [`SessionStore`] the
//! conversation service and the `/sessions` endpoints share.

pub mod model;
pub mod store;

pub use model::{DisplayName, Message, Role, Session, SessionKind};
pub use store::{SessionError, SessionSettings, SessionSnapshot, SessionStore};
