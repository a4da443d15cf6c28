//! Load-balancing proxy
//!
//! This module implements backend selection and the byte relay between a
//! client and the backend chosen for it.

pub mod backend;
pub mod forward;
pub mod selector;
pub mod session;

pub use backend::{BackendAddress, BackendRegistry};
pub use forward::{forward, IdleClock};
pub use selector::{BackendSlot, ConnectionSelector};
pub use session::{ProxyContext, ProxySession, SessionOptions, SessionReport, SessionState};
