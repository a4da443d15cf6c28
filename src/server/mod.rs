//! Inbound connection handling.

pub mod listener;

pub use listener::Listener;
