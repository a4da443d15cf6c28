//! relaylb - least-connections TCP load balancer
//!
//! Core library for the proxy, plus the word-count service it fronts and
//! that service's command-line client.

pub mod client;
pub mod config;
pub mod error;
pub mod proxy;
pub mod server;
pub mod wordcount;
