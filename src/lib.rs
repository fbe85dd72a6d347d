//! Forkgate - A multi-process HTTP gateway
//!
//! One coordinator process owns the public listener and a fixed pool of
//! worker processes:
//! - Rate limits clients by address and throttles heavy ones before refusing them
//! - Serves static files and cached upstream responses without leaving the coordinator
//! - Dispatches everything else to a worker chosen round-robin
//! - Workers match the request against regex rules and call the upstream origin
//! - Crashed workers are replaced in their own slot so the pool size never shrinks

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ipc;
pub mod pool;
pub mod ratelimit;
pub mod router;
pub mod static_files;
pub mod upstream;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
