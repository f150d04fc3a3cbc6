//! Portside - a local process supervisor with a hostname router
//!
//! This library provides:
//! - Procfile parsing and per-environment variable files
//! - A supervisor that spawns every process with labeled, colored output
//! - Free-port allocation for processes that are exposed through the router
//! - A reverse proxy that routes HTTP traffic by Host header to local ports
//! - A control channel the supervisor uses to keep the router's table in sync

pub mod config;
pub mod control;
pub mod env;
pub mod error;
pub mod output;
pub mod pool;
pub mod port;
pub mod procfile;
pub mod protocol;
pub mod router;
pub mod routes;
pub mod shebang;
pub mod supervisor;
