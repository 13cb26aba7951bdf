//! Faasgate - a function-as-a-service gateway for a single host
//!
//! This library turns a table of named routes into compute units that exist
//! only while they are needed:
//! - `service` routes are long-lived containers, created or restarted on the
//!   first request and reverse-proxied
//! - `function` routes run a one-shot container per request and speak a
//!   length-framed protocol over stdin/stdout
//! - `shell` routes run a local process per request with the same protocol
//! - idle service containers are stopped in the background and every
//!   container is removed on shutdown
//!
//! Containers are driven through a docker-compatible command line.

pub mod admin;
pub mod config;
pub mod docker;
pub mod error;
pub mod executor;
pub mod function;
pub mod lifecycle;
pub mod pool;
pub mod proxy;
pub mod reaper;
pub mod route;
