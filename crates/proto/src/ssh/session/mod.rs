//! Session upkeep.
//!
//! Currently this covers the keepalive heartbeat; the session surface
//! itself lives in [`crate::ssh::client`].

pub mod keepalive;

pub use keepalive::KeepaliveTask;
