//! # Skiff Proto
//!
//! Client-side SSH-2 transport: key exchange, encrypted record layer,
//! and channel multiplexing, built on [`tokio`].
//!
//! The crate establishes an authenticated, encrypted,
//! integrity-protected, multiplexed byte-stream connection to an SSH
//! server. Authentication sub-protocols, file transfer, and command
//! execution are consumers of the [`ssh::channel::Channel`] interface
//! and live outside this crate.
//!
//! See [`ssh::client::SshClient`] for the entry point.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;

pub use skiff_platform::{SkiffError, SkiffResult};
