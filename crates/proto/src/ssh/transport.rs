//! Transport state machine (RFC 4253).
//!
//! Tracks the connection lifecycle:
//!
//! ```text
//! Tcp -> Versioned -> Kex -> Running <-> Rekey
//!                              |           |
//!                              +--> Closing <--+
//! ```
//!
//! - `Tcp -> Versioned` on exchange of identification strings
//! - `Versioned -> Kex` when the first KEXINIT is sent
//! - `Kex -> Running` once both NEWKEYS have been processed
//! - `Running -> Rekey` when either side sends KEXINIT again
//! - any state `-> Closing` on DISCONNECT or a fatal error
//!
//! The state also owns the session-wide invariants: the immutable
//! `session_id` (first exchange hash), the strict-KEX flag, and the
//! rekey thresholds (1 GiB or 1 hour by default).

use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::algorithms::AlgorithmCatalog;
use crate::ssh::version::Version;

/// Transport lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Byte stream connected, nothing exchanged yet.
    Tcp,
    /// Identification strings exchanged.
    Versioned,
    /// Initial key exchange in progress.
    Kex,
    /// Keys installed, connection protocol available.
    Running,
    /// A rekey is in progress; non-kex traffic is held.
    Rekey,
    /// The transport is shutting down.
    Closing,
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification string.
    pub version: Version,
    /// Algorithm preference lists.
    pub catalog: AlgorithmCatalog,
    /// Bytes transferred before an automatic rekey (default 1 GiB).
    pub rekey_bytes_limit: u64,
    /// Seconds elapsed before an automatic rekey (default 3600).
    pub rekey_time_limit: u64,
    /// Maximum concurrently open channels (default 10).
    pub max_channels: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_skiff(),
            catalog: AlgorithmCatalog::default(),
            rekey_bytes_limit: 1 << 30,
            rekey_time_limit: 3600,
            max_channels: 10,
        }
    }
}

/// Transport state machine.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    config: TransportConfig,
    peer_version: Option<Version>,
    session_id: Option<Vec<u8>>,
    strict_kex: bool,
    auth_complete: bool,
    bytes_transferred: u64,
    last_kex_time: u64,
}

impl TransportState {
    /// Creates a state machine in the `Tcp` state.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            state: State::Tcp,
            config,
            peer_version: None,
            session_id: None,
            strict_kex: false,
            auth_complete: false,
            bytes_transferred: 0,
            last_kex_time: 0,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> State {
        self.state
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the peer's identification, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Records the peer's identification.
    pub fn set_peer_version(&mut self, version: Version) {
        self.peer_version = Some(version);
    }

    /// Returns the session identifier (first exchange hash).
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Freezes the session identifier. Later calls are ignored: the
    /// session id never changes after the first key exchange.
    pub fn set_session_id(&mut self, h: &[u8]) {
        if self.session_id.is_none() {
            self.session_id = Some(h.to_vec());
        }
    }

    /// Returns whether strict-KEX mode is active.
    pub fn strict_kex(&self) -> bool {
        self.strict_kex
    }

    /// Enables strict-KEX mode. Never disabled once on.
    pub fn enable_strict_kex(&mut self) {
        self.strict_kex = true;
    }

    /// Returns whether user authentication has completed.
    pub fn auth_complete(&self) -> bool {
        self.auth_complete
    }

    /// Marks user authentication complete (activates delayed compression).
    pub fn set_auth_complete(&mut self) {
        self.auth_complete = true;
    }

    /// Validates and performs a state transition.
    pub fn transition(&mut self, next: State) -> SkiffResult<()> {
        let valid = matches!(
            (self.state, next),
            (State::Tcp, State::Versioned)
                | (State::Versioned, State::Kex)
                | (State::Kex, State::Running)
                | (State::Running, State::Rekey)
                | (State::Rekey, State::Running)
                | (_, State::Closing)
        ) || self.state == next;

        if !valid {
            return Err(SkiffError::Protocol(format!(
                "invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Records bytes moved through the record layer for rekey tracking.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
    }

    /// Returns whether a rekey should be initiated.
    pub fn needs_rekey(&self, current_time: u64) -> bool {
        if self.state != State::Running {
            return false;
        }
        self.bytes_transferred >= self.config.rekey_bytes_limit
            || current_time >= self.last_kex_time + self.config.rekey_time_limit
    }

    /// Resets rekey tracking after a completed exchange.
    pub fn reset_rekey_tracking(&mut self, current_time: u64) {
        self.bytes_transferred = 0;
        self.last_kex_time = current_time;
    }
}
