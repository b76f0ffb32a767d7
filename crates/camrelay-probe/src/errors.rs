//! Probe error types.
//!
//! A ping that times out or exits non-zero is not an error; it is a
//! [`ProbeResult`](crate::ProbeResult) with `succeeded: false`. Errors are
//! reserved for input rejection and for failing to run the utility at all.

use std::io;

use thiserror::Error;

/// Errors that can occur while validating or running a probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The target string is not an IPv4 literal, IPv6 literal or hostname.
    #[error("invalid probe target")]
    InvalidTarget,

    /// The ping utility could not be started (missing binary, permissions).
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that was being started.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Waiting on an already spawned child failed.
    #[error("failed to wait for probe process: {0}")]
    Wait(#[source] io::Error),
}

impl ProbeError {
    /// Whether the error is caused by caller input rather than the host.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidTarget)
    }
}
