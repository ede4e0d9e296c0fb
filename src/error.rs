//! Error taxonomy (spec §7).
//!
//! Each variant carries the propagation policy documented in the spec:
//! `ConfigurationInvalid` is fatal and never retried, `InitFailure` and
//! `WatchFailure` are retried by the engine, `TransientExternalError` is
//! surfaced from `checkApply` and scheduled for retry, `ProgrammerError`
//! is logged but not necessarily propagated, and `AllocationExhausted`
//! causes a dropped DHCP packet.

use std::fmt;

/// The crate-wide error type every resource operation returns.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Pure validation failure. Fatal for the node; never retried.
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Transient system state observed during `init` (e.g. interface not
    /// up yet). The engine may retry.
    #[error("init failed: {0}")]
    InitFailure(String),

    /// The event source backing a `Watch` was lost. `Watch` returns this
    /// error and the engine restarts it with backoff.
    #[error("watch failed: {0}")]
    WatchFailure(String),

    /// Network or filesystem failure surfaced from `checkApply`. Always
    /// surfaced to the caller; the engine schedules a retry.
    #[error("transient external error: {0}")]
    TransientExternalError(String),

    /// An internal invariant was violated (e.g. double free). Logged
    /// prominently; callers with a safe continuation (lease pruning)
    /// swallow it rather than propagate it.
    #[error("programmer error: {0}")]
    ProgrammerError(String),

    /// The DHCP range has no more free addresses to hand out.
    #[error("allocation exhausted")]
    AllocationExhausted,
}

impl Error {
    pub fn configuration_invalid(msg: impl fmt::Display) -> Self {
        Self::ConfigurationInvalid(msg.to_string())
    }

    pub fn init_failure(msg: impl fmt::Display) -> Self {
        Self::InitFailure(msg.to_string())
    }

    pub fn watch_failure(msg: impl fmt::Display) -> Self {
        Self::WatchFailure(msg.to_string())
    }

    pub fn transient(msg: impl fmt::Display) -> Self {
        Self::TransientExternalError(msg.to_string())
    }

    pub fn programmer(msg: impl fmt::Display) -> Self {
        Self::ProgrammerError(msg.to_string())
    }
}

/// The typed double-free error the bitmap allocator returns. Kept
/// distinct from [`Error`] so callers can match on it without pattern
/// matching into a string-carrying variant (spec §4.6: "callers
/// distinguish this from fatal errors").
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
#[error("double free at {location}")]
pub struct DoubleFree {
    pub location: std::net::Ipv4Addr,
}

pub type Result<T> = std::result::Result<T, Error>;
