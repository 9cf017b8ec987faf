//! Error types for the verification core.
//!
//! The core distinguishes the failure classes a load run can hit:
//!
//! - **Configuration** errors ([`Error::InvalidConfig`],
//!   [`Error::AdmissionOverflow`]) are fatal and raised before any load is
//!   generated.
//! - **Routing** exhaustion ([`Error::RoutingExhausted`]) replaces what would
//!   otherwise be an unbounded brute-force search.
//! - **Convergence** failures are split between a timeout
//!   ([`Error::NotConverged`]) and a broken observation channel
//!   ([`Error::ObservationFailed`]) so the two are never conflated.
//! - [`Error::InvariantsViolated`] summarises a scenario whose verdicts were
//!   collected without short-circuiting.
//!
//! Per-unit execution failures are *not* errors at this level: they are
//! recorded as failed [`Outcome`](crate::Outcome)s.

use core::time::Duration;

/// Result alias used across the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors the verification core can emit.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A sizing or fixture parameter is invalid. Raised before any work runs.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// More units were submitted than the admission queue was planned for.
    #[error("admission queue overflow: {submitted} units exceed planned capacity {capacity}")]
    AdmissionOverflow { submitted: usize, capacity: usize },

    /// No candidate hashed onto the requested shard within the probe ceiling.
    #[error(
        "routing exhausted: no identifier landed on shard {target} of {shard_count} after {attempts} probes"
    )]
    RoutingExhausted {
        shard_count: u32,
        target: u32,
        attempts: u64,
    },

    /// An asynchronous side effect was not observed before the deadline.
    #[error("condition `{signal}` did not converge within {waited:?} ({attempts} polls)")]
    NotConverged {
        signal: String,
        waited: Duration,
        attempts: u32,
    },

    /// The observation channel kept failing past the error budget.
    #[error("observing `{signal}` failed {failures} consecutive times: {source}")]
    ObservationFailed {
        signal: String,
        failures: u32,
        #[source]
        source: CollaboratorError,
    },

    /// The run was cancelled before it could finish.
    #[error("run cancelled")]
    Cancelled,

    /// A collaborator call required to set up the scenario failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// One or more invariants failed; details live in the verdict set.
    #[error("{failed} of {total} invariants violated")]
    InvariantsViolated { failed: usize, total: usize },
}

impl Error {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// Failure reported by an external collaborator (HTTP API, key-value store,
/// row counter).
///
/// Collaborator crates convert their own error types into this one, keeping
/// the core free of transport details.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CollaboratorError {
    /// The request never produced a response (connect, reset, DNS, ...).
    #[error("transport failure: {0}")]
    Transport(String),

    /// A response arrived but could not be interpreted.
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// The resource does not exist in this environment (e.g. an unprovisioned
    /// shard table).
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
