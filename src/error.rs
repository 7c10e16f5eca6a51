//! Error types for the chip QC test routine.
//!
//! `QcError` is the single error enum for planning, execution, configuration
//! and I/O. Using `thiserror`, each failure class carries the channels
//! involved so callers can tell a per-hop problem from a run-level one.
//!
//! ## Error Hierarchy
//!
//! - **`NoPath`** / **`ChannelNotFound`**: graph queries that cannot be
//!   answered. During planning these are planning failures.
//! - **`UnreachableWaypoint`**: the executor could not reach the final
//!   channel of the route even after pruning. Fatal for the run.
//! - **`HopTimeout`**: a single liquid transfer did not settle before its
//!   deadline. Retried by the executor, never fatal on its own.
//! - **`Hardware`**: any other fault reported by the move collaborator.
//!   Fatal for the run; not retried.
//! - **`NothingToResume`**: an event log has no interrupted test to continue.
//! - **`Config`**, **`Io`**, **`Json`**: ambient failures.
//!
//! Fatal run aborts are wrapped in [`RunError`], which keeps the partial
//! report so completed transfer history is never lost.

use thiserror::Error;

use crate::graph::Channel;
use crate::report::RunReport;

/// Convenience alias for results using the crate error type.
pub type QcResult<T> = std::result::Result<T, QcError>;

/// Error type for planning, execution and configuration.
#[derive(Error, Debug)]
pub enum QcError {
    /// The two channels are in different components of the graph.
    #[error("no path between channel {from} and channel {to}")]
    NoPath {
        /// Start of the requested path.
        from: Channel,
        /// End of the requested path.
        to: Channel,
    },

    /// A channel is not in the graph.
    #[error("channel {0} is not in the channel graph")]
    ChannelNotFound(Channel),

    /// The final route channel was cut off from the liquid mid-run.
    #[error("channel {to} is unreachable from channel {from}")]
    UnreachableWaypoint {
        /// Channel holding the liquid.
        from: Channel,
        /// Route channel that can no longer be reached.
        to: Channel,
    },

    /// No waypoints or no route to execute.
    #[error("route is empty")]
    EmptyRoute,

    /// A waypoint option does not name a usable channel.
    #[error("invalid waypoint {waypoint}: {reason}")]
    InvalidWaypoint {
        /// Offending waypoint.
        waypoint: Channel,
        /// What is wrong with it.
        reason: String,
    },

    /// Malformed chip graph.
    #[error("invalid channel graph: {0}")]
    InvalidGraph(String),

    /// One transfer attempt missed its deadline.
    #[error("timed out moving liquid {from}->{to} (attempt {attempt})")]
    HopTimeout {
        /// Channel the liquid was moving from.
        from: Channel,
        /// Channel the liquid was moving to.
        to: Channel,
        /// 1-based attempt number.
        attempt: u32,
    },

    /// Fault reported by the move collaborator.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The executor is already running a test.
    #[error("a test run is already in progress")]
    AlreadyRunning,

    /// The event log holds no interrupted test.
    #[error("no interrupted test to resume")]
    NothingToResume,

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Chip file or event log is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QcError {
    /// Whether the executor may retry or reroute around this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QcError::HopTimeout { .. })
    }
}

impl From<figment::Error> for QcError {
    fn from(value: figment::Error) -> Self {
        QcError::Config(value.to_string())
    }
}

/// A run that aborted on a fatal error.
///
/// `partial` holds every event logged before the abort and the test
/// result summarized from them.
#[derive(Error, Debug)]
#[error("test run aborted: {error}")]
pub struct RunError {
    /// Why the run stopped.
    #[source]
    pub error: QcError,
    /// Report of the run up to the abort. See [`RunReport::not_started`]
    /// for runs rejected before they began.
    pub partial: RunReport,
}
