//! Hardware Collaborator Capabilities
//!
//! The test routine never talks to the electrode controller directly. It
//! drives the chip through two small capability traits:
//!
//! - [`LiquidMover`]: performs one physical liquid transfer between two
//!   adjacent channels and reports steady state, timeout, or a fault
//! - [`Alerter`]: notifies the operator (bell, log line) when an electrode
//!   fails or the test ends
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async where it touches hardware (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for opaque hardware faults
//! - Keeps timeouts distinguishable from every other failure
//!
//! # Example
//!
//! ```rust,ignore
//! struct ControllerMover { proxy: ControllerProxy }
//!
//! #[async_trait]
//! impl LiquidMover for ControllerMover {
//!     async fn move_hop(&self, source: Channel, target: Channel)
//!         -> Result<Vec<Telemetry>, MoveError>
//!     {
//!         self.proxy.actuate(&[source, target]).await?;
//!         self.proxy.wait_steady_state().await
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::Channel;

/// One capacitance sample reported by the controller during a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Channels actuated when the sample was taken.
    pub channels: Vec<Channel>,
    /// Measured capacitance in farads.
    pub capacitance: f64,
    /// When the sample was taken.
    pub time: DateTime<Utc>,
}

/// Why a transfer attempt did not reach steady state.
#[derive(Error, Debug)]
pub enum MoveError {
    /// Capacitance did not settle before the deadline. Retryable.
    #[error("timed out moving liquid along {route:?}")]
    Timeout {
        /// Channels of the attempted transfer.
        route: Vec<Channel>,
    },

    /// Any other controller fault. Fatal for the run.
    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

/// Capability: Liquid Transfer
///
/// Moves liquid from `source` to the adjacent `target` channel.
///
/// # Contract
/// - Returns the telemetry gathered while waiting for steady state
/// - Signals `MoveError::Timeout` when the transfer does not converge; the
///   caller additionally bounds every call with its own deadline
/// - Never called concurrently for the same run
/// - If the controller requires global mutual exclusion (one actuation in
///   flight at a time), the implementation enforces it
#[async_trait]
pub trait LiquidMover: Send + Sync {
    /// Perform one source→target transfer.
    async fn move_hop(&self, source: Channel, target: Channel)
        -> Result<Vec<Telemetry>, MoveError>;

    /// Drive liquid back to the last known-good channel after a failed
    /// attempt.
    ///
    /// # Default Implementation
    /// No-op.
    async fn recover(&self, _last_good: Channel) -> Result<()> {
        Ok(())
    }

    /// Load liquid onto the first channels of the route before the test.
    ///
    /// # Default Implementation
    /// No-op.
    async fn load(&self, _channels: &[Channel]) -> Result<()> {
        Ok(())
    }

    /// Turn off all channels once the run has ended, in any state.
    ///
    /// # Default Implementation
    /// No-op.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Reason for alerting the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// Liquid could not be moved onto this channel.
    ElectrodeFailed(Channel),
    /// The test run has ended.
    TestComplete,
}

/// Capability: Operator Notification
///
/// Fire-and-forget; implementations must not block.
pub trait Alerter: Send + Sync {
    /// Notify the operator.
    fn alert(&self, kind: AlertKind);
}

/// Rings the terminal bell and records the alert in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn alert(&self, kind: AlertKind) {
        eprint!("\x07");
        match kind {
            AlertKind::ElectrodeFailed(channel) => {
                tracing::error!(channel, "Operator alert: electrode failed");
            }
            AlertKind::TestComplete => tracing::info!("Operator alert: test complete"),
        }
    }
}

/// Discards alerts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAlerter;

impl Alerter for NullAlerter {
    fn alert(&self, _kind: AlertKind) {}
}
