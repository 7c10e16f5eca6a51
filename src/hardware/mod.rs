//! Hardware collaborators.
//!
//! Capability traits the executor drives, plus mock implementations for
//! dry runs and tests. The controller wire protocol lives outside this
//! crate.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    AlertKind, Alerter, LiquidMover, LogAlerter, MoveError, NullAlerter, Telemetry,
};
pub use mock::{MockBehaviour, MockMover};
