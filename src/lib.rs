//! # DMF Chip QC Library
//!
//! Quality-control routine for digital microfluidic chips. A chip is a graph
//! of electrode channels; the routine plans a walk that visits a list of
//! waypoint electrodes, moves liquid along it one hop at a time, retries and
//! reroutes around electrodes that fail, and reports which electrodes pass.
//!
//! ## Crate Structure
//!
//! - **`graph`**: `ChannelGraph`, the undirected electrode adjacency graph,
//!   with breadth-first shortest paths and JSON chip-file loading.
//! - **`plan`**: Joins shortest paths between waypoints into a test route.
//! - **`executor`**: `TransferExecutor`, the hop-by-hop state machine with
//!   per-hop deadlines, bounded retry, reroute and cancellation.
//! - **`events`**: Typed test events, the in-memory `EventLog`, event sinks
//!   and JSON-lines persistence.
//! - **`report`**: Pure summarisation of an event log into a `TestResult`.
//! - **`hardware`**: `LiquidMover` and `Alerter` capability traits plus mock
//!   implementations.
//! - **`config`**: Layered configuration (TOML file + environment).
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`error`**: The `QcError` enum for centralized error handling.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod hardware;
pub mod logging;
pub mod plan;
pub mod report;

pub use error::{QcError, QcResult, RunError};
pub use events::{EventLog, EventRecord, EventSink, TestEvent};
pub use executor::{CancelToken, ExecutorState, RetryPolicy, TransferExecutor};
pub use graph::{Channel, ChannelGraph};
pub use plan::{create_channel_plan, plan_test_route, PlannedRoute, TestRoute};
pub use report::{summarize, RunOutcome, RunReport, TestResult};
