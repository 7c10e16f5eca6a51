//! Test-run event model.
//!
//! Every state change of a test run is recorded as a typed [`TestEvent`]
//! stamped with a UTC time. Events are appended to an [`EventLog`] and
//! delivered, in emission order, to any number of [`EventSink`]s.
//!
//! # Event Flow
//!
//! ```text
//! test-start (1)
//!    │
//!    ├── electrode-attempt-fail (one per timed-out attempt)
//!    ├── electrode-success | electrode-fail (1 per hop)
//!    ├── electrode-skip (0+, unreachable channels pruned)
//!    │
//! test-complete | test-interrupt (1)
//! ```
//!
//! Persisted logs are JSON lines, one tagged record per line:
//!
//! ```json
//! {"utc_time":"2024-01-01T00:00:00Z","event":"electrode-success","source":1,"target":2,...}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tokio::sync::mpsc;

use crate::error::QcResult;
use crate::graph::Channel;

/// One liquid transfer between adjacent channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRecord {
    /// Channel the liquid is moving from.
    pub source: Channel,
    /// Channel the liquid is moving to.
    pub target: Channel,
    /// Start of the hop (first attempt).
    pub start: DateTime<Utc>,
    /// End of the reported attempt.
    pub end: DateTime<Utc>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Lifecycle events of a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TestEvent {
    /// Test has started.
    TestStart {
        /// Planned channel route.
        route: Vec<Channel>,
        /// Waypoints the route was planned from.
        way_points: Vec<Channel>,
        /// Unique id of this run.
        run_uid: String,
        /// Chip identifier, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chip_uuid: Option<String>,
    },
    /// Liquid reached the target channel.
    ElectrodeSuccess(HopRecord),
    /// A single transfer attempt timed out.
    ElectrodeAttemptFail(HopRecord),
    /// Every attempt timed out; the target is failed.
    ElectrodeFail(HopRecord),
    /// Channel pruned because it became unreachable.
    ElectrodeSkip {
        /// Last channel holding liquid.
        source: Channel,
        /// Unreachable channel.
        target: Channel,
    },
    /// Test ran to the end of its route.
    TestComplete {
        /// Channels visited, in order, including reroutes.
        success_route: Vec<Channel>,
        /// Planned channels never reached.
        failed_electrodes: Vec<Channel>,
        /// Channels reached at least once.
        success_electrodes: Vec<Channel>,
        /// Version of this crate.
        version: String,
    },
    /// Test stopped early (cancelled or aborted).
    TestInterrupt {
        /// Why the run stopped.
        reason: String,
        /// Route left unexecuted.
        remaining_route: Vec<Channel>,
    },
}

impl TestEvent {
    /// Wire name of the event (`test-start`, `electrode-success`, ...).
    pub fn name(&self) -> &'static str {
        match self {
            TestEvent::TestStart { .. } => "test-start",
            TestEvent::ElectrodeSuccess(_) => "electrode-success",
            TestEvent::ElectrodeAttemptFail(_) => "electrode-attempt-fail",
            TestEvent::ElectrodeFail(_) => "electrode-fail",
            TestEvent::ElectrodeSkip { .. } => "electrode-skip",
            TestEvent::TestComplete { .. } => "test-complete",
            TestEvent::TestInterrupt { .. } => "test-interrupt",
        }
    }
}

/// An event stamped with the UTC time it was logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event was logged.
    pub utc_time: DateTime<Utc>,
    /// The event itself.
    #[serde(flatten)]
    pub event: TestEvent,
}

impl EventRecord {
    /// Stamp `event` with the current time.
    pub fn now(event: TestEvent) -> Self {
        Self {
            utc_time: Utc::now(),
            event,
        }
    }
}

/// Append-only, ordered log of event records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog {
    records: Vec<EventRecord>,
}

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: EventRecord) {
        self.records.push(record);
    }

    /// Records in emission order.
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Events in emission order, without timestamps.
    pub fn events(&self) -> impl Iterator<Item = &TestEvent> {
        self.records.iter().map(|r| &r.event)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the whole log as JSON lines.
    pub fn write_jsonl<P: AsRef<Path>>(&self, path: P) -> QcResult<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        for record in &self.records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl From<Vec<EventRecord>> for EventLog {
    fn from(records: Vec<EventRecord>) -> Self {
        Self { records }
    }
}

/// Read a JSON-lines event log. Blank lines are ignored.
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> QcResult<EventLog> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut log = EventLog::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        log.push(serde_json::from_str(&line)?);
    }
    Ok(log)
}

/// Consumer of the event stream.
///
/// Called synchronously, in emission order, from the executing run.
/// Implementations must not block for long.
pub trait EventSink: Send {
    /// Receive one record.
    fn emit(&mut self, record: &EventRecord);
}

impl EventSink for EventLog {
    fn emit(&mut self, record: &EventRecord) {
        self.push(record.clone());
    }
}

impl EventSink for mpsc::UnboundedSender<EventRecord> {
    fn emit(&mut self, record: &EventRecord) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(record.clone());
    }
}

/// Adapter turning a closure into an [`EventSink`].
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: FnMut(&EventRecord) + Send,
{
    fn emit(&mut self, record: &EventRecord) {
        (self.0)(record)
    }
}

/// Sink that appends each record to a JSON-lines file as it arrives.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn append<P: AsRef<Path>>(path: P) -> QcResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_record(&mut self, record: &EventRecord) -> QcResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl EventSink for JsonLinesSink {
    fn emit(&mut self, record: &EventRecord) {
        if let Err(e) = self.write_record(record) {
            tracing::error!(error = %e, event = record.event.name(), "Failed to persist event");
        }
    }
}
