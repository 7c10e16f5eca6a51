//! Test results.
//!
//! [`summarize`] derives a [`TestResult`] from an event log alone, so a
//! result can be rebuilt at any time (after a crash, from a persisted
//! JSON-lines file, or from the partial log of an aborted run).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::events::{EventLog, EventRecord, TestEvent};
use crate::graph::Channel;

/// Pass/fail partition of a test route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    /// Channels actually visited, in order, including reroutes.
    pub success_route: Vec<Channel>,
    /// Planned channels never reached (sorted).
    pub failed_electrodes: Vec<Channel>,
    /// Channels reached at least once (sorted).
    pub success_electrodes: Vec<Channel>,
    /// Channels pruned as unreachable (sorted).
    pub skipped_electrodes: Vec<Channel>,
    /// Whether the log contains `test-complete`.
    pub completed: bool,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The whole route was executed.
    Completed,
    /// Cancelled before the route was exhausted.
    Interrupted,
    /// Aborted by a fatal error.
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Interrupted => write!(f, "interrupted"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Id recorded in the run's `test-start`. Empty if the run never started.
    pub run_uid: String,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Result summarized from `events`.
    pub result: TestResult,
    /// Route left unexecuted; starts with the channel holding liquid.
    pub remaining_route: Vec<Channel>,
    /// Every event of the test, including those of resumed-from segments.
    pub events: EventLog,
}

impl RunReport {
    /// Report for a run rejected before it started (already running, or
    /// the route could not be planned). It has no `run_uid` and no events.
    pub fn not_started() -> Self {
        Self {
            run_uid: String::new(),
            outcome: RunOutcome::Failed,
            result: TestResult::default(),
            remaining_route: Vec::new(),
            events: EventLog::new(),
        }
    }
}

/// Where an interrupted test stopped, as recorded in its event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePoint {
    /// Waypoints of the test, from its first `test-start`.
    pub way_points: Vec<Channel>,
    /// Route left by the last `test-interrupt`; starts with the channel
    /// holding liquid.
    pub remaining_route: Vec<Channel>,
    /// Channels failed or skipped so far (sorted).
    pub removed: Vec<Channel>,
}

impl ResumePoint {
    /// Whether the test's tour returns to its first waypoint.
    pub fn is_closed(&self) -> bool {
        self.way_points.len() > 1 && self.way_points.first() == self.way_points.last()
    }
}

/// Find where the test recorded in `records` can be resumed.
///
/// `None` if the log holds no test, or if its last segment completed or
/// has not stopped yet.
pub fn resume_point(records: &[EventRecord]) -> Option<ResumePoint> {
    let mut way_points: Option<Vec<Channel>> = None;
    let mut remaining_route: Option<Vec<Channel>> = None;
    let mut removed = BTreeSet::new();

    for record in records {
        match &record.event {
            TestEvent::TestStart {
                way_points: segment,
                ..
            } => {
                if way_points.is_none() {
                    way_points = Some(segment.clone());
                }
                remaining_route = None;
            }
            TestEvent::TestInterrupt {
                remaining_route: route,
                ..
            } => remaining_route = Some(route.clone()),
            TestEvent::TestComplete { .. } => remaining_route = None,
            TestEvent::ElectrodeFail(hop) => {
                removed.insert(hop.target);
            }
            TestEvent::ElectrodeSkip { target, .. } => {
                removed.insert(*target);
            }
            TestEvent::ElectrodeSuccess(_) | TestEvent::ElectrodeAttemptFail(_) => {}
        }
    }

    Some(ResumePoint {
        way_points: way_points?,
        remaining_route: remaining_route?,
        removed: removed.into_iter().collect(),
    })
}

/// Summarize an event log into a test result.
///
/// Pure function of the records: the planned route comes from the first
/// `test-start`, visited channels from `electrode-success` targets. A log
/// holding several `test-start` records (a resumed run) is treated as one
/// test whose later segments continue from where the previous one stopped.
pub fn summarize(records: &[EventRecord]) -> TestResult {
    let mut planned: Option<Vec<Channel>> = None;
    let mut success_route: Vec<Channel> = Vec::new();
    let mut skipped = BTreeSet::new();
    let mut completed = false;

    for record in records {
        match &record.event {
            TestEvent::TestStart { route, .. } => {
                if planned.is_none() {
                    planned = Some(route.clone());
                }
                if let Some(&first) = route.first() {
                    if success_route.last() != Some(&first) {
                        success_route.push(first);
                    }
                }
            }
            TestEvent::ElectrodeSuccess(hop) => success_route.push(hop.target),
            TestEvent::ElectrodeSkip { target, .. } => {
                skipped.insert(*target);
            }
            TestEvent::TestComplete { .. } => completed = true,
            TestEvent::ElectrodeAttemptFail(_)
            | TestEvent::ElectrodeFail(_)
            | TestEvent::TestInterrupt { .. } => {}
        }
    }

    let Some(planned) = planned else {
        return TestResult::default();
    };

    let visited: BTreeSet<Channel> = success_route.iter().copied().collect();
    let failed: BTreeSet<Channel> = planned
        .iter()
        .copied()
        .filter(|c| !visited.contains(c))
        .collect();

    TestResult {
        success_route,
        failed_electrodes: failed.into_iter().collect(),
        success_electrodes: visited.into_iter().collect(),
        skipped_electrodes: skipped.into_iter().collect(),
        completed,
    }
}

impl EventLog {
    /// [`summarize`] this log.
    pub fn summarize(&self) -> TestResult {
        summarize(self.records())
    }

    /// [`resume_point`] of this log.
    pub fn resume_point(&self) -> Option<ResumePoint> {
        resume_point(self.records())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HopRecord;
    use chrono::Utc;

    fn start(route: Vec<Channel>) -> EventRecord {
        EventRecord::now(TestEvent::TestStart {
            way_points: vec![route[0]],
            route,
            run_uid: "run-1".into(),
            chip_uuid: None,
        })
    }

    fn hop(source: Channel, target: Channel, attempt: u32) -> HopRecord {
        let now = Utc::now();
        HopRecord {
            source,
            target,
            start: now,
            end: now,
            attempt,
        }
    }

    #[test]
    fn test_empty_log_gives_empty_result() {
        assert_eq!(summarize(&[]), TestResult::default());
    }

    #[test]
    fn test_summary_partitions_route() {
        let log = EventLog::from(vec![
            start(vec![1, 2, 3, 4]),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(1, 2, 1))),
            EventRecord::now(TestEvent::ElectrodeAttemptFail(hop(2, 3, 1))),
            EventRecord::now(TestEvent::ElectrodeFail(hop(2, 3, 2))),
            EventRecord::now(TestEvent::ElectrodeSkip {
                source: 2,
                target: 4,
            }),
        ]);

        let result = log.summarize();
        assert_eq!(result.success_route, vec![1, 2]);
        assert_eq!(result.success_electrodes, vec![1, 2]);
        assert_eq!(result.failed_electrodes, vec![3, 4]);
        assert_eq!(result.skipped_electrodes, vec![4]);
        assert!(!result.completed);
    }

    #[test]
    fn test_revisited_channels_counted_once() {
        let records = vec![
            start(vec![1, 2, 1]),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(1, 2, 1))),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(2, 1, 2))),
            EventRecord::now(TestEvent::TestComplete {
                success_route: vec![1, 2, 1],
                failed_electrodes: vec![],
                success_electrodes: vec![1, 2],
                version: "test".into(),
            }),
        ];
        let result = summarize(&records);
        assert_eq!(result.success_route, vec![1, 2, 1]);
        assert_eq!(result.success_electrodes, vec![1, 2]);
        assert!(result.failed_electrodes.is_empty());
        assert!(result.completed);
    }

    #[test]
    fn test_summarize_is_idempotent() {
        let records = vec![
            start(vec![5, 6, 7]),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(5, 6, 3))),
        ];
        assert_eq!(summarize(&records), summarize(&records));
    }

    #[test]
    fn test_resumed_run_continues_success_route() {
        let records = vec![
            start(vec![1, 2, 3, 4]),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(1, 2, 1))),
            EventRecord::now(TestEvent::TestInterrupt {
                reason: "cancelled".into(),
                remaining_route: vec![2, 3, 4],
            }),
            start(vec![2, 3, 4]),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(2, 3, 1))),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(3, 4, 1))),
        ];
        let result = summarize(&records);
        assert_eq!(result.success_route, vec![1, 2, 3, 4]);
        assert!(result.failed_electrodes.is_empty());
    }

    fn interrupt(remaining_route: Vec<Channel>) -> EventRecord {
        EventRecord::now(TestEvent::TestInterrupt {
            reason: "cancelled".into(),
            remaining_route,
        })
    }

    #[test]
    fn test_resume_point_after_interrupt() {
        let log = EventLog::from(vec![
            start(vec![1, 2, 3, 4, 1]),
            EventRecord::now(TestEvent::ElectrodeFail(hop(1, 2, 3))),
            EventRecord::now(TestEvent::ElectrodeSkip {
                source: 1,
                target: 5,
            }),
            EventRecord::now(TestEvent::ElectrodeSuccess(hop(1, 3, 1))),
            interrupt(vec![3, 4, 1]),
        ]);

        let point = log.resume_point().unwrap();
        assert_eq!(point.way_points, vec![1]);
        assert_eq!(point.remaining_route, vec![3, 4, 1]);
        assert_eq!(point.removed, vec![2, 5]);
        assert!(!point.is_closed());
    }

    #[test]
    fn test_no_resume_point_without_interrupt() {
        assert_eq!(resume_point(&[]), None);
        assert_eq!(resume_point(&[start(vec![1, 2])]), None);

        // A resumed segment that is still running supersedes the interrupt
        let records = vec![start(vec![1, 2, 3]), interrupt(vec![2, 3]), start(vec![2, 3])];
        assert_eq!(resume_point(&records), None);
    }

    #[test]
    fn test_closed_tour_detection() {
        let point = ResumePoint {
            way_points: vec![4, 9, 4],
            remaining_route: vec![9, 4],
            removed: vec![],
        };
        assert!(point.is_closed());
    }
}
