//! TransferExecutor - state machine for the chip test routine
//!
//! The executor walks a planned route one hop at a time, asks the
//! [`LiquidMover`] to move liquid for each hop, retries timed-out hops a
//! bounded number of times and, once a hop is exhausted, removes the failed
//! channel from the run's graph and detours around it.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ run_test() ┌──────────┐  planned  ┌─────────┐   route done   ┌──────────┐
//! │ Idle │───────────▶│ Planning │──────────▶│ Running │───────────────▶│ Complete │
//! └──────┘            └──────────┘           └────┬────┘                └──────────┘
//!                                                 │ ▲
//!                                  electrode fail │ │ next hop
//!                                                 ▼ │
//!                                            ┌────────────┐
//!                                            │ Recovering │
//!                                            └────────────┘
//!
//! Idle/Interrupted/Failed ── resume() ──▶ Planning
//! Running/Recovering ── cancel ──▶ Interrupted
//! Running/Recovering ── fatal  ──▶ Failed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let executor = TransferExecutor::new(Arc::new(mover))
//!     .with_policy(RetryPolicy::default())
//!     .with_sink(JsonLinesSink::append("events.jsonl")?);
//!
//! let cancel = executor.cancel_token();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     cancel.cancel();
//! });
//!
//! match executor.run_test(&chip_graph, &TestRoute::new(vec![110, 109, 115])).await {
//!     Ok(report) => println!("failed: {:?}", report.result.failed_electrodes),
//!     Err(e) => println!("aborted after {:?}", e.partial.result.success_route),
//! }
//! ```

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::{QcError, QcResult, RunError};
use crate::events::{EventLog, EventRecord, EventSink, HopRecord, TestEvent};
use crate::graph::{Channel, ChannelGraph};
use crate::hardware::{AlertKind, Alerter, LiquidMover, LogAlerter, MoveError};
use crate::plan::{plan_test_route, prune_plan, TestRoute};
use crate::report::{ResumePoint, RunOutcome, RunReport};

/// Number of leading route channels liquid is loaded onto before the test.
const LOAD_CHANNELS: usize = 4;

/// Executor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// No run in progress
    Idle,
    /// Computing the route from waypoints
    Planning,
    /// Moving liquid hop by hop
    Running,
    /// Rerouting after an electrode failure
    Recovering,
    /// Last run finished its route
    Complete,
    /// Last run was cancelled
    Interrupted,
    /// Last run aborted on a fatal error
    Failed,
}

impl ExecutorState {
    fn is_active(self) -> bool {
        matches!(
            self,
            ExecutorState::Planning | ExecutorState::Running | ExecutorState::Recovering
        )
    }
}

impl std::fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorState::Idle => write!(f, "idle"),
            ExecutorState::Planning => write!(f, "planning"),
            ExecutorState::Running => write!(f, "running"),
            ExecutorState::Recovering => write!(f, "recovering"),
            ExecutorState::Complete => write!(f, "complete"),
            ExecutorState::Interrupted => write!(f, "interrupted"),
            ExecutorState::Failed => write!(f, "failed"),
        }
    }
}

/// Bounds on a single hop.
///
/// ```rust
/// use dmf_chip_qc::executor::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 2,
///     hop_timeout: Duration::from_secs(2),
///     backoff: Duration::from_millis(500),
/// };
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per hop before the target is declared failed.
    pub max_attempts: u32,
    /// Deadline for one `move_hop` call.
    pub hop_timeout: Duration,
    /// Pause between a timed-out attempt and the next one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, 4s per attempt, 1s between attempts.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            hop_timeout: Duration::from_secs(4),
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Reject policies that could never move liquid.
    pub fn validate(&self) -> QcResult<()> {
        if self.max_attempts == 0 {
            return Err(QcError::Config("max_attempts must be at least 1".into()));
        }
        if self.hop_timeout.is_zero() {
            return Err(QcError::Config("hop_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Cooperative cancellation signal shared between a run and its owner.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Token in the not-cancelled state.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Request the run to stop at its next scheduling point.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether `cancel` has been called since the last run began.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    fn reset(&self) {
        self.sender.send_replace(false);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one hop's attempt loop.
enum HopOutcome {
    Moved,
    Failed,
    Cancelled,
}

/// Run-scoped mutable state. Owned by exactly one executing run.
struct RunContext {
    run_uid: String,
    graph: ChannelGraph,
    route: Vec<Channel>,
    way_points: Vec<Channel>,
    /// Unexecuted route; the head is the channel holding liquid.
    remaining: Vec<Channel>,
    log: EventLog,
    /// `test-start` has been emitted.
    started: bool,
}

impl RunContext {
    fn new(graph: &ChannelGraph, route: Vec<Channel>, way_points: Vec<Channel>) -> Self {
        Self {
            run_uid: uuid::Uuid::new_v4().to_string(),
            graph: graph.clone(),
            remaining: route.clone(),
            route,
            way_points,
            log: EventLog::new(),
            started: false,
        }
    }

    /// Append this run's events after those of earlier segments.
    fn continuing(mut self, history: &EventLog) -> Self {
        self.log = history.clone();
        self
    }

    fn into_report(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            result: self.log.summarize(),
            run_uid: self.run_uid,
            outcome,
            remaining_route: self.remaining,
            events: self.log,
        }
    }
}

/// Drives liquid along a test route and records what happened.
pub struct TransferExecutor {
    mover: Arc<dyn LiquidMover>,
    alerter: Arc<dyn Alerter>,
    policy: RetryPolicy,
    sinks: Mutex<Vec<Box<dyn EventSink>>>,
    state: RwLock<ExecutorState>,
    cancel: CancelToken,
    chip_uuid: Option<String>,
}

impl TransferExecutor {
    /// Executor with the default policy, a [`LogAlerter`] and no sinks.
    pub fn new(mover: Arc<dyn LiquidMover>) -> Self {
        Self {
            mover,
            alerter: Arc::new(LogAlerter),
            policy: RetryPolicy::default(),
            sinks: Mutex::new(Vec::new()),
            state: RwLock::new(ExecutorState::Idle),
            cancel: CancelToken::new(),
            chip_uuid: None,
        }
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the operator alerter.
    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Add a consumer of the event stream.
    pub fn with_sink(self, sink: impl EventSink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    /// Chip identifier recorded in every `test-start`.
    pub fn with_chip_uuid(mut self, chip_uuid: impl Into<String>) -> Self {
        self.chip_uuid = Some(chip_uuid.into());
        self
    }

    /// Add a consumer of the event stream to an existing executor.
    pub fn add_sink(&self, sink: impl EventSink + 'static) {
        self.sinks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Box::new(sink));
    }

    /// Retry policy applied to every hop.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Token that cancels the current (or next) run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current executor state.
    pub async fn state(&self) -> ExecutorState {
        *self.state.read().await
    }

    /// Plan `test_route` on a copy of `graph` and execute it.
    pub async fn run_test(
        &self,
        graph: &ChannelGraph,
        test_route: &TestRoute,
    ) -> Result<RunReport, RunError> {
        self.begin(ExecutorState::Planning).await?;
        info!(waypoints = ?test_route.waypoints, "Planning test route");

        let planned = match plan_test_route(graph, test_route) {
            Ok(planned) => planned,
            Err(e) => return Err(self.reject_plan(e).await),
        };

        self.set_state(ExecutorState::Running).await;
        self.execute_run(RunContext::new(graph, planned.route, planned.way_points))
            .await
    }

    /// Continue the interrupted test recorded in `history`.
    ///
    /// Channels that failed or were skipped earlier stay out of the graph,
    /// the remaining route is re-planned around channels missing from
    /// `graph`, and a closed tour is led back to its first waypoint. New
    /// events are appended after `history`, so the returned report
    /// summarizes the whole test.
    ///
    /// # Errors
    /// `NothingToResume` if `history` does not end in an interrupted
    /// segment; planning errors if the remaining route cannot be replanned.
    pub async fn resume(
        &self,
        graph: &ChannelGraph,
        history: &EventLog,
    ) -> Result<RunReport, RunError> {
        self.begin(ExecutorState::Planning).await?;

        let planned = history
            .resume_point()
            .ok_or(QcError::NothingToResume)
            .and_then(|point| plan_resume(graph, &point));
        let (graph, route, way_points) = match planned {
            Ok(planned) => planned,
            Err(e) => return Err(self.reject_plan(e).await),
        };
        info!(route = ?route, "Resuming interrupted test");

        self.set_state(ExecutorState::Running).await;
        self.execute_run(RunContext::new(&graph, route, way_points).continuing(history))
            .await
    }

    /// Execute an already planned route on a copy of `graph`.
    pub async fn run(
        &self,
        graph: &ChannelGraph,
        route: Vec<Channel>,
        way_points: Vec<Channel>,
    ) -> Result<RunReport, RunError> {
        self.begin(ExecutorState::Running).await?;
        self.execute_run(RunContext::new(graph, route, way_points))
            .await
    }

    async fn begin(&self, next: ExecutorState) -> Result<(), RunError> {
        let mut state = self.state.write().await;
        if state.is_active() {
            return Err(RunError {
                error: QcError::AlreadyRunning,
                partial: RunReport::not_started(),
            });
        }
        *state = next;
        self.cancel.reset();
        Ok(())
    }

    async fn reject_plan(&self, error: QcError) -> RunError {
        error!(error = %error, "Route planning failed");
        self.set_state(ExecutorState::Failed).await;
        RunError {
            error,
            partial: RunReport::not_started(),
        }
    }

    async fn set_state(&self, next: ExecutorState) {
        let mut state = self.state.write().await;
        if *state != next {
            debug!(from = %*state, to = %next, "Executor state change");
            *state = next;
        }
    }

    async fn execute_run(&self, mut ctx: RunContext) -> Result<RunReport, RunError> {
        let span = info_span!("test_run", run_uid = %ctx.run_uid);
        let outcome = self.execute(&mut ctx).instrument(span).await;

        if let Err(e) = self.mover.release().await {
            warn!(error = %e, "Failed to turn off channels after test");
        }

        match outcome {
            Ok(RunOutcome::Completed) => {
                let summary = ctx.log.summarize();
                info!(
                    run_uid = %ctx.run_uid,
                    failed_electrodes = ?summary.failed_electrodes,
                    "Completed test"
                );
                self.emit(
                    &mut ctx,
                    TestEvent::TestComplete {
                        success_route: summary.success_route,
                        failed_electrodes: summary.failed_electrodes,
                        success_electrodes: summary.success_electrodes,
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                );
                self.alerter.alert(AlertKind::TestComplete);
                self.set_state(ExecutorState::Complete).await;
                Ok(ctx.into_report(RunOutcome::Completed))
            }
            Ok(_) => {
                info!(run_uid = %ctx.run_uid, remaining = ?ctx.remaining, "Test interrupted");
                if ctx.started {
                    self.emit_interrupt(&mut ctx, "cancelled".to_string());
                }
                self.set_state(ExecutorState::Interrupted).await;
                Ok(ctx.into_report(RunOutcome::Interrupted))
            }
            Err(e) => {
                error!(run_uid = %ctx.run_uid, error = %e, "Test aborted");
                // Nothing to interrupt if loading failed before test-start
                if ctx.started {
                    self.emit_interrupt(&mut ctx, e.to_string());
                }
                self.set_state(ExecutorState::Failed).await;
                Err(RunError {
                    error: e,
                    partial: ctx.into_report(RunOutcome::Failed),
                })
            }
        }
    }

    /// Main hop loop.
    async fn execute(&self, ctx: &mut RunContext) -> QcResult<RunOutcome> {
        let Some(&first) = ctx.route.first() else {
            return Err(QcError::EmptyRoute);
        };
        if !ctx.graph.contains(first) {
            return Err(QcError::ChannelNotFound(first));
        }

        let load = &ctx.route[..ctx.route.len().min(LOAD_CHANNELS)];
        self.mover
            .load(load)
            .await
            .map_err(|e| QcError::Hardware(format!("{e:#}")))?;

        info!(route = ?ctx.route, way_points = ?ctx.way_points, "Begin DMF chip test routine");
        let start = TestEvent::TestStart {
            route: ctx.route.clone(),
            way_points: ctx.way_points.clone(),
            run_uid: ctx.run_uid.clone(),
            chip_uuid: self.chip_uuid.clone(),
        };
        self.emit(ctx, start);
        ctx.started = true;

        while ctx.remaining.len() > 1 {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Interrupted);
            }

            let source = ctx.remaining.remove(0);
            if let Err(e) = self.repair_route(ctx, source) {
                ctx.remaining.insert(0, source);
                return Err(e);
            }
            let Some(&target) = ctx.remaining.first() else {
                // Nothing reachable is left after the current channel
                ctx.remaining.insert(0, source);
                break;
            };

            self.set_state(ExecutorState::Running).await;
            match self.transfer(ctx, source, target).await {
                Ok(HopOutcome::Moved) => {}
                Ok(HopOutcome::Failed) => {
                    self.set_state(ExecutorState::Recovering).await;
                    self.alerter.alert(AlertKind::ElectrodeFailed(target));
                    ctx.graph.remove_channel(target);
                    ctx.remaining.insert(0, source);
                    warn!(channel = target, "Attempting to reroute around electrode");
                }
                Ok(HopOutcome::Cancelled) => {
                    ctx.remaining.insert(0, source);
                    return Ok(RunOutcome::Interrupted);
                }
                Err(e) => {
                    ctx.remaining.insert(0, source);
                    return Err(e);
                }
            }

            tokio::task::yield_now().await;
        }

        Ok(RunOutcome::Completed)
    }

    /// Make the head of the remaining route a live channel reachable from
    /// `source`, detouring around removed channels and pruning channels
    /// that can no longer be reached.
    ///
    /// # Errors
    /// `UnreachableWaypoint` if the final channel of the route is present
    /// but disconnected from `source`.
    fn repair_route(&self, ctx: &mut RunContext, source: Channel) -> QcResult<()> {
        while let Some(&head) = ctx.remaining.first() {
            if ctx.graph.contains(head) {
                return Ok(());
            }
            ctx.remaining.remove(0);
            let Some(&next) = ctx.remaining.first() else {
                return Ok(());
            };

            match ctx.graph.shortest_path(source, next) {
                Ok(path) => {
                    debug!(source, next, detour = ?path, "Rerouting");
                    ctx.remaining.splice(0..1, path.into_iter().skip(1));
                }
                // Already pruned; dropped on the next pass
                Err(_) if !ctx.graph.contains(next) => {}
                Err(_) if ctx.remaining.len() < 2 => {
                    let reachable = ctx.graph.component_of(source);
                    let orphaned: Vec<Channel> = ctx
                        .route
                        .iter()
                        .copied()
                        .filter(|c| ctx.graph.contains(*c) && !reachable.contains(c))
                        .collect();
                    error!(source, orphaned = ?orphaned, "Route channels cut off from liquid");
                    return Err(QcError::UnreachableWaypoint {
                        from: source,
                        to: next,
                    });
                }
                Err(_) => {
                    warn!(channel = next, "Pruning unreachable electrode");
                    ctx.graph.remove_channel(next);
                    self.emit(
                        ctx,
                        TestEvent::ElectrodeSkip {
                            source,
                            target: next,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// Attempt loop for one hop.
    async fn transfer(
        &self,
        ctx: &mut RunContext,
        source: Channel,
        target: Channel,
    ) -> QcResult<HopOutcome> {
        let start = Utc::now();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(HopOutcome::Cancelled),
                result = timeout(self.policy.hop_timeout, self.mover.move_hop(source, target)) => result,
            };

            match result {
                Ok(Ok(telemetry)) => {
                    debug!(source, target, attempt, samples = telemetry.len(), "Moved liquid");
                    self.emit(
                        ctx,
                        TestEvent::ElectrodeSuccess(HopRecord {
                            source,
                            target,
                            start,
                            end: Utc::now(),
                            attempt,
                        }),
                    );
                    return Ok(HopOutcome::Moved);
                }
                Ok(Err(MoveError::Hardware(e))) => {
                    error!(source, target, attempt, error = %e, "Hardware fault during transfer");
                    return Err(QcError::Hardware(format!("{e:#}")));
                }
                Ok(Err(MoveError::Timeout { .. })) | Err(_) => {
                    let err = QcError::HopTimeout {
                        from: source,
                        to: target,
                        attempt,
                    };
                    warn!(error = %err, "Timed out moving liquid");
                    self.emit(
                        ctx,
                        TestEvent::ElectrodeAttemptFail(HopRecord {
                            source,
                            target,
                            start,
                            end: Utc::now(),
                            attempt,
                        }),
                    );
                }
            }

            if attempt < max_attempts {
                self.mover
                    .recover(source)
                    .await
                    .map_err(|e| QcError::Hardware(format!("{e:#}")))?;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(HopOutcome::Cancelled),
                    _ = sleep(self.policy.backoff) => {}
                }
            }
        }

        error!(channel = target, "Failed to move liquid to electrode");
        self.emit(
            ctx,
            TestEvent::ElectrodeFail(HopRecord {
                source,
                target,
                start,
                end: Utc::now(),
                attempt: max_attempts,
            }),
        );
        Ok(HopOutcome::Failed)
    }

    fn emit_interrupt(&self, ctx: &mut RunContext, reason: String) {
        let remaining_route = ctx.remaining.clone();
        self.emit(
            ctx,
            TestEvent::TestInterrupt {
                reason,
                remaining_route,
            },
        );
    }

    /// Log an event and deliver it to every sink, in order.
    fn emit(&self, ctx: &mut RunContext, event: TestEvent) {
        let record = EventRecord::now(event);
        debug!(event = record.event.name(), "Emitting event");
        {
            let mut sinks = self
                .sinks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for sink in sinks.iter_mut() {
                sink.emit(&record);
            }
        }
        ctx.log.push(record);
    }
}

/// Graph, route and waypoints that continue the test from `point`.
fn plan_resume(
    graph: &ChannelGraph,
    point: &ResumePoint,
) -> QcResult<(ChannelGraph, Vec<Channel>, Vec<Channel>)> {
    let graph = graph.without(point.removed.iter().copied());
    let Some(&holding) = point.remaining_route.first() else {
        return Err(QcError::NothingToResume);
    };
    if !graph.contains(holding) {
        return Err(QcError::ChannelNotFound(holding));
    }

    let mut route = prune_plan(&graph, &point.remaining_route)?;
    if let (Some(&first), Some(&last)) = (point.way_points.first(), route.last()) {
        if point.is_closed() && last != first && graph.contains(first) {
            let back = graph.shortest_path(last, first)?;
            route.extend(back.into_iter().skip(1));
        }
    }
    if route.len() < 2 {
        return Err(QcError::NothingToResume);
    }
    Ok((graph, route, point.way_points.clone()))
}
