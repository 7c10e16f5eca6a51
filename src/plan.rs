//! Route planning.
//!
//! A test route is described by an ordered list of waypoints. The planner
//! joins the shortest paths between consecutive waypoints into one
//! continuous walk, optionally closing the tour back to the first waypoint.
//!
//! ```text
//! waypoints: [1, 3]         graph: 1-2-3-4-5-1
//! plan (loop = false):      [1, 2, 3]
//! plan (loop = true):       [1, 2, 3, 2, 1]   (or any other shortest walk)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{QcError, QcResult};
use crate::graph::{Channel, ChannelGraph};

/// Waypoints plus the options used to plan a test route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRoute {
    /// Channels the route must visit, in order.
    pub waypoints: Vec<Channel>,
    /// Waypoint to start from; the list is rotated so it comes first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Channel>,
    /// Return to the first waypoint at the end of the route.
    #[serde(default = "default_loop", rename = "loop")]
    pub closed: bool,
}

fn default_loop() -> bool {
    true
}

impl TestRoute {
    /// Closed tour over `waypoints`, starting at the first one.
    pub fn new(waypoints: Vec<Channel>) -> Self {
        Self {
            waypoints,
            start: None,
            closed: true,
        }
    }

    /// Start the tour at `start` instead.
    pub fn starting_at(mut self, start: Channel) -> Self {
        self.start = Some(start);
        self
    }

    /// Do not return to the first waypoint.
    pub fn open(mut self) -> Self {
        self.closed = false;
        self
    }
}

impl Default for TestRoute {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// A planned route ready for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRoute {
    /// Hop-by-hop channel sequence.
    pub route: Vec<Channel>,
    /// Waypoints the route was planned from, including the closing
    /// waypoint when the route loops.
    pub way_points: Vec<Channel>,
}

/// Join shortest paths between consecutive waypoints into one walk.
///
/// With `closed` the walk returns to the first waypoint. A single waypoint
/// yields a one-channel plan.
///
/// # Errors
/// `EmptyRoute` for no waypoints; `NoPath` / `ChannelNotFound` if any
/// consecutive pair cannot be joined.
pub fn create_channel_plan(
    graph: &ChannelGraph,
    waypoints: &[Channel],
    closed: bool,
) -> QcResult<Vec<Channel>> {
    let (&first, _) = waypoints.split_first().ok_or(QcError::EmptyRoute)?;
    if !graph.contains(first) {
        return Err(QcError::ChannelNotFound(first));
    }

    let mut plan = vec![first];
    for pair in waypoints.windows(2) {
        extend_walk(&mut plan, graph.shortest_path(pair[0], pair[1])?);
    }
    if closed && waypoints.len() > 1 {
        let last = waypoints[waypoints.len() - 1];
        extend_walk(&mut plan, graph.shortest_path(last, first)?);
    }
    Ok(plan)
}

/// Append `path` to `walk`, dropping the joint channel both share.
fn extend_walk(walk: &mut Vec<Channel>, path: Vec<Channel>) {
    let mut path = path.into_iter();
    if walk.last().is_some() {
        path.next();
    }
    walk.extend(path);
}

/// Rotate `waypoints` so the route begins at `start`.
///
/// # Errors
/// `InvalidWaypoint` if `start` is not one of the waypoints.
pub fn rotate_waypoints(waypoints: &[Channel], start: Channel) -> QcResult<Vec<Channel>> {
    let index = waypoints
        .iter()
        .position(|&w| w == start)
        .ok_or_else(|| QcError::InvalidWaypoint {
            waypoint: start,
            reason: format!("start channel must be one of the waypoints {waypoints:?}"),
        })?;
    let mut rotated = waypoints.to_vec();
    rotated.rotate_left(index);
    Ok(rotated)
}

/// Plan a full test route: rotate to the start waypoint, close the loop
/// and join shortest paths.
pub fn plan_test_route(graph: &ChannelGraph, test_route: &TestRoute) -> QcResult<PlannedRoute> {
    if test_route.waypoints.is_empty() {
        return Err(QcError::EmptyRoute);
    }
    let mut way_points = match test_route.start {
        Some(start) => rotate_waypoints(&test_route.waypoints, start)?,
        None => test_route.waypoints.clone(),
    };
    if let Some(missing) = way_points.iter().find(|&&w| !graph.contains(w)) {
        return Err(QcError::ChannelNotFound(*missing));
    }
    if test_route.closed && way_points.len() > 1 {
        way_points.push(way_points[0]);
    }
    let route = create_channel_plan(graph, &way_points, false)?;
    Ok(PlannedRoute { route, way_points })
}

/// Re-plan `plan` after channels have been removed from `graph`.
///
/// Channels no longer in the graph are dropped and the survivors are
/// joined again with shortest paths (no loop closure). Consecutive
/// duplicates left behind by the removal are collapsed.
pub fn prune_plan(graph: &ChannelGraph, plan: &[Channel]) -> QcResult<Vec<Channel>> {
    let mut survivors: Vec<Channel> = Vec::with_capacity(plan.len());
    for &channel in plan {
        if graph.contains(channel) && survivors.last() != Some(&channel) {
            survivors.push(channel);
        }
    }
    if survivors.len() == plan.len() {
        return Ok(survivors);
    }
    tracing::debug!(
        removed = plan.len() - survivors.len(),
        "Rerouting around missing channels"
    );
    create_channel_plan(graph, &survivors, false)
}
