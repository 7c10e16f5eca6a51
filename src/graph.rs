//! Channel adjacency graph.
//!
//! An undirected graph over controller channel ids. Nodes are removed when
//! an electrode is judged failed or unreachable during a test run; removal
//! is never undone for that run, so every run starts from a [`Clone`] of
//! the pristine chip graph.
//!
//! Adjacency is kept in ordered maps so iteration (and therefore the
//! shortest path chosen among equal-length candidates) is stable for a
//! given graph. Callers must not rely on any particular tie-break.
//!
//! # File format
//!
//! ```json
//! { "channels": [1, 2, 3], "connections": [[1, 2], [2, 3]] }
//! ```
//!
//! Channels named only in `connections` are added implicitly. Self-loops
//! are rejected.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use crate::error::{QcError, QcResult};

/// Integer id of an actuation unit as seen by the electrode controller.
pub type Channel = u32;

/// Undirected, loop-free adjacency graph over channel ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GraphFile", into = "GraphFile")]
pub struct ChannelGraph {
    adjacency: BTreeMap<Channel, BTreeSet<Channel>>,
}

/// On-disk representation of a [`ChannelGraph`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFile {
    /// Channels present on the chip (isolated channels allowed).
    #[serde(default)]
    pub channels: Vec<Channel>,
    /// Unordered adjacent channel pairs.
    #[serde(default)]
    pub connections: Vec<(Channel, Channel)>,
}

impl ChannelGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from an edge list.
    pub fn from_edges<I>(edges: I) -> QcResult<Self>
    where
        I: IntoIterator<Item = (Channel, Channel)>,
    {
        let mut graph = Self::new();
        for (a, b) in edges {
            graph.add_edge(a, b)?;
        }
        Ok(graph)
    }

    /// Load a graph from a JSON file (see module docs for the format).
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> QcResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let graph = serde_json::from_str(&content)?;
        Ok(graph)
    }

    /// Add an isolated channel; no-op if present.
    pub fn add_channel(&mut self, channel: Channel) {
        self.adjacency.entry(channel).or_default();
    }

    /// Add an undirected edge, creating both channels if needed.
    pub fn add_edge(&mut self, a: Channel, b: Channel) -> QcResult<()> {
        if a == b {
            return Err(QcError::InvalidGraph(format!(
                "self-loop on channel {a}"
            )));
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
        Ok(())
    }

    /// Remove a channel and all its incident edges.
    ///
    /// Returns `false` (and leaves the graph untouched) if the channel was
    /// not present.
    pub fn remove_channel(&mut self, channel: Channel) -> bool {
        let Some(neighbours) = self.adjacency.remove(&channel) else {
            return false;
        };
        for neighbour in neighbours {
            if let Some(set) = self.adjacency.get_mut(&neighbour) {
                set.remove(&channel);
            }
        }
        true
    }

    /// Copy of this graph with the given channels removed.
    pub fn without<I>(&self, channels: I) -> Self
    where
        I: IntoIterator<Item = Channel>,
    {
        let mut graph = self.clone();
        for channel in channels {
            graph.remove_channel(channel);
        }
        graph
    }

    /// Whether `channel` is still in the graph.
    pub fn contains(&self, channel: Channel) -> bool {
        self.adjacency.contains_key(&channel)
    }

    /// Whether `a` and `b` are adjacent.
    pub fn has_edge(&self, a: Channel, b: Channel) -> bool {
        self.adjacency
            .get(&a)
            .is_some_and(|neighbours| neighbours.contains(&b))
    }

    /// Channels adjacent to `channel`, ascending.
    pub fn neighbours(&self, channel: Channel) -> impl Iterator<Item = Channel> + '_ {
        self.adjacency
            .get(&channel)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// All channels, ascending.
    pub fn channels(&self) -> impl Iterator<Item = Channel> + '_ {
        self.adjacency.keys().copied()
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Number of undirected connections.
    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// Shortest path from `from` to `to`, both ends inclusive.
    ///
    /// Breadth-first search; `[from]` when both ends are the same channel.
    ///
    /// # Errors
    /// - `ChannelNotFound` if either end is absent
    /// - `NoPath` if the two channels are disconnected
    pub fn shortest_path(&self, from: Channel, to: Channel) -> QcResult<Vec<Channel>> {
        if !self.contains(from) {
            return Err(QcError::ChannelNotFound(from));
        }
        if !self.contains(to) {
            return Err(QcError::ChannelNotFound(to));
        }
        if from == to {
            return Ok(vec![from]);
        }

        let mut parent: BTreeMap<Channel, Channel> = BTreeMap::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);
        parent.insert(from, from);

        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current) {
                if parent.contains_key(&next) {
                    continue;
                }
                parent.insert(next, current);
                if next == to {
                    return Ok(unwind(&parent, from, to));
                }
                queue.push_back(next);
            }
        }

        Err(QcError::NoPath { from, to })
    }

    /// Channels in the connected component containing `channel`.
    ///
    /// Empty if the channel is absent.
    pub fn component_of(&self, channel: Channel) -> BTreeSet<Channel> {
        let mut seen = BTreeSet::new();
        if !self.contains(channel) {
            return seen;
        }
        let mut queue = VecDeque::new();
        queue.push_back(channel);
        seen.insert(channel);
        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Whether every consecutive pair of `walk` is an edge of this graph.
    pub fn is_walk(&self, walk: &[Channel]) -> bool {
        walk.windows(2).all(|pair| self.has_edge(pair[0], pair[1]))
    }
}

fn unwind(parent: &BTreeMap<Channel, Channel>, from: Channel, to: Channel) -> Vec<Channel> {
    let mut path = vec![to];
    let mut current = to;
    while current != from {
        current = parent[&current];
        path.push(current);
    }
    path.reverse();
    path
}

impl TryFrom<GraphFile> for ChannelGraph {
    type Error = QcError;

    fn try_from(file: GraphFile) -> Result<Self, Self::Error> {
        let mut graph = ChannelGraph::from_edges(file.connections)?;
        for channel in file.channels {
            graph.add_channel(channel);
        }
        Ok(graph)
    }
}

impl From<ChannelGraph> for GraphFile {
    fn from(graph: ChannelGraph) -> Self {
        let connections = graph
            .adjacency
            .iter()
            .flat_map(|(&a, neighbours)| {
                neighbours
                    .iter()
                    .filter(move |&&b| a < b)
                    .map(move |&b| (a, b))
            })
            .collect();
        GraphFile {
            channels: graph.adjacency.keys().copied().collect(),
            connections,
        }
    }
}
