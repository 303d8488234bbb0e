// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, error, info};

use crate::config::ManagedProcess;
use crate::errors::{GraphBuildReport, GraphError, MissingDependency, MissingPublisher};
use crate::graph::node::{NodeColor, NodeId, ProcessNode, Visit};

/// Directed multigraph of managed processes.
///
/// Expected usage:
///
/// 1) Create the graph
/// 2) Make n calls to `add_node`
/// 3) Once all nodes have been added, call `build()`, which derives the
///    adjacency lists from topic pub/sub relations and explicit
///    dependencies. This pass uncovers topics which are consumed but never
///    produced, dependencies on processes which were never defined, etc.
/// 4) `has_cycle()` should come back false to confirm this is actually a
///    (multi-)DAG
/// 5) `topological_sort()` then yields the launch order
///
/// Nodes and edges are stored in insertion order so every traversal is
/// deterministic. Duplicate edges (two processes sharing more than one
/// topic) are retained and treated as independent traversals.
pub struct ProcessGraph {
    nodes: Vec<ProcessNode>,
    index: HashMap<String, NodeId>,
    edges: Vec<Vec<NodeId>>,
}

impl ProcessGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &ProcessNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ProcessNode {
        &mut self.nodes[id]
    }

    /// Look a node up by process name.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.index.get(name).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ProcessNode> {
        self.nodes.iter()
    }

    /// Successors of `id`, in edge insertion order. Duplicates retained.
    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.edges[id]
    }

    /// Validate a managed process record and insert it into the graph.
    pub fn add_node(&mut self, config: &ManagedProcess) -> Result<NodeId, GraphError> {
        let node = ProcessNode::from_config(config)?;

        if self.index.contains_key(&node.name) {
            error!(
                process = %node.name,
                "detected request to add a managed process using a name which is already taken"
            );
            return Err(GraphError::DuplicateProcessName { process: node.name });
        }

        let id = self.nodes.len();
        info!(process = %node.name, "created node");
        self.index.insert(node.name.clone(), id);
        self.nodes.push(node);
        self.edges.push(Vec::new());
        Ok(id)
    }

    /// Reset all adjacency information and rebuild it from the node set.
    ///
    /// Runs the sanity checks first (every subscribed topic has a
    /// publisher, every explicit dependency resolves) and aggregates every
    /// violation into a single error before any edges are constructed, so
    /// one failed build names everything that is wrong.
    pub fn build(&mut self) -> Result<(), GraphError> {
        info!("rebuilding adjacency information");
        self.edges = vec![Vec::new(); self.nodes.len()];

        let mut topic_to_publishers: BTreeMap<&str, Vec<NodeId>> = BTreeMap::new();
        let mut topic_to_subscribers: BTreeMap<&str, Vec<NodeId>> = BTreeMap::new();
        let mut report = GraphBuildReport::default();

        for (id, node) in self.nodes.iter().enumerate() {
            for topic in &node.provided_topics {
                topic_to_publishers.entry(topic.as_str()).or_default().push(id);
            }
            for topic in &node.required_topics {
                topic_to_subscribers.entry(topic.as_str()).or_default().push(id);
            }

            let missing: Vec<String> = node
                .additional_dependencies
                .iter()
                .filter(|dependency| !self.index.contains_key(*dependency))
                .cloned()
                .collect();
            if !missing.is_empty() {
                report.missing_dependencies.push(MissingDependency {
                    process: node.name.clone(),
                    dependencies: missing,
                });
            }
        }

        for (topic, subscribers) in &topic_to_subscribers {
            if !topic_to_publishers.contains_key(topic) {
                report.missing_publishers.push(MissingPublisher {
                    topic: topic.to_string(),
                    subscribers: subscribers
                        .iter()
                        .map(|id| self.nodes[*id].name.clone())
                        .collect(),
                });
            }
        }

        if !report.is_empty() {
            error!(%report, "found errors when building adjacency information");
            return Err(GraphError::Build(report));
        }

        // Phase 1: pub/sub edges, one per publisher/subscriber pair.
        let mut pub_sub_edges: Vec<(NodeId, NodeId)> = Vec::new();
        for (topic, subscribers) in &topic_to_subscribers {
            for publisher in &topic_to_publishers[topic] {
                for subscriber in subscribers {
                    pub_sub_edges.push((*publisher, *subscriber));
                }
            }
        }
        for (publisher, subscriber) in pub_sub_edges {
            self.edges[publisher].push(subscriber);
        }

        // Phase 2: explicit dependencies.
        let index = &self.index;
        let explicit: Vec<(NodeId, NodeId)> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(id, node)| {
                node.additional_dependencies
                    .iter()
                    .map(move |dependency| (index[dependency], id))
            })
            .collect();
        for (source, dependent) in explicit {
            self.edges[source].push(dependent);
        }

        Ok(())
    }

    fn reset_traversal_state(&mut self) {
        for node in &mut self.nodes {
            node.reset_traversal_state();
        }
    }

    /// Iterative depth-first traversal of the entire graph.
    ///
    /// The visitor runs twice per node: once when the node is discovered
    /// (`Visit::Enter`) and once when it is finished (`Visit::Exit`). A
    /// discovered node stays on the stack until everything reachable from
    /// it is finished, which reproduces the recursive enter/exit ordering
    /// without recursion.
    ///
    /// Returns true if a back-edge (cycle) was observed.
    pub fn depth_first_traversal<F>(&mut self, mut visitor: F) -> bool
    where
        F: FnMut(NodeId, &ProcessNode, Visit),
    {
        self.reset_traversal_state();
        let mut time = 0usize;
        let mut cyclic = false;

        for root in 0..self.nodes.len() {
            match self.nodes[root].color {
                NodeColor::White => {}
                NodeColor::Gray => {
                    info!(process = %self.nodes[root].name, "found cycle involving node");
                    cyclic = true;
                    continue;
                }
                NodeColor::Black => continue,
            }

            let mut stack: Vec<NodeId> = vec![root];
            while let Some(&id) = stack.last() {
                match self.nodes[id].color {
                    NodeColor::White => {
                        // Stays on the stack until everything below it is done.
                        time += 1;
                        self.nodes[id].discovery_time = time;
                        debug!(
                            process = %self.nodes[id].name,
                            discovery_time = time,
                            "entering node"
                        );
                        visitor(id, &self.nodes[id], Visit::Enter);
                        self.nodes[id].color = NodeColor::Gray;

                        for position in 0..self.edges[id].len() {
                            let successor = self.edges[id][position];
                            match self.nodes[successor].color {
                                NodeColor::White => {
                                    self.nodes[successor].predecessor = Some(id);
                                    stack.push(successor);
                                }
                                NodeColor::Gray => {
                                    debug!(
                                        from = %self.nodes[id].name,
                                        to = %self.nodes[successor].name,
                                        "found cycle involving edge"
                                    );
                                    cyclic = true;
                                }
                                NodeColor::Black => {}
                            }
                        }
                    }
                    NodeColor::Gray => {
                        time += 1;
                        self.nodes[id].finishing_time = time;
                        self.nodes[id].color = NodeColor::Black;
                        debug!(
                            process = %self.nodes[id].name,
                            finishing_time = time,
                            "exiting node"
                        );
                        visitor(id, &self.nodes[id], Visit::Exit);
                        stack.pop();
                    }
                    // Already finished via another stack entry (duplicate edges).
                    NodeColor::Black => {
                        stack.pop();
                    }
                }
            }
        }

        cyclic
    }

    /// True if the graph contains at least one cycle.
    pub fn has_cycle(&mut self) -> bool {
        self.depth_first_traversal(|_, _, _| {})
    }

    /// Nodes ordered so every edge points forward in the result.
    pub fn topological_sort(&mut self) -> Result<Vec<NodeId>, GraphError> {
        let mut order: Vec<NodeId> = Vec::with_capacity(self.nodes.len());
        let cyclic = self.depth_first_traversal(|id, _, visit| {
            if visit == Visit::Exit {
                order.push(id);
            }
        });
        if cyclic {
            return Err(GraphError::Cyclic);
        }
        order.reverse();
        Ok(order)
    }

    /// Breadth-first traversal from a single start node.
    ///
    /// The start node is discovered at depth 1 and every successor one
    /// deeper than its predecessor. `max_depth` bounds the frontier:
    /// `None` walks everything reachable, `Some(0)` confines the traversal
    /// to the start node itself, and any other bound stops expanding once
    /// `discovery_time + 1` reaches it.
    ///
    /// Duplicate edges can enqueue a node twice; re-entering a non-white
    /// node is a no-op, so the visitor never runs twice for one node.
    pub fn breadth_first_traversal<F>(
        &mut self,
        start: NodeId,
        max_depth: Option<usize>,
        mut visitor: F,
    ) where
        F: FnMut(NodeId, &ProcessNode, Visit),
    {
        self.reset_traversal_state();

        self.nodes[start].discovery_time = 1;
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        queue.push_back(start);

        while let Some(id) = queue.pop_front() {
            if self.nodes[id].color != NodeColor::White {
                continue;
            }

            if let Some(predecessor) = self.nodes[id].predecessor {
                self.nodes[id].discovery_time = self.nodes[predecessor].discovery_time + 1;
            }
            debug!(
                process = %self.nodes[id].name,
                discovery_time = self.nodes[id].discovery_time,
                "entering node"
            );
            visitor(id, &self.nodes[id], Visit::Enter);
            self.nodes[id].color = NodeColor::Gray;

            let expand = match max_depth {
                None => true,
                // Confined to the start node.
                Some(0) => false,
                Some(depth) => self.nodes[id].discovery_time + 1 < depth,
            };
            if expand {
                for position in 0..self.edges[id].len() {
                    let successor = self.edges[id][position];
                    if self.nodes[successor].color == NodeColor::White {
                        self.nodes[successor].predecessor = Some(id);
                        queue.push_back(successor);
                    }
                }
            }

            self.nodes[id].color = NodeColor::Black;
            debug!(process = %self.nodes[id].name, "exiting node");
            visitor(id, &self.nodes[id], Visit::Exit);
        }
    }
}

impl Default for ProcessGraph {
    fn default() -> Self {
        Self::new()
    }
}
