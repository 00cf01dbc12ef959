//! Read-only process graph consumed by the engine. Parsing and model
//! construction live outside the core; callers hand over an already-built
//! graph through [`GraphBuilder`].

use crate::calendar::Schedule;
use crate::error::{EngineError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A directed sequence flow. The condition, when present, names a process
/// variable evaluated for truthiness at routing time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub target: NodeId,
    pub condition: Option<String>,
}

/// Per-node behavior discriminator. The behavior registry resolves the
/// matching implementation by [`NodeKind::behavior_tag`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum NodeKind {
    Start,
    End,
    /// Ends the entire process instance, cancelling every other branch.
    TerminateEnd,
    ServiceTask {
        /// Park on an async-continuation job before executing.
        async_before: bool,
    },
    UserTask,
    ReceiveTask {
        message: String,
    },
    /// Intermediate timer catch event.
    TimerCatch {
        schedule: String,
    },
    ExclusiveGateway {
        /// Flow id taken when no condition matches.
        default_flow: Option<String>,
    },
    ParallelGateway,
    /// Timer attached to an activity's boundary. Firing cancels the activity
    /// and diverts through this node's outgoing flow.
    BoundaryTimer {
        attached_to: NodeId,
        schedule: String,
    },
}

impl NodeKind {
    pub fn behavior_tag(&self) -> &'static str {
        match self {
            NodeKind::Start => "start-event",
            NodeKind::End => "end-event",
            NodeKind::TerminateEnd => "terminate-end-event",
            NodeKind::ServiceTask { .. } => "service-task",
            NodeKind::UserTask => "user-task",
            NodeKind::ReceiveTask { .. } => "receive-task",
            NodeKind::TimerCatch { .. } => "timer-catch",
            NodeKind::ExclusiveGateway { .. } => "exclusive-gateway",
            NodeKind::ParallelGateway => "parallel-gateway",
            NodeKind::BoundaryTimer { .. } => "boundary-timer",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Outgoing flows in declaration order. Declaration order is a contract:
    /// exclusive gateways evaluate it first-match, parallel forks spawn in it.
    pub outgoing: Vec<Flow>,
}

/// Immutable at runtime; the engine only reads it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessGraph {
    pub process_key: String,
    nodes: BTreeMap<NodeId, Node>,
    start: NodeId,
    /// Incoming-flow counts, computed at build time for join logic.
    incoming: BTreeMap<NodeId, u16>,
    /// Activity id → boundary timer nodes attached to it.
    boundaries: BTreeMap<NodeId, Vec<NodeId>>,
}

impl ProcessGraph {
    pub fn node(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::graph(id, "unknown node"))
    }

    pub fn start_node(&self) -> &Node {
        // Validated at build time.
        &self.nodes[&self.start]
    }

    pub fn incoming_count(&self, id: &str) -> u16 {
        self.incoming.get(id).copied().unwrap_or(0)
    }

    pub fn boundary_timers(&self, activity: &str) -> &[NodeId] {
        self.boundaries
            .get(activity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}

/// Builder used by deployment code and tests. `build()` validates the graph
/// and fails fast with [`EngineError::Graph`] or [`EngineError::ScheduleParse`].
pub struct GraphBuilder {
    process_key: String,
    nodes: Vec<Node>,
    flow_seq: u32,
    dangling: Vec<(NodeId, String)>,
}

impl GraphBuilder {
    pub fn new(process_key: impl Into<String>) -> Self {
        GraphBuilder {
            process_key: process_key.into(),
            nodes: Vec::new(),
            flow_seq: 0,
            dangling: Vec::new(),
        }
    }

    pub fn node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(Node {
            id: id.into(),
            kind,
            outgoing: Vec::new(),
        });
        self
    }

    pub fn flow(self, from: &str, to: &str) -> Self {
        self.flow_with(from, to, None)
    }

    /// Conditional flow: taken when the named variable is truthy.
    pub fn flow_if(self, from: &str, to: &str, condition: &str) -> Self {
        self.flow_with(from, to, Some(condition.to_string()))
    }

    fn flow_with(mut self, from: &str, to: &str, condition: Option<String>) -> Self {
        self.flow_seq += 1;
        let flow = Flow {
            id: format!("flow-{}", self.flow_seq),
            target: to.to_string(),
            condition,
        };
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == from) {
            node.outgoing.push(flow);
        } else {
            self.dangling.push((from.to_string(), flow.id));
        }
        self
    }

    pub fn build(self) -> Result<ProcessGraph> {
        if let Some((from, flow_id)) = self.dangling.first() {
            return Err(EngineError::graph(
                from.as_str(),
                format!("flow '{flow_id}' declared before its source node"),
            ));
        }
        let mut nodes = BTreeMap::new();
        for node in self.nodes {
            if nodes.insert(node.id.clone(), node).is_some() {
                return Err(EngineError::graph(
                    self.process_key.as_str(),
                    "duplicate node id",
                ));
            }
        }

        let start = nodes
            .values()
            .filter(|n| n.kind == NodeKind::Start)
            .map(|n| n.id.clone())
            .collect::<Vec<_>>();
        let start = match start.as_slice() {
            [only] => only.clone(),
            [] => {
                return Err(EngineError::graph(
                    self.process_key.as_str(),
                    "no start event",
                ))
            }
            _ => {
                return Err(EngineError::graph(
                    self.process_key.as_str(),
                    "more than one start event",
                ))
            }
        };

        let mut incoming: BTreeMap<NodeId, u16> = BTreeMap::new();
        let mut boundaries: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

        for node in nodes.values() {
            for flow in &node.outgoing {
                if !nodes.contains_key(&flow.target) {
                    return Err(EngineError::graph(
                        &flow.target,
                        format!("flow '{}' targets an unknown node", flow.id),
                    ));
                }
                *incoming.entry(flow.target.clone()).or_default() += 1;
            }

            match &node.kind {
                NodeKind::End | NodeKind::TerminateEnd => {
                    if !node.outgoing.is_empty() {
                        return Err(EngineError::graph(&node.id, "end event has outgoing flows"));
                    }
                }
                NodeKind::ExclusiveGateway { default_flow } => {
                    if node.outgoing.is_empty() {
                        return Err(EngineError::graph(&node.id, "gateway has no outgoing flows"));
                    }
                    if let Some(df) = default_flow {
                        if !node.outgoing.iter().any(|f| &f.id == df) {
                            return Err(EngineError::graph(
                                &node.id,
                                format!("default flow '{df}' is not an outgoing flow"),
                            ));
                        }
                    }
                }
                NodeKind::ParallelGateway => {
                    if node.outgoing.is_empty() {
                        return Err(EngineError::graph(&node.id, "gateway has no outgoing flows"));
                    }
                }
                NodeKind::TimerCatch { schedule } => {
                    // Eager parse: schedule errors surface at deploy time.
                    Schedule::parse(schedule)?;
                    require_single_outgoing(node)?;
                }
                NodeKind::BoundaryTimer {
                    attached_to,
                    schedule,
                } => {
                    Schedule::parse(schedule)?;
                    let host = nodes.get(attached_to).ok_or_else(|| {
                        EngineError::graph(&node.id, "boundary timer attached to unknown node")
                    })?;
                    if !matches!(
                        host.kind,
                        NodeKind::UserTask
                            | NodeKind::ServiceTask { .. }
                            | NodeKind::ReceiveTask { .. }
                    ) {
                        return Err(EngineError::graph(
                            &node.id,
                            "boundary timer must be attached to a task",
                        ));
                    }
                    require_single_outgoing(node)?;
                    boundaries
                        .entry(attached_to.clone())
                        .or_default()
                        .push(node.id.clone());
                }
                NodeKind::Start
                | NodeKind::ServiceTask { .. }
                | NodeKind::UserTask
                | NodeKind::ReceiveTask { .. } => require_single_outgoing(node)?,
            }
        }

        for node in nodes.values() {
            if matches!(node.kind, NodeKind::BoundaryTimer { .. })
                && incoming.get(&node.id).copied().unwrap_or(0) > 0
            {
                return Err(EngineError::graph(
                    &node.id,
                    "boundary timer cannot have incoming flows",
                ));
            }
        }

        // A branch looping back into an unsatisfied parallel join has no
        // defined outcome; reject the shape outright.
        for node in nodes.values() {
            if node.kind == NodeKind::ParallelGateway
                && incoming.get(&node.id).copied().unwrap_or(0) > 1
                && reaches(&nodes, &node.outgoing, &node.id)
            {
                return Err(EngineError::graph(
                    &node.id,
                    "parallel join is re-entrant (loop back into its own join)",
                ));
            }
        }

        Ok(ProcessGraph {
            process_key: self.process_key,
            nodes,
            start,
            incoming,
            boundaries,
        })
    }
}

fn require_single_outgoing(node: &Node) -> Result<()> {
    if node.outgoing.len() != 1 {
        return Err(EngineError::graph(
            &node.id,
            format!("expected exactly one outgoing flow, found {}", node.outgoing.len()),
        ));
    }
    Ok(())
}

/// Depth-first reachability from `from` flows to `target`.
fn reaches(nodes: &BTreeMap<NodeId, Node>, from: &[Flow], target: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = from.iter().map(|f| f.target.as_str()).collect();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id.to_string()) {
            continue;
        }
        if let Some(node) = nodes.get(id) {
            stack.extend(node.outgoing.iter().map(|f| f.target.as_str()));
        }
    }
    false
}
