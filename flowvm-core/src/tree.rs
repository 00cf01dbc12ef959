//! The execution tree and its interpreter — the process virtual machine.
//!
//! One process instance is a tree of execution nodes held in an arena keyed
//! by id; all tree algorithms (end-cascade, join counting) run over id
//! lookups, never pointer chasing. All mutation of one instance's tree
//! happens inside one unit of work, single-threaded, to completion:
//! "concurrent" branches are multiple active tokens advanced sequentially.

use crate::behavior::{ActivityContext, BehaviorOutcome, BehaviorRegistry};
use crate::calendar::BusinessCalendar;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventDispatcher};
use crate::graph::{Flow, Node, NodeKind, ProcessGraph};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

// ─── Execution tree (arena) ───────────────────────────────────

pub struct ExecutionTree {
    pub instance: ProcessInstance,
    executions: BTreeMap<ExecutionId, Execution>,
}

impl ExecutionTree {
    /// Fresh tree for a new instance, with the root execution placed at the
    /// graph's start node.
    pub fn new(process_key: &str, start_node: NodeId, now: DateTime<Utc>) -> Self {
        let instance_id = Uuid::now_v7();
        let root = Execution::new_root(instance_id, start_node);
        let instance = ProcessInstance {
            instance_id,
            process_key: process_key.to_string(),
            root_execution: root.id,
            state: InstanceState::Running,
            created_at: now,
            revision: 0,
        };
        let mut executions = BTreeMap::new();
        executions.insert(root.id, root);
        ExecutionTree {
            instance,
            executions,
        }
    }

    /// Rehydrate a tree from persisted rows.
    pub fn from_parts(instance: ProcessInstance, executions: Vec<Execution>) -> Self {
        ExecutionTree {
            instance,
            executions: executions.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn root(&self) -> ExecutionId {
        self.instance.root_execution
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    pub fn try_get(&self, id: ExecutionId) -> Option<&Execution> {
        self.executions.get(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Result<&Execution> {
        self.executions
            .get(&id)
            .ok_or(EngineError::UnknownExecution(id))
    }

    pub(crate) fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution> {
        self.executions
            .get_mut(&id)
            .ok_or(EngineError::UnknownExecution(id))
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.executions.values()
    }

    /// Executions currently positioned at `node`, active or not.
    pub fn executions_at<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Execution> {
        self.executions
            .values()
            .filter(move |e| e.node.as_deref() == Some(node))
    }

    /// Node ids occupied by active executions — every token in flight.
    pub fn active_node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .executions
            .values()
            .filter(|e| e.is_active)
            .filter_map(|e| e.node.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Resolve a variable through the scope chain.
    pub fn variable(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        let mut current = self.executions.get(&execution)?;
        loop {
            if let Some(value) = current.variables.get(name) {
                return Some(value);
            }
            current = self.executions.get(&current.parent?)?;
        }
    }

    pub(crate) fn create_child(&mut self, parent: ExecutionId) -> Result<ExecutionId> {
        let instance_id = self.instance.instance_id;
        let parent_exec = self
            .executions
            .get_mut(&parent)
            .ok_or(EngineError::UnknownExecution(parent))?;
        let child = Execution {
            id: Uuid::now_v7(),
            instance_id,
            parent: Some(parent),
            children: Vec::new(),
            node: None,
            is_active: true,
            is_concurrent: false,
            is_scope: false,
            wait: None,
            variables: BTreeMap::new(),
            revision: 0,
        };
        let id = child.id;
        parent_exec.children.push(id);
        self.executions.insert(id, child);
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: ExecutionId) {
        if let Some(removed) = self.executions.remove(&id) {
            if let Some(parent) = removed.parent {
                if let Some(parent_exec) = self.executions.get_mut(&parent) {
                    parent_exec.children.retain(|c| *c != id);
                }
            }
        }
    }
}

// ─── Runtime effects handed back to the engine ────────────────

/// Everything a runtime pass produced, to be persisted in one unit of work.
pub struct RuntimeEffects {
    pub tree: ExecutionTree,
    pub created_jobs: Vec<Job>,
    /// Executions whose pending jobs must be deleted (left a guarded node or
    /// ended). Deleting them in the same unit of work is what keeps boundary
    /// timers from firing spuriously later.
    pub released_executions: Vec<ExecutionId>,
    /// Executions ended during this pass; their rows are deleted.
    pub removed_executions: Vec<ExecutionId>,
}

// ─── Runtime (the interpreter) ────────────────────────────────

pub struct Runtime<'g> {
    tree: ExecutionTree,
    graph: &'g ProcessGraph,
    behaviors: &'g BehaviorRegistry,
    dispatcher: &'g EventDispatcher,
    calendar: &'g BusinessCalendar,
    now: DateTime<Utc>,
    default_retries: u32,
    created_jobs: Vec<Job>,
    released_executions: Vec<ExecutionId>,
    removed_executions: Vec<ExecutionId>,
}

impl<'g> Runtime<'g> {
    pub fn new(
        tree: ExecutionTree,
        graph: &'g ProcessGraph,
        behaviors: &'g BehaviorRegistry,
        dispatcher: &'g EventDispatcher,
        calendar: &'g BusinessCalendar,
        now: DateTime<Utc>,
        default_retries: u32,
    ) -> Self {
        Runtime {
            tree,
            graph,
            behaviors,
            dispatcher,
            calendar,
            now,
            default_retries,
            created_jobs: Vec::new(),
            released_executions: Vec::new(),
            removed_executions: Vec::new(),
        }
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn into_effects(self) -> RuntimeEffects {
        RuntimeEffects {
            tree: self.tree,
            created_jobs: self.created_jobs,
            released_executions: self.released_executions,
            removed_executions: self.removed_executions,
        }
    }

    pub(crate) fn emit(&self, event: EngineEvent) -> Result<()> {
        self.dispatcher.dispatch(&event)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn instance_id(&self) -> InstanceId {
        self.tree.instance.instance_id
    }

    /// Start the instance: set initial variables on the root scope and
    /// advance until every token reaches a wait state or the instance ends.
    pub fn start(&mut self, variables: BTreeMap<String, Value>) -> Result<()> {
        let root = self.tree.root();
        self.emit(EngineEvent::ProcessStarted {
            instance_id: self.instance_id(),
            process_key: self.tree.instance.process_key.clone(),
        })?;
        for (name, value) in variables {
            self.set_variable(root, name, value)?;
        }
        let start_node = self.graph.start_node().id.clone();
        self.emit(EngineEvent::ActivityStarted {
            instance_id: self.instance_id(),
            execution_id: root,
            node: start_node,
        })?;
        self.advance(root)
    }

    /// Repeatedly invoke the current node's behavior until this execution
    /// parks or ends. Synchronous and single-threaded for the execution;
    /// forked siblings are advanced recursively in declaration order.
    pub fn advance(&mut self, exec_id: ExecutionId) -> Result<()> {
        loop {
            if self.tree.instance.state.is_terminal() {
                return Ok(());
            }
            let snapshot = match self.tree.try_get(exec_id) {
                Some(exec) => exec.clone(),
                // Ended elsewhere (joined away, cancelled) — nothing to do.
                None => return Ok(()),
            };
            if !snapshot.is_active || snapshot.wait.is_some() {
                return Ok(());
            }
            let Some(node_id) = snapshot.node.clone() else {
                return Ok(());
            };
            let node = self.graph.node(&node_id)?.clone();
            let behavior = self.behaviors.resolve(node.kind.behavior_tag())?;

            let (outcome, jobs) = {
                let mut ctx = ActivityContext::new(
                    self.graph,
                    &self.tree,
                    self.calendar,
                    self.now,
                    self.default_retries,
                );
                let outcome = behavior.execute(&mut ctx, &snapshot, &node)?;
                (outcome, ctx.take_jobs())
            };
            for job in jobs {
                self.register_job(job)?;
            }

            match outcome {
                BehaviorOutcome::Take(index) => {
                    let flow = node.outgoing.get(index).cloned().ok_or_else(|| {
                        EngineError::graph(&node.id, format!("flow index {index} out of range"))
                    })?;
                    self.take(exec_id, &node, &flow)?;
                }
                BehaviorOutcome::Wait(wait) => {
                    self.schedule_boundary_timers(exec_id, &node)?;
                    self.tree.get_mut(exec_id)?.wait = Some(wait);
                    return Ok(());
                }
                BehaviorOutcome::End => {
                    self.end_branch(exec_id, &node)?;
                    return Ok(());
                }
                BehaviorOutcome::Terminate => {
                    self.emit(EngineEvent::ActivityCompleted {
                        instance_id: self.instance_id(),
                        execution_id: exec_id,
                        node: node.id.clone(),
                    })?;
                    // The terminating branch completed normally; take it out
                    // before the cascade so it is not reported as cancelled.
                    self.release_jobs(exec_id);
                    self.tree.remove(exec_id);
                    self.removed_executions.push(exec_id);
                    self.cancel("terminate end event reached")?;
                    return Ok(());
                }
                BehaviorOutcome::Fork => {
                    self.fork(exec_id, &node)?;
                    return Ok(());
                }
                BehaviorOutcome::JoinPending { waiting, expected } => {
                    self.emit(EngineEvent::JoinArrived {
                        instance_id: self.instance_id(),
                        gateway: node.id.clone(),
                        execution_id: exec_id,
                        waiting,
                        expected,
                    })?;
                    self.tree.get_mut(exec_id)?.is_active = false;
                    return Ok(());
                }
                BehaviorOutcome::JoinSatisfied { expected } => {
                    self.complete_join(exec_id, &node, expected)?;
                    return Ok(());
                }
            }
        }
    }

    /// Move one execution across one flow. Event order is a contract:
    /// leave old node, take flow, arrive new node.
    fn take(&mut self, exec_id: ExecutionId, from: &Node, flow: &Flow) -> Result<()> {
        self.emit(EngineEvent::ActivityCompleted {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            node: from.id.clone(),
        })?;
        self.release_jobs(exec_id);
        self.emit(EngineEvent::FlowTaken {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            flow: flow.id.clone(),
            from: from.id.clone(),
            to: flow.target.clone(),
        })?;
        {
            let exec = self.tree.get_mut(exec_id)?;
            exec.node = Some(flow.target.clone());
            exec.wait = None;
        }
        self.emit(EngineEvent::ActivityStarted {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            node: flow.target.clone(),
        })
    }

    /// Parallel fork: one new concurrent child per outgoing flow, in
    /// declaration order, each advanced in turn.
    fn fork(&mut self, exec_id: ExecutionId, node: &Node) -> Result<()> {
        self.emit(EngineEvent::ActivityCompleted {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            node: node.id.clone(),
        })?;
        self.release_jobs(exec_id);

        let snapshot = self.tree.get(exec_id)?.clone();
        let scope_id = if snapshot.is_concurrent {
            // A concurrent branch forking again: replace it with children of
            // the same scope so outer join counting stays balanced.
            let parent = snapshot
                .parent
                .ok_or(EngineError::UnknownExecution(exec_id))?;
            self.tree.remove(exec_id);
            self.removed_executions.push(exec_id);
            parent
        } else {
            let exec = self.tree.get_mut(exec_id)?;
            exec.is_active = false;
            exec.node = None;
            exec.wait = None;
            exec_id
        };

        let mut children = Vec::with_capacity(node.outgoing.len());
        for flow in &node.outgoing {
            let child_id = self.tree.create_child(scope_id)?;
            {
                let child = self.tree.get_mut(child_id)?;
                child.is_concurrent = true;
                child.node = Some(flow.target.clone());
            }
            self.emit(EngineEvent::FlowTaken {
                instance_id: self.instance_id(),
                execution_id: child_id,
                flow: flow.id.clone(),
                from: node.id.clone(),
                to: flow.target.clone(),
            })?;
            self.emit(EngineEvent::ActivityStarted {
                instance_id: self.instance_id(),
                execution_id: child_id,
                node: flow.target.clone(),
            })?;
            children.push(child_id);
        }
        self.emit(EngineEvent::GatewayForked {
            instance_id: self.instance_id(),
            gateway: node.id.clone(),
            children: children.clone(),
        })?;

        for child in children {
            self.advance(child)?;
        }
        Ok(())
    }

    /// Join-then-fork in one atomic step: end the waiting siblings, continue
    /// with the scope execution reactivated at the gateway.
    fn complete_join(&mut self, exec_id: ExecutionId, node: &Node, expected: u16) -> Result<()> {
        self.emit(EngineEvent::JoinArrived {
            instance_id: self.instance_id(),
            gateway: node.id.clone(),
            execution_id: exec_id,
            waiting: expected,
            expected,
        })?;

        let waiting: Vec<ExecutionId> = self
            .tree
            .executions_at(&node.id)
            .filter(|e| e.id != exec_id && !e.is_active)
            .map(|e| e.id)
            .collect();
        let scope_id = self.tree.get(exec_id)?.parent.unwrap_or(exec_id);

        for sibling in waiting {
            self.release_jobs(sibling);
            self.tree.remove(sibling);
            self.removed_executions.push(sibling);
        }
        if exec_id != scope_id {
            self.release_jobs(exec_id);
            self.tree.remove(exec_id);
            self.removed_executions.push(exec_id);
        }
        self.emit(EngineEvent::JoinCompleted {
            instance_id: self.instance_id(),
            gateway: node.id.clone(),
        })?;
        debug!(gateway = %node.id, expected, "parallel join satisfied");

        {
            let scope = self.tree.get_mut(scope_id)?;
            scope.node = Some(node.id.clone());
            scope.is_active = true;
            scope.wait = None;
        }
        self.fork(scope_id, node)
    }

    /// Normal end of one branch (end event reached).
    fn end_branch(&mut self, exec_id: ExecutionId, node: &Node) -> Result<()> {
        self.emit(EngineEvent::ActivityCompleted {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            node: node.id.clone(),
        })?;
        self.release_jobs(exec_id);
        let parent = self.tree.get(exec_id)?.parent;
        self.tree.remove(exec_id);
        self.removed_executions.push(exec_id);
        self.propagate_completion(parent)
    }

    /// Walk up from an ended branch, collapsing drained inactive scopes.
    /// The instance completes when the root scope drains.
    fn propagate_completion(&mut self, mut parent: Option<ExecutionId>) -> Result<()> {
        while let Some(pid) = parent {
            let scope = self.tree.get(pid)?;
            if !scope.children.is_empty() || scope.is_active || scope.wait.is_some() {
                return Ok(());
            }
            let next = scope.parent;
            if next.is_none() {
                return self.complete_instance();
            }
            self.tree.remove(pid);
            self.removed_executions.push(pid);
            parent = next;
        }
        // The ended execution was the root itself.
        self.complete_instance()
    }

    fn complete_instance(&mut self) -> Result<()> {
        let root = self.tree.root();
        if self.tree.contains(root) {
            self.release_jobs(root);
            self.tree.remove(root);
            self.removed_executions.push(root);
        }
        self.tree.instance.state = InstanceState::Completed { at: self.now };
        debug!(instance = %self.instance_id(), "process instance completed");
        self.emit(EngineEvent::ProcessCompleted {
            instance_id: self.instance_id(),
        })
    }

    /// Cancel the whole instance: end the tree depth-first in one pass.
    /// The engine deletes every pending job of the instance in the same
    /// unit of work.
    pub fn cancel(&mut self, reason: &str) -> Result<()> {
        if self.tree.instance.state.is_terminal() {
            return Ok(());
        }
        let root = self.tree.root();
        if self.tree.contains(root) {
            self.end_cascade(root, reason)?;
        }
        self.tree.instance.state = InstanceState::Cancelled {
            reason: reason.to_string(),
            at: self.now,
        };
        self.emit(EngineEvent::ProcessCancelled {
            instance_id: self.instance_id(),
            reason: reason.to_string(),
        })
    }

    /// Depth-first end: children first, then the node itself, with an
    /// activity-cancelled event for every node that still held a token.
    fn end_cascade(&mut self, exec_id: ExecutionId, reason: &str) -> Result<()> {
        let snapshot = match self.tree.try_get(exec_id) {
            Some(exec) => exec.clone(),
            None => return Ok(()),
        };
        for child in snapshot.children {
            self.end_cascade(child, reason)?;
        }
        if let Some(node) = &snapshot.node {
            if snapshot.is_active || snapshot.wait.is_some() {
                self.emit(EngineEvent::ActivityCancelled {
                    instance_id: self.instance_id(),
                    execution_id: exec_id,
                    node: node.clone(),
                    reason: reason.to_string(),
                })?;
            }
        }
        self.release_jobs(exec_id);
        self.tree.remove(exec_id);
        self.removed_executions.push(exec_id);
        Ok(())
    }

    /// External completion of a user-task or message wait.
    pub fn signal(
        &mut self,
        exec_id: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        match self.tree.get(exec_id)?.wait {
            Some(WaitState::UserTask) | Some(WaitState::Message { .. }) => {}
            _ => {
                return Err(EngineError::NotWaiting {
                    execution: exec_id,
                    expected: "user task or message".to_string(),
                })
            }
        }
        for (name, value) in variables {
            self.set_variable(exec_id, name, value)?;
        }
        self.complete_node(exec_id)
    }

    /// Whether the execution still waits on `job_id`. False for a stale job
    /// (the execution moved on), a safe no-op for the caller.
    pub fn resume_job_wait(&mut self, exec_id: ExecutionId, job_id: JobId) -> Result<bool> {
        let Some(exec) = self.tree.try_get(exec_id) else {
            return Ok(false);
        };
        let matches = matches!(
            &exec.wait,
            Some(WaitState::Timer { job }) | Some(WaitState::AsyncContinuation { job })
                if *job == job_id
        );
        Ok(matches)
    }

    /// Complete the node the execution currently occupies and keep advancing.
    pub fn complete_node(&mut self, exec_id: ExecutionId) -> Result<()> {
        let snapshot = self.tree.get(exec_id)?.clone();
        let node_id = snapshot
            .node
            .ok_or(EngineError::UnknownExecution(exec_id))?;
        let node = self.graph.node(&node_id)?.clone();
        let flow = node.outgoing.first().cloned().ok_or_else(|| {
            EngineError::graph(&node.id, "node has no outgoing flow to complete through")
        })?;
        {
            let exec = self.tree.get_mut(exec_id)?;
            exec.wait = None;
            exec.is_active = true;
        }
        self.take(exec_id, &node, &flow)?;
        self.advance(exec_id)
    }

    /// Interrupting boundary fire: cancel the guarded activity and divert
    /// the execution through the boundary node's outgoing flow.
    pub fn fire_boundary(&mut self, exec_id: ExecutionId, boundary: &str) -> Result<()> {
        let snapshot = self.tree.get(exec_id)?.clone();
        let current = snapshot
            .node
            .ok_or(EngineError::UnknownExecution(exec_id))?;
        let boundary_node = self.graph.node(boundary)?.clone();
        match &boundary_node.kind {
            NodeKind::BoundaryTimer { attached_to, .. } if *attached_to == current => {}
            _ => {
                return Err(EngineError::graph(
                    boundary,
                    "not a boundary timer of the current activity",
                ))
            }
        }
        self.emit(EngineEvent::ActivityCancelled {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            node: current,
            reason: "boundary timer fired".to_string(),
        })?;
        self.release_jobs(exec_id);
        {
            let exec = self.tree.get_mut(exec_id)?;
            exec.node = Some(boundary.to_string());
            exec.wait = None;
            exec.is_active = true;
        }
        self.emit(EngineEvent::ActivityStarted {
            instance_id: self.instance_id(),
            execution_id: exec_id,
            node: boundary.to_string(),
        })?;
        self.complete_node(exec_id)
    }

    /// Set a variable on the nearest enclosing scope.
    pub fn set_variable(
        &mut self,
        exec_id: ExecutionId,
        name: String,
        value: Value,
    ) -> Result<()> {
        let mut target = exec_id;
        loop {
            let exec = self.tree.get(target)?;
            if exec.is_scope {
                break;
            }
            match exec.parent {
                Some(parent) => target = parent,
                None => break,
            }
        }
        self.tree
            .get_mut(target)?
            .variables
            .insert(name.clone(), value.clone());
        self.emit(EngineEvent::VariableSet {
            instance_id: self.instance_id(),
            execution_id: target,
            name,
            value,
        })
    }

    /// Buffer a job and announce it.
    pub(crate) fn register_job(&mut self, job: Job) -> Result<()> {
        self.emit(EngineEvent::JobScheduled {
            instance_id: self.instance_id(),
            job_id: job.id,
            kind: job.kind,
            due: job.due,
        })?;
        self.created_jobs.push(job);
        Ok(())
    }

    /// Mark all pending jobs of this execution for deletion in the current
    /// unit of work.
    fn release_jobs(&mut self, exec_id: ExecutionId) {
        self.released_executions.push(exec_id);
    }

    /// Schedule one timer job per boundary event attached to `node`.
    fn schedule_boundary_timers(&mut self, exec_id: ExecutionId, node: &Node) -> Result<()> {
        for boundary_id in self.graph.boundary_timers(&node.id) {
            let boundary = self.graph.node(boundary_id)?;
            let NodeKind::BoundaryTimer { schedule, .. } = &boundary.kind else {
                continue;
            };
            let Some(due) = self.calendar.resolve(schedule, self.now)? else {
                continue;
            };
            let mut config = serde_json::Map::new();
            config.insert(
                job_config::SCHEDULE.to_string(),
                Value::String(schedule.clone()),
            );
            config.insert(
                job_config::ACTIVITY_ID.to_string(),
                Value::String(boundary_id.clone()),
            );
            let job = Job::new(
                self.instance_id(),
                exec_id,
                JobKind::Timer,
                crate::job::TIMER_HANDLER,
                config,
                Some(due),
                self.default_retries,
                self.now,
            );
            self.register_job(job)?;
        }
        Ok(())
    }
}
