//! Per-node-type logic invoked when a branch arrives at a node.
//!
//! Behaviors are resolved through a tag registry populated at engine startup.
//! They never mutate the tree directly: each returns a [`BehaviorOutcome`]
//! and the runtime performs the mutation, which keeps event-emission ordering
//! in one place. "Join not yet satisfied" is an explicit outcome, not an error.

use crate::calendar::{BusinessCalendar, Schedule};
use crate::error::{EngineError, Result};
use crate::graph::{Node, NodeKind, ProcessGraph};
use crate::tree::ExecutionTree;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What the runtime should do with the execution after a behavior ran.
#[derive(Debug)]
pub enum BehaviorOutcome {
    /// Leave the node across the outgoing flow at this index.
    Take(usize),
    /// Parallel fork across every outgoing flow.
    Fork,
    /// Arrived at a join that is not yet satisfied; park inactive.
    JoinPending { waiting: u16, expected: u16 },
    /// This arrival completes the join; join-then-fork in one atomic step.
    JoinSatisfied { expected: u16 },
    /// Park until a job or an external signal resumes the execution.
    Wait(WaitState),
    /// Normal end of this branch.
    End,
    /// Kill the whole process instance.
    Terminate,
}

/// Read-only view plus job-intent buffer handed to behaviors.
pub struct ActivityContext<'a> {
    pub graph: &'a ProcessGraph,
    pub tree: &'a ExecutionTree,
    pub calendar: &'a BusinessCalendar,
    pub now: DateTime<Utc>,
    pub default_retries: u32,
    jobs: Vec<Job>,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(
        graph: &'a ProcessGraph,
        tree: &'a ExecutionTree,
        calendar: &'a BusinessCalendar,
        now: DateTime<Utc>,
        default_retries: u32,
    ) -> Self {
        ActivityContext {
            graph,
            tree,
            calendar,
            now,
            default_retries,
            jobs: Vec::new(),
        }
    }

    /// Resolve a variable through the scope chain.
    pub fn variable(&self, execution: ExecutionId, name: &str) -> Option<&Value> {
        self.tree.variable(execution, name)
    }

    /// Buffer a job intent; the engine persists it in the same unit of work.
    pub fn schedule_job(
        &mut self,
        execution: ExecutionId,
        kind: JobKind,
        handler_type: &str,
        config: serde_json::Map<String, Value>,
        due: Option<DateTime<Utc>>,
    ) -> JobId {
        let job = Job::new(
            self.tree.instance.instance_id,
            execution,
            kind,
            handler_type,
            config,
            due,
            self.default_retries,
            self.now,
        );
        let id = job.id;
        self.jobs.push(job);
        id
    }

    /// Schedule a timer job for `schedule`. Returns `None` when the schedule
    /// has no occurrence left — the caller then advances immediately.
    pub fn schedule_timer(
        &mut self,
        execution: ExecutionId,
        schedule: &str,
        boundary_activity: Option<&str>,
    ) -> Result<Option<JobId>> {
        let due = match self.calendar.resolve(schedule, self.now)? {
            Some(due) => due,
            None => return Ok(None),
        };
        let mut config = serde_json::Map::new();
        config.insert(
            job_config::SCHEDULE.to_string(),
            Value::String(schedule.to_string()),
        );
        if let Some(activity) = boundary_activity {
            config.insert(
                job_config::ACTIVITY_ID.to_string(),
                Value::String(activity.to_string()),
            );
        }
        Ok(Some(self.schedule_job(
            execution,
            JobKind::Timer,
            crate::job::TIMER_HANDLER,
            config,
            Some(due),
        )))
    }

    pub(crate) fn take_jobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }
}

/// Node-type logic. `execution` is a snapshot of the arriving execution.
pub trait Behavior: Send + Sync {
    fn execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        execution: &Execution,
        node: &Node,
    ) -> Result<BehaviorOutcome>;
}

impl std::fmt::Debug for dyn Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Behavior")
    }
}

/// Tag → behavior mapping, populated at engine startup and looked up at
/// dispatch time.
pub struct BehaviorRegistry {
    map: BTreeMap<&'static str, Arc<dyn Behavior>>,
}

impl BehaviorRegistry {
    pub fn empty() -> Self {
        BehaviorRegistry {
            map: BTreeMap::new(),
        }
    }

    /// Registry with every built-in node behavior.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register("start-event", Arc::new(StartEventBehavior));
        registry.register("end-event", Arc::new(EndEventBehavior));
        registry.register("terminate-end-event", Arc::new(TerminateEndBehavior));
        registry.register("service-task", Arc::new(ServiceTaskBehavior));
        registry.register("user-task", Arc::new(UserTaskBehavior));
        registry.register("receive-task", Arc::new(ReceiveTaskBehavior));
        registry.register("timer-catch", Arc::new(TimerCatchBehavior));
        registry.register("exclusive-gateway", Arc::new(ExclusiveGatewayBehavior));
        registry.register("parallel-gateway", Arc::new(ParallelGatewayBehavior));
        registry
    }

    pub fn register(&mut self, tag: &'static str, behavior: Arc<dyn Behavior>) {
        self.map.insert(tag, behavior);
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn Behavior>> {
        self.map
            .get(tag)
            .cloned()
            .ok_or_else(|| EngineError::UnknownBehavior(tag.to_string()))
    }
}

// ─── Built-in behaviors ───────────────────────────────────────

pub struct StartEventBehavior;

impl Behavior for StartEventBehavior {
    fn execute(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _execution: &Execution,
        _node: &Node,
    ) -> Result<BehaviorOutcome> {
        Ok(BehaviorOutcome::Take(0))
    }
}

pub struct EndEventBehavior;

impl Behavior for EndEventBehavior {
    fn execute(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _execution: &Execution,
        _node: &Node,
    ) -> Result<BehaviorOutcome> {
        Ok(BehaviorOutcome::End)
    }
}

pub struct TerminateEndBehavior;

impl Behavior for TerminateEndBehavior {
    fn execute(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _execution: &Execution,
        _node: &Node,
    ) -> Result<BehaviorOutcome> {
        Ok(BehaviorOutcome::Terminate)
    }
}

/// Service tasks carry no in-core work; with `async_before` the execution
/// parks on an async-continuation job and the worker pool resumes it.
pub struct ServiceTaskBehavior;

impl Behavior for ServiceTaskBehavior {
    fn execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        execution: &Execution,
        node: &Node,
    ) -> Result<BehaviorOutcome> {
        let NodeKind::ServiceTask { async_before } = node.kind else {
            return Err(EngineError::graph(&node.id, "expected a service task"));
        };
        if async_before {
            let job = ctx.schedule_job(
                execution.id,
                JobKind::AsyncContinuation,
                crate::job::ASYNC_CONTINUATION_HANDLER,
                serde_json::Map::new(),
                None,
            );
            Ok(BehaviorOutcome::Wait(WaitState::AsyncContinuation { job }))
        } else {
            Ok(BehaviorOutcome::Take(0))
        }
    }
}

pub struct UserTaskBehavior;

impl Behavior for UserTaskBehavior {
    fn execute(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _execution: &Execution,
        _node: &Node,
    ) -> Result<BehaviorOutcome> {
        Ok(BehaviorOutcome::Wait(WaitState::UserTask))
    }
}

pub struct ReceiveTaskBehavior;

impl Behavior for ReceiveTaskBehavior {
    fn execute(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _execution: &Execution,
        node: &Node,
    ) -> Result<BehaviorOutcome> {
        let NodeKind::ReceiveTask { message } = &node.kind else {
            return Err(EngineError::graph(&node.id, "expected a receive task"));
        };
        Ok(BehaviorOutcome::Wait(WaitState::Message {
            name: message.clone(),
        }))
    }
}

/// Intermediate timer catch. A schedule that resolves to no occurrence
/// (e.g. an exhausted `R0`) advances immediately instead of parking forever.
pub struct TimerCatchBehavior;

impl Behavior for TimerCatchBehavior {
    fn execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        execution: &Execution,
        node: &Node,
    ) -> Result<BehaviorOutcome> {
        let NodeKind::TimerCatch { schedule } = &node.kind else {
            return Err(EngineError::graph(&node.id, "expected a timer catch"));
        };
        // Validated at deploy time; re-parse here only to compute the due date.
        Schedule::parse(schedule)?;
        match ctx.schedule_timer(execution.id, schedule, None)? {
            Some(job) => Ok(BehaviorOutcome::Wait(WaitState::Timer { job })),
            None => Ok(BehaviorOutcome::Take(0)),
        }
    }
}

/// First-match conditional routing. Flows are evaluated in declared order;
/// the default flow, when declared, is considered last; zero matches is a
/// fatal graph error, never a silently dropped token.
pub struct ExclusiveGatewayBehavior;

impl Behavior for ExclusiveGatewayBehavior {
    fn execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        execution: &Execution,
        node: &Node,
    ) -> Result<BehaviorOutcome> {
        let NodeKind::ExclusiveGateway { default_flow } = &node.kind else {
            return Err(EngineError::graph(&node.id, "expected an exclusive gateway"));
        };

        let mut default_index = None;
        for (index, flow) in node.outgoing.iter().enumerate() {
            if default_flow.as_deref() == Some(flow.id.as_str()) {
                default_index = Some(index);
                continue;
            }
            match &flow.condition {
                None => return Ok(BehaviorOutcome::Take(index)),
                Some(variable) => {
                    let truthy = ctx
                        .variable(execution.id, variable)
                        .map(is_truthy)
                        .unwrap_or(false);
                    if truthy {
                        return Ok(BehaviorOutcome::Take(index));
                    }
                }
            }
        }
        match default_index {
            Some(index) => Ok(BehaviorOutcome::Take(index)),
            None => Err(EngineError::graph(&node.id, "no applicable outgoing flow")),
        }
    }
}

/// Parallel fork/join. Joining is count-based: arrival order never matters,
/// only that the number of inactive arrivals at the node reaches the declared
/// incoming-flow count. Outgoing conditions are ignored on fork.
pub struct ParallelGatewayBehavior;

impl Behavior for ParallelGatewayBehavior {
    fn execute(
        &self,
        ctx: &mut ActivityContext<'_>,
        execution: &Execution,
        node: &Node,
    ) -> Result<BehaviorOutcome> {
        let expected = ctx.graph.incoming_count(&node.id);
        if expected <= 1 {
            return Ok(BehaviorOutcome::Fork);
        }
        let already_waiting = ctx
            .tree
            .executions_at(&node.id)
            .filter(|e| e.id != execution.id && !e.is_active)
            .count() as u16;
        if already_waiting + 1 >= expected {
            Ok(BehaviorOutcome::JoinSatisfied { expected })
        } else {
            Ok(BehaviorOutcome::JoinPending {
                waiting: already_waiting + 1,
                expected,
            })
        }
    }
}
