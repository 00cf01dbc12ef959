use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

pub type ExecutionId = Uuid;
pub type InstanceId = Uuid;
pub type JobId = Uuid;

/// Graph node identifier (element id from the deployed model).
pub type NodeId = String;

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum InstanceState {
    Running,
    Completed { at: DateTime<Utc> },
    Cancelled { reason: String, at: DateTime<Utc> },
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceState::Running)
    }
}

/// One running occurrence of a process graph, rooted at one top-level execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub instance_id: InstanceId,
    pub process_key: String,
    pub root_execution: ExecutionId,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub revision: u64,
}

// ─── Execution ────────────────────────────────────────────────

/// What a parked execution is blocked on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum WaitState {
    /// External task completion via `signal`.
    UserTask,
    /// A named message, delivered via `signal` or a message job.
    Message { name: String },
    /// A timer job owns the resumption.
    Timer { job: JobId },
    /// An async-continuation job owns the resumption.
    AsyncContinuation { job: JobId },
}

/// A node in the runtime execution tree: one active or parked
/// position-in-the-graph for a process instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub instance_id: InstanceId,
    /// `None` only for the root execution.
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    /// Current graph node. `None` for an inactive scope parent between forks.
    pub node: Option<NodeId>,
    pub is_active: bool,
    /// One of several sibling branches created by a fork.
    pub is_concurrent: bool,
    /// Owns its own local variable frame.
    pub is_scope: bool,
    pub wait: Option<WaitState>,
    pub variables: BTreeMap<String, Value>,
    pub revision: u64,
}

impl Execution {
    pub fn new_root(instance_id: InstanceId, node: NodeId) -> Self {
        Execution {
            id: Uuid::now_v7(),
            instance_id,
            parent: None,
            children: Vec::new(),
            node: Some(node),
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            wait: None,
            variables: BTreeMap::new(),
            revision: 0,
        }
    }
}

// ─── Job ──────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    AsyncContinuation,
    Timer,
    Message,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum JobState {
    /// Eligible for normal due-job polling.
    Pending,
    /// Retries exhausted — operator-visible, never polled again.
    Exhausted,
}

/// Last-failure metadata kept on the job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// A persisted unit of deferred work bound to one execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub instance_id: InstanceId,
    pub execution_id: ExecutionId,
    pub kind: JobKind,
    /// Handler registry tag.
    pub handler_type: String,
    /// Opaque handler-specific payload; see [`job_config`] for timer keys.
    pub config: serde_json::Map<String, Value>,
    /// `None` means ready immediately.
    pub due: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Failed attempts so far; drives the backoff step.
    pub failures: u32,
    /// Exclusive jobs of one instance never overlap across workers.
    pub exclusive: bool,
    pub state: JobState,
    pub lock_owner: Option<String>,
    pub lock_expiry: Option<DateTime<Utc>>,
    pub last_failure: Option<FailureInfo>,
    pub created_at: DateTime<Utc>,
    pub revision: u64,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        execution_id: ExecutionId,
        kind: JobKind,
        handler_type: &str,
        config: serde_json::Map<String, Value>,
        due: Option<DateTime<Utc>>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Job {
            id: Uuid::now_v7(),
            instance_id,
            execution_id,
            kind,
            handler_type: handler_type.to_string(),
            config,
            due,
            retries,
            failures: 0,
            exclusive: true,
            state: JobState::Pending,
            lock_owner: None,
            lock_expiry: None,
            last_failure: None,
            created_at: now,
            revision: 0,
        }
    }

    pub fn locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiry.map(|e| e > now).unwrap_or(false)
    }
}

/// Documented timer configuration keys.
pub mod job_config {
    /// Schedule description text (rewritten on each repeating fire).
    pub const SCHEDULE: &str = "schedule";
    /// Boundary-event node the timer belongs to; absent for intermediate timers.
    pub const ACTIVITY_ID: &str = "activityId";
    /// Optional end-date expression bounding repeats.
    pub const END_DATE: &str = "endDate";
    /// Optional named calendar override.
    pub const CALENDAR: &str = "calendar";
    /// Message name carried by message jobs.
    pub const MESSAGE: &str = "message";
}

/// Truthiness of a variable value, used by gateway conditions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
