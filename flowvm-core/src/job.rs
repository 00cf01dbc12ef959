//! Deferred work: handler registry, built-in handlers and retry backoff.
//!
//! A job is executed inside the same unit of work that loads the owning
//! instance, so handler mutations and the job deletion commit atomically.
//! Handlers are written to be safe against ghost jobs: a job whose execution
//! already moved on resolves to a no-op instead of an error.

use crate::calendar::Schedule;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::tree::Runtime;
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Handler registry tags for the built-in job kinds.
pub const TIMER_HANDLER: &str = "timer";
pub const ASYNC_CONTINUATION_HANDLER: &str = "async-continuation";
pub const MESSAGE_HANDLER: &str = "message";

// ─── Retry backoff ────────────────────────────────────────────

/// Computes the next due date after a failed attempt. `failures` counts
/// failures so far, starting at 1 for the first.
pub trait BackoffPolicy: Send + Sync {
    fn next_due(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// Doubling delay with a hard cap.
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            base: Duration::seconds(10),
            max: Duration::hours(1),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_due(&self, failures: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(2_i32.saturating_pow(exponent))
            .unwrap_or(self.max)
            .min(self.max);
        now + delay
    }
}

// ─── Handler plumbing ─────────────────────────────────────────

/// Everything a handler may touch while executing one job.
pub struct JobContext<'r, 'g> {
    pub runtime: &'r mut Runtime<'g>,
    /// The owning process definition is suspended; timers hold fire.
    pub suspended: bool,
    /// Retries given to successor jobs a handler schedules.
    pub default_retries: u32,
    /// Replacement jobs to persist in the same unit of work (a repeating
    /// timer's next occurrence).
    rescheduled: Vec<Job>,
}

impl<'r, 'g> JobContext<'r, 'g> {
    pub fn new(runtime: &'r mut Runtime<'g>, suspended: bool, default_retries: u32) -> Self {
        JobContext {
            runtime,
            suspended,
            default_retries,
            rescheduled: Vec::new(),
        }
    }

    pub fn reschedule(&mut self, job: Job) {
        self.rescheduled.push(job);
    }

    pub fn take_rescheduled(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.rescheduled)
    }
}

/// One job-kind implementation, resolved by [`Job::handler_type`].
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &'static str;

    fn execute(&self, job: &Job, ctx: &mut JobContext<'_, '_>) -> Result<()>;
}

impl std::fmt::Debug for dyn JobHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn JobHandler")
    }
}

pub struct JobHandlerRegistry {
    map: BTreeMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn empty() -> Self {
        JobHandlerRegistry {
            map: BTreeMap::new(),
        }
    }

    /// Registry with every built-in handler.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TimerHandler));
        registry.register(Arc::new(AsyncContinuationHandler));
        registry.register(Arc::new(MessageHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.map.insert(handler.handler_type(), handler);
    }

    pub fn resolve(&self, handler_type: &str) -> Result<Arc<dyn JobHandler>> {
        self.map
            .get(handler_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(handler_type.to_string()))
    }
}

// ─── Built-in handlers ────────────────────────────────────────

/// Fires boundary and intermediate timers.
///
/// With an `activityId` in the config the timer is a boundary event: firing
/// cancels the guarded activity and diverts through the boundary flow. Without
/// one it resumes a parked timer-catch wait. Either way a job that no longer
/// matches the execution's position is dropped silently.
pub struct TimerHandler;

impl JobHandler for TimerHandler {
    fn handler_type(&self) -> &'static str {
        TIMER_HANDLER
    }

    fn execute(&self, job: &Job, ctx: &mut JobContext<'_, '_>) -> Result<()> {
        if ctx.suspended {
            debug!(job = %job.id, "definition suspended; timer not fired");
            return Ok(());
        }

        let boundary = job
            .config
            .get(job_config::ACTIVITY_ID)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        match &boundary {
            Some(_) => {
                let still_guarded = ctx
                    .runtime
                    .tree()
                    .try_get(job.execution_id)
                    .map(|e| e.wait.is_some())
                    .unwrap_or(false);
                if !still_guarded {
                    debug!(job = %job.id, "guarded activity already left; timer dropped");
                    return Ok(());
                }
            }
            None => {
                if !ctx.runtime.resume_job_wait(job.execution_id, job.id)? {
                    debug!(job = %job.id, "stale timer; execution moved on");
                    return Ok(());
                }
            }
        }

        ctx.runtime.emit(EngineEvent::TimerFired {
            instance_id: job.instance_id,
            job_id: job.id,
            execution_id: job.execution_id,
        })?;
        self.reschedule_repeat(job, ctx)?;

        match boundary {
            Some(boundary) => ctx.runtime.fire_boundary(job.execution_id, &boundary),
            None => ctx.runtime.complete_node(job.execution_id),
        }
    }
}

impl TimerHandler {
    /// A repeating schedule with occurrences left re-arms itself before the
    /// fire resumes anything. The successor carries the rewritten expression
    /// (`Rn` decremented) and drops itself as stale if the wait it targets is
    /// gone by the time it comes due.
    fn reschedule_repeat(&self, job: &Job, ctx: &mut JobContext<'_, '_>) -> Result<()> {
        let Some(text) = job.config.get(job_config::SCHEDULE).and_then(|v| v.as_str()) else {
            return Ok(());
        };
        // Validated when the job was created.
        let Some(successor) = Schedule::parse(text)?.after_fire() else {
            return Ok(());
        };
        let now = ctx.runtime.now();
        let Some(due) = successor.next_due(now)? else {
            return Ok(());
        };
        let mut config = job.config.clone();
        config.insert(
            job_config::SCHEDULE.to_string(),
            Value::String(successor.to_string()),
        );
        let next = Job::new(
            job.instance_id,
            job.execution_id,
            JobKind::Timer,
            TIMER_HANDLER,
            config,
            Some(due),
            ctx.default_retries,
            now,
        );
        debug!(job = %job.id, next = %next.id, due = %due, "repeating timer re-armed");
        ctx.reschedule(next);
        Ok(())
    }
}

/// Resumes an execution parked before a service task marked async.
pub struct AsyncContinuationHandler;

impl JobHandler for AsyncContinuationHandler {
    fn handler_type(&self) -> &'static str {
        ASYNC_CONTINUATION_HANDLER
    }

    fn execute(&self, job: &Job, ctx: &mut JobContext<'_, '_>) -> Result<()> {
        if !ctx.runtime.resume_job_wait(job.execution_id, job.id)? {
            debug!(job = %job.id, "stale continuation; execution moved on");
            return Ok(());
        }
        ctx.runtime.complete_node(job.execution_id)
    }
}

/// Delivers a named message to an execution parked on a receive task.
/// The job config's `message` name must match the wait's; a mismatch or a
/// moved-on execution drops the delivery.
pub struct MessageHandler;

impl JobHandler for MessageHandler {
    fn handler_type(&self) -> &'static str {
        MESSAGE_HANDLER
    }

    fn execute(&self, job: &Job, ctx: &mut JobContext<'_, '_>) -> Result<()> {
        let expected = job
            .config
            .get(job_config::MESSAGE)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let matches = ctx
            .runtime
            .tree()
            .try_get(job.execution_id)
            .map(|e| matches!(&e.wait, Some(WaitState::Message { name }) if name == expected))
            .unwrap_or(false);
        if !matches {
            debug!(job = %job.id, message = expected, "no matching message wait; dropped");
            return Ok(());
        }
        ctx.runtime.signal(job.execution_id, BTreeMap::new())
    }
}
