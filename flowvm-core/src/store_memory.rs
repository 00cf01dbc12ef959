//! In-memory [`EngineStore`] used by tests and single-process deployments.
//! One mutex guards the whole state; units of work validate every revision
//! check before applying anything, which gives the same atomicity a
//! transactional backend would.

use crate::error::{EngineError, Result};
use crate::store::{EngineStore, UnitOfWork};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    instances: BTreeMap<InstanceId, ProcessInstance>,
    executions: BTreeMap<ExecutionId, Execution>,
    jobs: BTreeMap<JobId, Job>,
    suspended: BTreeSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Pending job count across all instances; test helper.
    pub fn pending_job_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .count()
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn load_instance(&self, id: InstanceId) -> Result<ProcessInstance> {
        self.lock()
            .instances
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownInstance(id))
    }

    async fn load_executions(&self, instance: InstanceId) -> Result<Vec<Execution>> {
        Ok(self
            .lock()
            .executions
            .values()
            .filter(|e| e.instance_id == instance)
            .cloned()
            .collect())
    }

    async fn find_instance_of_execution(&self, execution: ExecutionId) -> Result<InstanceId> {
        self.lock()
            .executions
            .get(&execution)
            .map(|e| e.instance_id)
            .ok_or(EngineError::UnknownExecution(execution))
    }

    async fn load_job(&self, id: JobId) -> Result<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownJob(id))
    }

    async fn jobs_for_instance(&self, instance: InstanceId) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.instance_id == instance)
            .cloned()
            .collect())
    }

    async fn jobs_for_execution(&self, execution: ExecutionId) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.execution_id == execution)
            .cloned()
            .collect())
    }

    async fn poll_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        owner: &str,
        lock_timeout: Duration,
    ) -> Result<Vec<Job>> {
        let mut state = self.lock();

        // Instances with a live exclusive lock are off-limits for this poll.
        let mut blocked: BTreeSet<InstanceId> = state
            .jobs
            .values()
            .filter(|j| j.exclusive && j.locked_at(now))
            .map(|j| j.instance_id)
            .collect();

        let mut candidates: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Pending
                    && j.retries > 0
                    && !j.locked_at(now)
                    && j.due.map(|d| d <= now).unwrap_or(true)
            })
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| {
            let job = &state.jobs[id];
            (job.due, job.id)
        });

        let mut claimed = Vec::new();
        for id in candidates {
            if claimed.len() == limit {
                break;
            }
            let job = &state.jobs[&id];
            if job.exclusive && blocked.contains(&job.instance_id) {
                continue;
            }
            let instance = job.instance_id;
            let exclusive = job.exclusive;
            let job = state.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
            job.lock_owner = Some(owner.to_string());
            job.lock_expiry = Some(now + lock_timeout);
            claimed.push(job.clone());
            if exclusive {
                blocked.insert(instance);
            }
        }
        Ok(claimed)
    }

    async fn release_lock(&self, job: JobId, owner: &str) -> Result<()> {
        let mut state = self.lock();
        if let Some(job) = state.jobs.get_mut(&job) {
            if job.lock_owner.as_deref() == Some(owner) {
                job.lock_owner = None;
                job.lock_expiry = None;
            }
        }
        Ok(())
    }

    async fn set_definition_suspended(&self, process_key: &str, suspended: bool) -> Result<()> {
        let mut state = self.lock();
        if suspended {
            state.suspended.insert(process_key.to_string());
        } else {
            state.suspended.remove(process_key);
        }
        Ok(())
    }

    async fn is_definition_suspended(&self, process_key: &str) -> Result<bool> {
        Ok(self.lock().suspended.contains(process_key))
    }

    fn begin(&self) -> Box<dyn UnitOfWork> {
        Box::new(MemoryUnitOfWork {
            state: Arc::clone(&self.state),
            ops: Vec::new(),
        })
    }
}

enum Op {
    PutInstance {
        instance: ProcessInstance,
        check: Option<u64>,
    },
    DeleteInstance(InstanceId),
    PutExecution {
        execution: Execution,
        check: Option<u64>,
    },
    DeleteExecution(ExecutionId),
    PutJob {
        job: Job,
        check: Option<u64>,
    },
    DeleteJob(JobId),
}

struct MemoryUnitOfWork {
    state: Arc<Mutex<State>>,
    ops: Vec<Op>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    fn insert_instance(&mut self, instance: ProcessInstance) {
        self.ops.push(Op::PutInstance {
            instance,
            check: None,
        });
    }

    fn update_instance(&mut self, instance: ProcessInstance) {
        let check = Some(instance.revision);
        self.ops.push(Op::PutInstance { instance, check });
    }

    fn delete_instance(&mut self, id: InstanceId) {
        self.ops.push(Op::DeleteInstance(id));
    }

    fn insert_execution(&mut self, execution: Execution) {
        self.ops.push(Op::PutExecution {
            execution,
            check: None,
        });
    }

    fn update_execution(&mut self, execution: Execution) {
        let check = Some(execution.revision);
        self.ops.push(Op::PutExecution { execution, check });
    }

    fn delete_execution(&mut self, id: ExecutionId) {
        self.ops.push(Op::DeleteExecution(id));
    }

    fn insert_job(&mut self, job: Job) {
        self.ops.push(Op::PutJob { job, check: None });
    }

    fn update_job(&mut self, job: Job) {
        let check = Some(job.revision);
        self.ops.push(Op::PutJob { job, check });
    }

    fn delete_job(&mut self, id: JobId) {
        self.ops.push(Op::DeleteJob(id));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        // Validate every revision check before touching anything.
        for op in &self.ops {
            match op {
                Op::PutInstance {
                    instance,
                    check: Some(expected),
                } => {
                    let current = state
                        .instances
                        .get(&instance.instance_id)
                        .map(|i| i.revision)
                        .ok_or(EngineError::UnknownInstance(instance.instance_id))?;
                    if current != *expected {
                        return Err(EngineError::Conflict {
                            entity: "instance",
                            id: instance.instance_id,
                            expected: *expected,
                        });
                    }
                }
                Op::PutExecution {
                    execution,
                    check: Some(expected),
                } => {
                    let current = state
                        .executions
                        .get(&execution.id)
                        .map(|e| e.revision)
                        .ok_or(EngineError::UnknownExecution(execution.id))?;
                    if current != *expected {
                        return Err(EngineError::Conflict {
                            entity: "execution",
                            id: execution.id,
                            expected: *expected,
                        });
                    }
                }
                Op::PutJob {
                    job,
                    check: Some(expected),
                } => {
                    let current = state
                        .jobs
                        .get(&job.id)
                        .map(|j| j.revision)
                        .ok_or(EngineError::UnknownJob(job.id))?;
                    if current != *expected {
                        return Err(EngineError::Conflict {
                            entity: "job",
                            id: job.id,
                            expected: *expected,
                        });
                    }
                }
                _ => {}
            }
        }

        for op in self.ops {
            match op {
                Op::PutInstance { mut instance, check } => {
                    if check.is_some() {
                        instance.revision += 1;
                    }
                    state.instances.insert(instance.instance_id, instance);
                }
                Op::DeleteInstance(id) => {
                    state.instances.remove(&id);
                }
                Op::PutExecution { mut execution, check } => {
                    if check.is_some() {
                        execution.revision += 1;
                    }
                    state.executions.insert(execution.id, execution);
                }
                Op::DeleteExecution(id) => {
                    state.executions.remove(&id);
                }
                Op::PutJob { mut job, check } => {
                    if check.is_some() {
                        job.revision += 1;
                    }
                    state.jobs.insert(job.id, job);
                }
                Op::DeleteJob(id) => {
                    state.jobs.remove(&id);
                }
            }
        }
        Ok(())
    }
}
