//! Persistence seam. The engine talks to storage through [`EngineStore`] and
//! mutates exclusively through a [`UnitOfWork`], so every runtime pass commits
//! atomically or not at all.

use crate::error::Result;
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Storage backend contract. Reads return point-in-time snapshots; all writes
/// go through [`EngineStore::begin`].
#[async_trait]
pub trait EngineStore: Send + Sync {
    async fn load_instance(&self, id: InstanceId) -> Result<ProcessInstance>;

    /// Every persisted execution of the instance (its full tree).
    async fn load_executions(&self, instance: InstanceId) -> Result<Vec<Execution>>;

    async fn find_instance_of_execution(&self, execution: ExecutionId) -> Result<InstanceId>;

    async fn load_job(&self, id: JobId) -> Result<Job>;

    async fn jobs_for_instance(&self, instance: InstanceId) -> Result<Vec<Job>>;

    async fn jobs_for_execution(&self, execution: ExecutionId) -> Result<Vec<Job>>;

    /// Claim up to `limit` due jobs for `owner`, locking each until
    /// `now + lock_timeout`. The claim must honor the exclusive-job rule: at
    /// most one live-locked exclusive job per process instance across all
    /// workers, this call's own claims included.
    async fn poll_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        owner: &str,
        lock_timeout: Duration,
    ) -> Result<Vec<Job>>;

    /// Give a claimed job back without executing it. A no-op when `owner`
    /// does not hold the lock anymore.
    async fn release_lock(&self, job: JobId, owner: &str) -> Result<()>;

    async fn set_definition_suspended(&self, process_key: &str, suspended: bool) -> Result<()>;

    async fn is_definition_suspended(&self, process_key: &str) -> Result<bool>;

    fn begin(&self) -> Box<dyn UnitOfWork>;
}

/// Staged mutations applied atomically by [`UnitOfWork::commit`].
///
/// Updates carry the revision the caller loaded; a mismatch at commit time
/// fails the whole unit with [`crate::error::EngineError::Conflict`] and
/// nothing is applied. Deletes are idempotent. Dropping an uncommitted unit
/// discards it.
#[async_trait]
pub trait UnitOfWork: Send {
    fn insert_instance(&mut self, instance: ProcessInstance);
    fn update_instance(&mut self, instance: ProcessInstance);
    fn delete_instance(&mut self, id: InstanceId);

    fn insert_execution(&mut self, execution: Execution);
    fn update_execution(&mut self, execution: Execution);
    fn delete_execution(&mut self, id: ExecutionId);

    fn insert_job(&mut self, job: Job);
    fn update_job(&mut self, job: Job);
    fn delete_job(&mut self, id: JobId);

    async fn commit(self: Box<Self>) -> Result<()>;
}
