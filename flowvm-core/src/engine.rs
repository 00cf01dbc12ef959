//! Engine facade: the external API surface and the glue between the
//! interpreter, the job subsystem and the store.
//!
//! Every public operation is one unit of work. The runtime pass runs against
//! an in-memory copy of the instance's tree; its effects (tree diff, created
//! jobs, job releases) are staged on a [`UnitOfWork`] and committed atomically.
//! An error anywhere before the commit leaves the store untouched.

use crate::behavior::BehaviorRegistry;
use crate::calendar::BusinessCalendar;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventDispatcher};
use crate::graph::ProcessGraph;
use crate::job::{BackoffPolicy, ExponentialBackoff, JobContext, JobHandler, JobHandlerRegistry};
use crate::store::{EngineStore, UnitOfWork};
use crate::tree::{ExecutionTree, Runtime, RuntimeEffects};
use crate::types::*;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Tuning knobs, deserializable from the host's configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retries a new job starts with.
    pub default_retries: u32,
    /// How long a claimed job stays locked before another worker may take it.
    pub lock_timeout_secs: u64,
    pub worker_count: usize,
    /// Idle sleep between empty poll cycles.
    pub poll_interval_ms: u64,
    /// Jobs claimed per poll cycle.
    pub batch_size: usize,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            default_retries: 3,
            lock_timeout_secs: 300,
            worker_count: 4,
            poll_interval_ms: 1000,
            batch_size: 10,
            backoff_base_secs: 10,
            backoff_max_secs: 3600,
        }
    }
}

/// What the loaded state looked like before a runtime pass, so the commit can
/// tell inserts from revision-checked updates.
struct PriorState {
    instance_exists: bool,
    executions: BTreeSet<ExecutionId>,
}

impl PriorState {
    fn fresh() -> Self {
        PriorState {
            instance_exists: false,
            executions: BTreeSet::new(),
        }
    }
}

pub struct Engine {
    store: Arc<dyn EngineStore>,
    config: EngineConfig,
    graphs: RwLock<BTreeMap<String, Arc<ProcessGraph>>>,
    behaviors: BehaviorRegistry,
    handlers: JobHandlerRegistry,
    dispatcher: EventDispatcher,
    calendar: BusinessCalendar,
    backoff: Box<dyn BackoffPolicy>,
}

impl Engine {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn EngineStore>, config: EngineConfig) -> Self {
        let backoff = Box::new(ExponentialBackoff {
            base: Duration::seconds(config.backoff_base_secs as i64),
            max: Duration::seconds(config.backoff_max_secs as i64),
        });
        Engine {
            store,
            config,
            graphs: RwLock::new(BTreeMap::new()),
            behaviors: BehaviorRegistry::standard(),
            handlers: JobHandlerRegistry::standard(),
            dispatcher: EventDispatcher::new(),
            calendar: BusinessCalendar::new(),
            backoff,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Listener registration point; the dispatcher is owned by this engine
    /// instance, never ambient.
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Extension point for job kinds beyond the built-ins.
    pub fn register_handler(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.register(handler);
    }

    /// Make a validated graph startable under its process key.
    pub fn deploy(&self, graph: ProcessGraph) -> Arc<ProcessGraph> {
        let graph = Arc::new(graph);
        self.graphs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(graph.process_key.clone(), Arc::clone(&graph));
        info!(process_key = %graph.process_key, "process graph deployed");
        graph
    }

    fn graph_for(&self, process_key: &str) -> Result<Arc<ProcessGraph>> {
        self.graphs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(process_key)
            .cloned()
            .ok_or_else(|| EngineError::graph(process_key, "no deployed graph for process key"))
    }

    // ─── External caller surface ──────────────────────────────

    /// Start a new instance of a deployed graph and advance it until every
    /// token reaches a wait state or the instance ends.
    pub async fn start_process_instance(
        &self,
        process_key: &str,
        variables: BTreeMap<String, Value>,
    ) -> Result<InstanceId> {
        let graph = self.graph_for(process_key)?;
        let now = Utc::now();
        let tree = ExecutionTree::new(process_key, graph.start_node().id.clone(), now);
        let mut runtime = self.runtime(tree, &graph, now);
        runtime.start(variables)?;
        let effects = runtime.into_effects();
        let instance_id = effects.tree.instance.instance_id;
        self.persist(effects, PriorState::fresh(), Vec::new(), None)
            .await?;
        info!(instance = %instance_id, process_key, "process instance started");
        Ok(instance_id)
    }

    /// Complete a user-task or message wait on one execution.
    pub async fn signal(
        &self,
        execution_id: ExecutionId,
        variables: BTreeMap<String, Value>,
    ) -> Result<()> {
        let instance_id = self.store.find_instance_of_execution(execution_id).await?;
        let (graph, tree, prior) = self.load(instance_id).await?;
        let mut runtime = self.runtime(tree, &graph, Utc::now());
        runtime.signal(execution_id, variables)?;
        self.persist(runtime.into_effects(), prior, Vec::new(), None)
            .await
    }

    /// Node ids occupied by active tokens — the quiescent wait-state view.
    pub async fn get_active_activity_ids(&self, instance_id: InstanceId) -> Result<Vec<NodeId>> {
        let instance = self.store.load_instance(instance_id).await?;
        let executions = self.store.load_executions(instance_id).await?;
        Ok(ExecutionTree::from_parts(instance, executions).active_node_ids())
    }

    /// Cancel the whole instance: the tree cascade and the deletion of every
    /// pending job of the instance commit in one unit of work.
    pub async fn cancel(&self, instance_id: InstanceId, reason: &str) -> Result<()> {
        let (graph, tree, prior) = self.load(instance_id).await?;
        let mut runtime = self.runtime(tree, &graph, Utc::now());
        runtime.cancel(reason)?;
        let pending: Vec<Job> = self
            .store
            .jobs_for_instance(instance_id)
            .await?
            .into_iter()
            .filter(|j| j.state == JobState::Pending)
            .collect();
        self.persist(runtime.into_effects(), prior, pending, None)
            .await?;
        info!(instance = %instance_id, reason, "process instance cancelled");
        Ok(())
    }

    /// Create a job directly, outside any runtime pass — the asynchronous
    /// delivery path for messages. `None` due means immediately eligible.
    pub async fn schedule_job(
        &self,
        execution_id: ExecutionId,
        kind: JobKind,
        handler_type: &str,
        config: serde_json::Map<String, Value>,
        due: Option<DateTime<Utc>>,
    ) -> Result<JobId> {
        self.handlers.resolve(handler_type)?;
        let instance_id = self.store.find_instance_of_execution(execution_id).await?;
        let job = Job::new(
            instance_id,
            execution_id,
            kind,
            handler_type,
            config,
            due,
            self.config.default_retries,
            Utc::now(),
        );
        let job_id = job.id;
        self.dispatcher.dispatch(&EngineEvent::JobScheduled {
            instance_id,
            job_id,
            kind,
            due,
        })?;
        let mut uow = self.store.begin();
        uow.insert_job(job);
        uow.commit().await?;
        Ok(job_id)
    }

    pub async fn suspend_definition(&self, process_key: &str) -> Result<()> {
        self.store.set_definition_suspended(process_key, true).await
    }

    pub async fn activate_definition(&self, process_key: &str) -> Result<()> {
        self.store
            .set_definition_suspended(process_key, false)
            .await
    }

    // ─── Worker pool surface ──────────────────────────────────

    pub async fn poll_and_execute_due_jobs(&self, batch: usize) -> Result<usize> {
        self.poll_and_execute_as("engine", batch).await
    }

    /// One poll cycle for `owner`: claim due jobs, run each in its own unit
    /// of work, route failures through the retry path. Returns the number of
    /// jobs claimed.
    pub async fn poll_and_execute_as(&self, owner: &str, batch: usize) -> Result<usize> {
        let now = Utc::now();
        let lock_timeout = Duration::seconds(self.config.lock_timeout_secs as i64);
        let jobs = self
            .store
            .poll_due_jobs(now, batch, owner, lock_timeout)
            .await?;
        let claimed = jobs.len();
        for job in &jobs {
            if let Err(err) = self.execute_job(job).await {
                warn!(job = %job.id, error = %err, "job execution failed");
                self.on_failure(job, &err).await;
            }
        }
        Ok(claimed)
    }

    /// Run one claimed job inside one unit of work: resolve the handler,
    /// invoke it against the instance's tree, delete the job on success.
    pub async fn execute_job(&self, job: &Job) -> Result<()> {
        let now = Utc::now();
        let instance = match self.store.load_instance(job.instance_id).await {
            Ok(instance) => instance,
            // The instance is gone; the job is a leftover and just goes away.
            Err(EngineError::UnknownInstance(_)) => return self.delete_job_only(job.id).await,
            Err(err) => return Err(err),
        };
        if instance.state.is_terminal() {
            return self.delete_job_only(job.id).await;
        }
        let graph = self.graph_for(&instance.process_key)?;
        let suspended = self
            .store
            .is_definition_suspended(&instance.process_key)
            .await?;
        let executions = self.store.load_executions(job.instance_id).await?;
        let prior = PriorState {
            instance_exists: true,
            executions: executions.iter().map(|e| e.id).collect(),
        };
        let tree = ExecutionTree::from_parts(instance, executions);
        let mut runtime = self.runtime(tree, &graph, now);

        let handler = self.handlers.resolve(&job.handler_type)?;
        let mut ctx = JobContext::new(&mut runtime, suspended, self.config.default_retries);
        handler.execute(job, &mut ctx)?;
        let mut rearmed = ctx.take_rescheduled();

        let mut effects = runtime.into_effects();
        effects.created_jobs.append(&mut rearmed);
        self.persist(effects, prior, Vec::new(), Some(job.id)).await
    }

    /// Failure bookkeeping in a fresh unit of work, after the failed attempt
    /// rolled back. Must not throw: its own failure leaves the job locked
    /// until the lock expires, which the next poll cycle recovers from.
    pub async fn on_failure(&self, job: &Job, error: &EngineError) {
        if let Err(err) = self.record_failure(job, error).await {
            warn!(
                job = %job.id,
                error = %err,
                "failure bookkeeping failed; job left for the next poll cycle"
            );
        }
    }

    async fn record_failure(&self, job: &Job, error: &EngineError) -> Result<()> {
        let now = Utc::now();
        let mut fresh = self.store.load_job(job.id).await?;
        fresh.retries = fresh.retries.saturating_sub(1);
        fresh.failures = fresh.failures.saturating_add(1);
        fresh.last_failure = Some(FailureInfo {
            message: error.to_string(),
            failed_at: now,
        });
        fresh.lock_owner = None;
        fresh.lock_expiry = None;

        if fresh.retries == 0 || error.is_fatal() {
            fresh.retries = 0;
            fresh.state = JobState::Exhausted;
            self.dispatcher.dispatch(&EngineEvent::JobRetriesExhausted {
                instance_id: fresh.instance_id,
                job_id: fresh.id,
                message: error.to_string(),
            })?;
            warn!(job = %fresh.id, error = %error, "job retries exhausted");
        } else {
            fresh.due = Some(self.backoff.next_due(fresh.failures, now));
            self.dispatcher.dispatch(&EngineEvent::JobFailed {
                instance_id: fresh.instance_id,
                job_id: fresh.id,
                retries_left: fresh.retries,
                message: error.to_string(),
            })?;
            debug!(job = %fresh.id, retries_left = fresh.retries, due = ?fresh.due, "job rescheduled");
        }

        let mut uow = self.store.begin();
        uow.update_job(fresh);
        uow.commit().await
    }

    // ─── Internals ────────────────────────────────────────────

    fn runtime<'g>(
        &'g self,
        tree: ExecutionTree,
        graph: &'g ProcessGraph,
        now: DateTime<Utc>,
    ) -> Runtime<'g> {
        Runtime::new(
            tree,
            graph,
            &self.behaviors,
            &self.dispatcher,
            &self.calendar,
            now,
            self.config.default_retries,
        )
    }

    async fn load(
        &self,
        instance_id: InstanceId,
    ) -> Result<(Arc<ProcessGraph>, ExecutionTree, PriorState)> {
        let instance = self.store.load_instance(instance_id).await?;
        let graph = self.graph_for(&instance.process_key)?;
        let executions = self.store.load_executions(instance_id).await?;
        let prior = PriorState {
            instance_exists: true,
            executions: executions.iter().map(|e| e.id).collect(),
        };
        Ok((graph, ExecutionTree::from_parts(instance, executions), prior))
    }

    async fn delete_job_only(&self, job_id: JobId) -> Result<()> {
        debug!(job = %job_id, "deleting job with no live instance");
        let mut uow = self.store.begin();
        uow.delete_job(job_id);
        uow.commit().await
    }

    /// Stage one runtime pass's effects and commit them atomically.
    ///
    /// `cancelled_jobs` are deleted with a `JobCancelled` event each;
    /// `completed_job` is the successfully executed job, deleted silently.
    /// Jobs of released executions are deleted here too — this is what keeps
    /// a boundary timer from firing after its activity completed.
    async fn persist(
        &self,
        effects: RuntimeEffects,
        prior: PriorState,
        cancelled_jobs: Vec<Job>,
        completed_job: Option<JobId>,
    ) -> Result<()> {
        let mut uow = self.store.begin();

        let instance = effects.tree.instance.clone();
        if prior.instance_exists {
            uow.update_instance(instance);
        } else {
            uow.insert_instance(instance);
        }

        for execution in effects.tree.executions() {
            if prior.executions.contains(&execution.id) {
                uow.update_execution(execution.clone());
            } else {
                uow.insert_execution(execution.clone());
            }
        }
        for id in &effects.removed_executions {
            if prior.executions.contains(id) {
                uow.delete_execution(*id);
            }
        }

        let mut deleted: BTreeSet<JobId> = BTreeSet::new();
        if let Some(job_id) = completed_job {
            uow.delete_job(job_id);
            deleted.insert(job_id);
        }
        for job in cancelled_jobs {
            if deleted.insert(job.id) {
                self.dispatcher.dispatch(&EngineEvent::JobCancelled {
                    instance_id: job.instance_id,
                    job_id: job.id,
                })?;
                uow.delete_job(job.id);
            }
        }
        for execution_id in &effects.released_executions {
            for job in self.store.jobs_for_execution(*execution_id).await? {
                if job.state == JobState::Pending && deleted.insert(job.id) {
                    self.dispatcher.dispatch(&EngineEvent::JobCancelled {
                        instance_id: job.instance_id,
                        job_id: job.id,
                    })?;
                    uow.delete_job(job.id);
                }
            }
        }

        for job in effects.created_jobs {
            uow.insert_job(job);
        }

        uow.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, RecordingListener};
    use crate::graph::{GraphBuilder, NodeKind};
    use crate::store_memory::MemoryStore;
    use anyhow::anyhow;
    use serde_json::json;

    fn engine_over(store: &MemoryStore) -> Engine {
        Engine::new(Arc::new(store.clone()))
    }

    fn approval_graph() -> ProcessGraph {
        GraphBuilder::new("approval")
            .node("start", NodeKind::Start)
            .node("review", NodeKind::UserTask)
            .node("decide", NodeKind::ExclusiveGateway { default_flow: None })
            .node("ship", NodeKind::End)
            .node("reject", NodeKind::End)
            .flow("start", "review")
            .flow("review", "decide")
            .flow_if("decide", "ship", "approved")
            .flow("decide", "reject")
            .build()
            .unwrap()
    }

    fn async_graph() -> ProcessGraph {
        GraphBuilder::new("background")
            .node("start", NodeKind::Start)
            .node("charge", NodeKind::ServiceTask { async_before: true })
            .node("end", NodeKind::End)
            .flow("start", "charge")
            .flow("charge", "end")
            .build()
            .unwrap()
    }

    fn guarded_fork_graph() -> ProcessGraph {
        GraphBuilder::new("guarded-fork")
            .node("start", NodeKind::Start)
            .node("fork", NodeKind::ParallelGateway)
            .node("a", NodeKind::UserTask)
            .node("b", NodeKind::UserTask)
            .node(
                "a-deadline",
                NodeKind::BoundaryTimer {
                    attached_to: "a".into(),
                    schedule: "PT1H".into(),
                },
            )
            .node(
                "b-deadline",
                NodeKind::BoundaryTimer {
                    attached_to: "b".into(),
                    schedule: "PT1H".into(),
                },
            )
            .node("join", NodeKind::ParallelGateway)
            .node("end", NodeKind::End)
            .node("a-escalated", NodeKind::End)
            .node("b-escalated", NodeKind::End)
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end")
            .flow("a-deadline", "a-escalated")
            .flow("b-deadline", "b-escalated")
            .build()
            .unwrap()
    }

    async fn waiting_execution(store: &MemoryStore, instance: InstanceId) -> ExecutionId {
        store
            .load_executions(instance)
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.wait.is_some())
            .map(|e| e.id)
            .unwrap()
    }

    #[tokio::test]
    async fn start_signal_and_complete_through_the_store() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(approval_graph());

        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(
            engine.get_active_activity_ids(instance).await.unwrap(),
            vec!["review"]
        );

        let review = waiting_execution(&store, instance).await;
        let mut vars = BTreeMap::new();
        vars.insert("approved".to_string(), json!(true));
        engine.signal(review, vars).await.unwrap();

        let loaded = store.load_instance(instance).await.unwrap();
        assert!(matches!(loaded.state, InstanceState::Completed { .. }));
        assert!(store.load_executions(instance).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn starting_an_undeployed_key_is_a_graph_error() {
        let engine = engine_over(&MemoryStore::new());
        let err = engine
            .start_process_instance("nope", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Graph { .. }));
    }

    #[tokio::test]
    async fn async_continuation_is_driven_by_polling() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(async_graph());

        let instance = engine
            .start_process_instance("background", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.pending_job_count(), 1);
        assert_eq!(
            engine.get_active_activity_ids(instance).await.unwrap(),
            vec!["charge"]
        );

        let executed = engine.poll_and_execute_due_jobs(10).await.unwrap();
        assert_eq!(executed, 1);
        assert_eq!(store.pending_job_count(), 0);
        let loaded = store.load_instance(instance).await.unwrap();
        assert!(matches!(loaded.state, InstanceState::Completed { .. }));
    }

    #[tokio::test]
    async fn failed_runtime_pass_persists_nothing() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        // Exclusive gateway with no matching flow fails during start.
        let graph = GraphBuilder::new("broken")
            .node("start", NodeKind::Start)
            .node("decide", NodeKind::ExclusiveGateway { default_flow: None })
            .node("end", NodeKind::End)
            .flow("start", "decide")
            .flow_if("decide", "end", "never-set")
            .build()
            .unwrap();
        engine.deploy(graph);

        let err = engine
            .start_process_instance("broken", BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Graph { .. }));
        assert_eq!(store.pending_job_count(), 0);
        // No instance row either: the unit of work never committed.
        assert!(store
            .poll_due_jobs(Utc::now(), 10, "w", Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());
    }

    struct ExplodingHandler;

    impl JobHandler for ExplodingHandler {
        fn handler_type(&self) -> &'static str {
            "explode"
        }
        fn execute(&self, _job: &Job, _ctx: &mut JobContext<'_, '_>) -> Result<()> {
            Err(EngineError::Transient(anyhow!("downstream unavailable")))
        }
    }

    #[tokio::test]
    async fn retries_step_down_to_exhausted() {
        let store = MemoryStore::new();
        let mut engine = engine_over(&store);
        engine.register_handler(Arc::new(ExplodingHandler));
        engine.deploy(approval_graph());
        let recorder = RecordingListener::new();
        engine.dispatcher().subscribe(recorder.clone());

        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        let execution = waiting_execution(&store, instance).await;
        let job = Job::new(
            instance,
            execution,
            JobKind::Message,
            "explode",
            serde_json::Map::new(),
            None,
            3,
            Utc::now(),
        );
        let mut uow = store.begin();
        uow.insert_job(job.clone());
        uow.commit().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let current = store.load_job(job.id).await.unwrap();
            seen.push(current.retries);
            let err = engine.execute_job(&current).await.unwrap_err();
            engine.on_failure(&current, &err).await;
        }
        assert_eq!(seen, vec![3, 2, 1]);

        let last = store.load_job(job.id).await.unwrap();
        assert_eq!(last.retries, 0);
        assert_eq!(last.state, JobState::Exhausted);
        assert!(last.last_failure.is_some());
        assert_eq!(recorder.count_of(EventKind::JobFailed), 2);
        assert_eq!(recorder.count_of(EventKind::JobRetriesExhausted), 1);

        // Exhausted jobs are invisible to the worker pool.
        let claimed = store
            .poll_due_jobs(
                Utc::now() + Duration::days(1),
                10,
                "w",
                Duration::minutes(1),
            )
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn failure_path_pushes_due_by_backoff() {
        let store = MemoryStore::new();
        let mut engine = engine_over(&store);
        engine.register_handler(Arc::new(ExplodingHandler));
        engine.deploy(approval_graph());

        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        let execution = waiting_execution(&store, instance).await;
        let job = Job::new(
            instance,
            execution,
            JobKind::Message,
            "explode",
            serde_json::Map::new(),
            None,
            3,
            Utc::now(),
        );
        let mut uow = store.begin();
        uow.insert_job(job.clone());
        uow.commit().await.unwrap();

        let before = Utc::now();
        let err = engine.execute_job(&job).await.unwrap_err();
        engine.on_failure(&job, &err).await;

        let updated = store.load_job(job.id).await.unwrap();
        assert_eq!(updated.retries, 2);
        let due = updated.due.expect("rescheduled with a due date");
        assert!(due >= before + Duration::seconds(10));
        assert!(updated.lock_owner.is_none(), "lock released for the retry");
    }

    #[tokio::test]
    async fn backoff_grows_with_the_job_failure_count_not_the_default_budget() {
        let store = MemoryStore::new();
        let mut engine = engine_over(&store);
        engine.register_handler(Arc::new(ExplodingHandler));
        engine.deploy(approval_graph());

        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        let execution = waiting_execution(&store, instance).await;
        // Budget well above the configured default of 3.
        let job = Job::new(
            instance,
            execution,
            JobKind::Message,
            "explode",
            serde_json::Map::new(),
            None,
            10,
            Utc::now(),
        );
        let mut uow = store.begin();
        uow.insert_job(job.clone());
        uow.commit().await.unwrap();

        let err = engine.execute_job(&job).await.unwrap_err();
        engine.on_failure(&job, &err).await;
        let after_first = store.load_job(job.id).await.unwrap();
        assert_eq!(after_first.failures, 1);

        let before = Utc::now();
        let err = engine.execute_job(&after_first).await.unwrap_err();
        engine.on_failure(&after_first, &err).await;

        let after_second = store.load_job(job.id).await.unwrap();
        assert_eq!(after_second.retries, 8);
        assert_eq!(after_second.failures, 2);
        // Second failure doubles the base delay.
        let due = after_second.due.expect("rescheduled with a due date");
        assert!(due >= before + Duration::seconds(20));
        assert!(due < before + Duration::seconds(40));
    }

    #[tokio::test]
    async fn fatal_errors_skip_the_retry_path() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(approval_graph());
        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        let execution = waiting_execution(&store, instance).await;
        // No handler registered under this tag: a fatal lookup error.
        let job = Job::new(
            instance,
            execution,
            JobKind::Message,
            "unregistered",
            serde_json::Map::new(),
            None,
            3,
            Utc::now(),
        );
        let mut uow = store.begin();
        uow.insert_job(job.clone());
        uow.commit().await.unwrap();

        let err = engine.execute_job(&job).await.unwrap_err();
        engine.on_failure(&job, &err).await;
        let updated = store.load_job(job.id).await.unwrap();
        assert_eq!(updated.state, JobState::Exhausted);
    }

    #[tokio::test]
    async fn cancel_removes_the_tree_and_every_pending_job() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(guarded_fork_graph());
        let recorder = RecordingListener::new();
        engine.dispatcher().subscribe(recorder.clone());

        let instance = engine
            .start_process_instance("guarded-fork", BTreeMap::new())
            .await
            .unwrap();
        // Two branches parked, one boundary timer each.
        assert_eq!(
            engine.get_active_activity_ids(instance).await.unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(store.pending_job_count(), 2);

        engine.cancel(instance, "operator request").await.unwrap();

        assert!(store.load_executions(instance).await.unwrap().is_empty());
        assert_eq!(store.pending_job_count(), 0);
        assert!(store.jobs_for_instance(instance).await.unwrap().is_empty());
        assert_eq!(recorder.count_of(EventKind::JobCancelled), 2);
        let loaded = store.load_instance(instance).await.unwrap();
        assert!(matches!(loaded.state, InstanceState::Cancelled { .. }));
    }

    #[tokio::test]
    async fn boundary_job_is_deleted_when_the_activity_completes_first() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(guarded_fork_graph());

        let instance = engine
            .start_process_instance("guarded-fork", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.pending_job_count(), 2);

        let executions = store.load_executions(instance).await.unwrap();
        for execution in executions.into_iter().filter(|e| e.wait.is_some()) {
            engine.signal(execution.id, BTreeMap::new()).await.unwrap();
        }
        // Both activities completed through the normal path; no stray timers.
        assert_eq!(store.pending_job_count(), 0);
        let loaded = store.load_instance(instance).await.unwrap();
        assert!(matches!(loaded.state, InstanceState::Completed { .. }));
    }

    #[tokio::test]
    async fn suspended_definition_skips_the_timer_silently() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        let graph = GraphBuilder::new("delayed")
            .node("start", NodeKind::Start)
            .node(
                "cooldown",
                NodeKind::TimerCatch {
                    schedule: "PT0S".into(),
                },
            )
            .node("end", NodeKind::End)
            .flow("start", "cooldown")
            .flow("cooldown", "end")
            .build()
            .unwrap();
        engine.deploy(graph);
        let recorder = RecordingListener::new();
        engine.dispatcher().subscribe(recorder.clone());

        let instance = engine
            .start_process_instance("delayed", BTreeMap::new())
            .await
            .unwrap();
        engine.suspend_definition("delayed").await.unwrap();

        let executed = engine.poll_and_execute_due_jobs(10).await.unwrap();
        assert_eq!(executed, 1, "the job is claimed and consumed");
        assert_eq!(store.pending_job_count(), 0, "skipped, not retried");
        assert_eq!(recorder.count_of(EventKind::TimerFired), 0);
        // The execution still waits; re-activation plus an external resume
        // path would be needed to move it.
        assert_eq!(
            engine.get_active_activity_ids(instance).await.unwrap(),
            vec!["cooldown"]
        );
    }

    #[tokio::test]
    async fn message_job_resumes_a_receive_task_through_polling() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        let graph = GraphBuilder::new("correspond")
            .node("start", NodeKind::Start)
            .node(
                "await-reply",
                NodeKind::ReceiveTask {
                    message: "reply".into(),
                },
            )
            .node("end", NodeKind::End)
            .flow("start", "await-reply")
            .flow("await-reply", "end")
            .build()
            .unwrap();
        engine.deploy(graph);

        let instance = engine
            .start_process_instance("correspond", BTreeMap::new())
            .await
            .unwrap();
        let waiting = waiting_execution(&store, instance).await;

        let mut config = serde_json::Map::new();
        config.insert(
            crate::types::job_config::MESSAGE.to_string(),
            json!("reply"),
        );
        engine
            .schedule_job(
                waiting,
                JobKind::Message,
                crate::job::MESSAGE_HANDLER,
                config,
                None,
            )
            .await
            .unwrap();

        assert_eq!(engine.poll_and_execute_due_jobs(10).await.unwrap(), 1);
        let loaded = store.load_instance(instance).await.unwrap();
        assert!(matches!(loaded.state, InstanceState::Completed { .. }));
        assert_eq!(store.pending_job_count(), 0);
    }

    #[tokio::test]
    async fn scheduling_under_an_unknown_handler_fails_eagerly() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(approval_graph());
        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        let waiting = waiting_execution(&store, instance).await;

        let err = engine
            .schedule_job(
                waiting,
                JobKind::Message,
                "nonexistent",
                serde_json::Map::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownHandler(_)));
        assert_eq!(store.pending_job_count(), 0);
    }

    #[tokio::test]
    async fn job_for_a_finished_instance_is_dropped() {
        let store = MemoryStore::new();
        let engine = engine_over(&store);
        engine.deploy(approval_graph());
        let instance = engine
            .start_process_instance("approval", BTreeMap::new())
            .await
            .unwrap();
        let execution = waiting_execution(&store, instance).await;

        // A stray message job outlives the instance.
        let job = Job::new(
            instance,
            execution,
            JobKind::Message,
            crate::job::MESSAGE_HANDLER,
            serde_json::Map::new(),
            None,
            3,
            Utc::now(),
        );
        let mut uow = store.begin();
        uow.insert_job(job.clone());
        uow.commit().await.unwrap();

        engine.cancel(instance, "shutdown").await.unwrap();
        // Cancel already swept the pending job; a duplicate reference to it
        // must still execute as a clean no-op deletion.
        engine.execute_job(&job).await.unwrap();
        assert!(store.jobs_for_instance(instance).await.unwrap().is_empty());
    }
}
