//! Background worker pool driving the job subsystem.
//!
//! N independent workers loop poll/claim/execute against the engine. Each
//! worker polls under its own owner name so lock attribution stays readable
//! in logs and in the store. Workers sleep between empty cycles and shut
//! down through a watch channel.

use crate::engine::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the pool sized by the engine's configuration.
    pub fn start(engine: Arc<Engine>) -> Self {
        let config = engine.config().clone();
        let (shutdown, rx) = watch::channel(false);
        let handles = (0..config.worker_count.max(1))
            .map(|index| {
                let engine = Arc::clone(&engine);
                let rx = rx.clone();
                let owner = format!("worker-{index}");
                let idle = Duration::from_millis(config.poll_interval_ms);
                tokio::spawn(worker_loop(engine, owner, config.batch_size, idle, rx))
            })
            .collect();
        WorkerPool { shutdown, handles }
    }

    /// Signal every worker and wait for the loops to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    engine: Arc<Engine>,
    owner: String,
    batch: usize,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker = %owner, "job worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let executed = match engine.poll_and_execute_as(&owner, batch).await {
            Ok(count) => count,
            Err(err) => {
                warn!(worker = %owner, error = %err, "poll cycle failed");
                0
            }
        };
        if executed == 0 {
            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    info!(worker = %owner, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::graph::{GraphBuilder, NodeKind};
    use crate::store::EngineStore;
    use crate::store_memory::MemoryStore;
    use crate::types::InstanceState;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn pool_drains_due_jobs_and_stops_cleanly() {
        let store = MemoryStore::new();
        let config = EngineConfig {
            worker_count: 2,
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::with_config(Arc::new(store.clone()), config));
        let graph = GraphBuilder::new("background")
            .node("start", NodeKind::Start)
            .node("step-1", NodeKind::ServiceTask { async_before: true })
            .node("step-2", NodeKind::ServiceTask { async_before: true })
            .node("end", NodeKind::End)
            .flow("start", "step-1")
            .flow("step-1", "step-2")
            .flow("step-2", "end")
            .build()
            .unwrap();
        engine.deploy(graph);

        let instance = engine
            .start_process_instance("background", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(store.pending_job_count(), 1);

        let pool = WorkerPool::start(Arc::clone(&engine));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let loaded = store.load_instance(instance).await.unwrap();
            if matches!(loaded.state, InstanceState::Completed { .. }) {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "instance did not complete in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;
        assert_eq!(store.pending_job_count(), 0);
    }
}
