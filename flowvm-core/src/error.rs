use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Engine error taxonomy. Fatal errors surface immediately to the caller of
/// the unit of work; transient errors are retried only when the work ran as a
/// job. Lock contention is not an error — a losing poller just skips the job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed graph, unknown node reference, or no applicable gateway flow.
    #[error("graph error at '{node}': {reason}")]
    Graph { node: String, reason: String },

    /// Malformed schedule description. Surfaced at creation time, never at fire time.
    #[error("malformed schedule '{fragment}': {reason}")]
    ScheduleParse { fragment: String, reason: String },

    #[error("unknown execution {0}")]
    UnknownExecution(Uuid),

    #[error("unknown process instance {0}")]
    UnknownInstance(Uuid),

    #[error("unknown job {0}")]
    UnknownJob(Uuid),

    #[error("no behavior registered for node type '{0}'")]
    UnknownBehavior(String),

    #[error("no job handler registered for '{0}'")]
    UnknownHandler(String),

    #[error("execution {execution} is not waiting for '{expected}'")]
    NotWaiting { execution: Uuid, expected: String },

    /// Optimistic concurrency failure signal from the store.
    #[error("concurrent modification of {entity} {id} at revision {expected}")]
    Conflict {
        entity: &'static str,
        id: Uuid,
        expected: u64,
    },

    /// A listener with fail_on_exception=true threw — the unit of work aborts.
    #[error("listener aborted dispatch: {0}")]
    Listener(#[source] anyhow::Error),

    /// Anything a behavior or handler raised that is not classified fatal.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl EngineError {
    pub fn graph(node: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::Graph {
            node: node.into(),
            reason: reason.into(),
        }
    }

    pub fn schedule(fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ScheduleParse {
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors skip the retry path and go straight to the exhausted state.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::Transient(_) | EngineError::Conflict { .. }
        )
    }
}
