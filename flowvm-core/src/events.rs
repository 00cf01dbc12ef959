//! Typed publish/subscribe fabric for engine lifecycle events.
//!
//! Dispatch is always synchronous on the calling thread. Global listeners run
//! first in registration order, then type-filtered listeners in registration
//! order — tests rely on that contract. A listener that needs asynchronous
//! behavior schedules its own job instead.

use crate::error::{EngineError, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

/// Lifecycle events announced at every state transition. Observability only —
/// they never participate in control flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EngineEvent {
    ProcessStarted {
        instance_id: InstanceId,
        process_key: String,
    },
    ProcessCompleted {
        instance_id: InstanceId,
    },
    ProcessCancelled {
        instance_id: InstanceId,
        reason: String,
    },
    ActivityStarted {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        node: NodeId,
    },
    ActivityCompleted {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        node: NodeId,
    },
    ActivityCancelled {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        node: NodeId,
        reason: String,
    },
    FlowTaken {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        flow: String,
        from: NodeId,
        to: NodeId,
    },
    VariableSet {
        instance_id: InstanceId,
        execution_id: ExecutionId,
        name: String,
        value: Value,
    },
    GatewayForked {
        instance_id: InstanceId,
        gateway: NodeId,
        children: Vec<ExecutionId>,
    },
    JoinArrived {
        instance_id: InstanceId,
        gateway: NodeId,
        execution_id: ExecutionId,
        waiting: u16,
        expected: u16,
    },
    JoinCompleted {
        instance_id: InstanceId,
        gateway: NodeId,
    },
    JobScheduled {
        instance_id: InstanceId,
        job_id: JobId,
        kind: JobKind,
        due: Option<DateTime<Utc>>,
    },
    JobCancelled {
        instance_id: InstanceId,
        job_id: JobId,
    },
    JobFailed {
        instance_id: InstanceId,
        job_id: JobId,
        retries_left: u32,
        message: String,
    },
    JobRetriesExhausted {
        instance_id: InstanceId,
        job_id: JobId,
        message: String,
    },
    TimerFired {
        instance_id: InstanceId,
        job_id: JobId,
        execution_id: ExecutionId,
    },
}

/// Type tag used for filtered registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    ProcessStarted,
    ProcessCompleted,
    ProcessCancelled,
    ActivityStarted,
    ActivityCompleted,
    ActivityCancelled,
    FlowTaken,
    VariableSet,
    GatewayForked,
    JoinArrived,
    JoinCompleted,
    JobScheduled,
    JobCancelled,
    JobFailed,
    JobRetriesExhausted,
    TimerFired,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::ProcessStarted { .. } => EventKind::ProcessStarted,
            EngineEvent::ProcessCompleted { .. } => EventKind::ProcessCompleted,
            EngineEvent::ProcessCancelled { .. } => EventKind::ProcessCancelled,
            EngineEvent::ActivityStarted { .. } => EventKind::ActivityStarted,
            EngineEvent::ActivityCompleted { .. } => EventKind::ActivityCompleted,
            EngineEvent::ActivityCancelled { .. } => EventKind::ActivityCancelled,
            EngineEvent::FlowTaken { .. } => EventKind::FlowTaken,
            EngineEvent::VariableSet { .. } => EventKind::VariableSet,
            EngineEvent::GatewayForked { .. } => EventKind::GatewayForked,
            EngineEvent::JoinArrived { .. } => EventKind::JoinArrived,
            EngineEvent::JoinCompleted { .. } => EventKind::JoinCompleted,
            EngineEvent::JobScheduled { .. } => EventKind::JobScheduled,
            EngineEvent::JobCancelled { .. } => EventKind::JobCancelled,
            EngineEvent::JobFailed { .. } => EventKind::JobFailed,
            EngineEvent::JobRetriesExhausted { .. } => EventKind::JobRetriesExhausted,
            EngineEvent::TimerFired { .. } => EventKind::TimerFired,
        }
    }
}

/// A registered listener. `fail_on_exception` decides whether an error inside
/// it aborts the current unit of work or is logged and skipped.
pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()>;

    fn fail_on_exception(&self) -> bool {
        false
    }
}

/// Handle returned by registration, used for explicit removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(u64);

struct Registration {
    handle: ListenerHandle,
    /// `None` = global (receives every event).
    filter: Option<Vec<EventKind>>,
    listener: Arc<dyn EngineListener>,
}

#[derive(Default)]
struct Registrations {
    entries: Vec<Registration>,
    next_handle: u64,
}

/// Process-wide, in-memory listener registry. Owned by the engine instance
/// and injected into every component that publishes — no ambient global.
#[derive(Default)]
pub struct EventDispatcher {
    inner: RwLock<Registrations>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for every event.
    pub fn subscribe(&self, listener: Arc<dyn EngineListener>) -> ListenerHandle {
        self.register(None, listener)
    }

    /// Register a listener for the given event kinds only.
    pub fn subscribe_to(
        &self,
        kinds: &[EventKind],
        listener: Arc<dyn EngineListener>,
    ) -> ListenerHandle {
        self.register(Some(kinds.to_vec()), listener)
    }

    fn register(
        &self,
        filter: Option<Vec<EventKind>>,
        listener: Arc<dyn EngineListener>,
    ) -> ListenerHandle {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.next_handle += 1;
        let handle = ListenerHandle(inner.next_handle);
        inner.entries.push(Registration {
            handle,
            filter,
            listener,
        });
        handle
    }

    pub fn unsubscribe(&self, handle: ListenerHandle) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner.entries.retain(|r| r.handle != handle);
    }

    /// Deliver `event` to all interested listeners: globals first in
    /// registration order, then filtered listeners in registration order.
    pub fn dispatch(&self, event: &EngineEvent) -> Result<()> {
        let recipients: Vec<Arc<dyn EngineListener>> = {
            let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
            let globals = inner
                .entries
                .iter()
                .filter(|r| r.filter.is_none())
                .map(|r| Arc::clone(&r.listener));
            let filtered = inner
                .entries
                .iter()
                .filter(|r| {
                    r.filter
                        .as_ref()
                        .map(|kinds| kinds.contains(&event.kind()))
                        .unwrap_or(false)
                })
                .map(|r| Arc::clone(&r.listener));
            globals.chain(filtered).collect()
        };

        for listener in recipients {
            if let Err(err) = listener.on_event(event) {
                if listener.fail_on_exception() {
                    return Err(EngineError::Listener(err));
                }
                warn!(kind = ?event.kind(), error = %err, "listener failed; continuing dispatch");
            }
        }
        Ok(())
    }
}

/// Appends every event it sees to an in-memory history. The default audit
/// surface, and the main assertion tool in tests.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind()).collect()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl EngineListener for RecordingListener {
    fn on_event(&self, event: &EngineEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use uuid::Uuid;

    struct Failing {
        fatal: bool,
    }

    impl EngineListener for Failing {
        fn on_event(&self, _event: &EngineEvent) -> anyhow::Result<()> {
            Err(anyhow!("listener exploded"))
        }
        fn fail_on_exception(&self) -> bool {
            self.fatal
        }
    }

    fn sample_event() -> EngineEvent {
        EngineEvent::ProcessStarted {
            instance_id: Uuid::now_v7(),
            process_key: "sample".into(),
        }
    }

    #[test]
    fn swallowing_listener_does_not_block_later_listeners() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(Arc::new(Failing { fatal: false }));
        let recorder = RecordingListener::new();
        dispatcher.subscribe(recorder.clone());

        dispatcher.dispatch(&sample_event()).unwrap();
        assert_eq!(recorder.events().len(), 1);
    }

    #[test]
    fn fatal_listener_aborts_later_but_not_earlier_listeners() {
        let dispatcher = EventDispatcher::new();
        let before = RecordingListener::new();
        dispatcher.subscribe(before.clone());
        dispatcher.subscribe(Arc::new(Failing { fatal: true }));
        let after = RecordingListener::new();
        dispatcher.subscribe(after.clone());

        let err = dispatcher.dispatch(&sample_event()).unwrap_err();
        assert!(matches!(err, EngineError::Listener(_)));
        assert_eq!(before.events().len(), 1);
        assert_eq!(after.events().len(), 0);
    }

    #[test]
    fn globals_run_before_filtered_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        struct Tagged {
            tag: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }
        impl EngineListener for Tagged {
            fn on_event(&self, _event: &EngineEvent) -> anyhow::Result<()> {
                self.order.lock().unwrap().push(self.tag);
                Ok(())
            }
        }

        // A filtered listener registered before the globals must still run last.
        dispatcher.subscribe_to(
            &[EventKind::ProcessStarted],
            Arc::new(Tagged {
                tag: "filtered",
                order: order.clone(),
            }),
        );
        dispatcher.subscribe(Arc::new(Tagged {
            tag: "global-1",
            order: order.clone(),
        }));
        dispatcher.subscribe(Arc::new(Tagged {
            tag: "global-2",
            order: order.clone(),
        }));

        dispatcher.dispatch(&sample_event()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["global-1", "global-2", "filtered"]);
    }

    #[test]
    fn filtered_listener_only_sees_matching_kinds() {
        let dispatcher = EventDispatcher::new();
        let recorder = RecordingListener::new();
        dispatcher.subscribe_to(&[EventKind::ProcessCompleted], recorder.clone());

        dispatcher.dispatch(&sample_event()).unwrap();
        assert!(recorder.events().is_empty());

        dispatcher
            .dispatch(&EngineEvent::ProcessCompleted {
                instance_id: Uuid::now_v7(),
            })
            .unwrap();
        assert_eq!(recorder.count_of(EventKind::ProcessCompleted), 1);
    }

    #[test]
    fn unsubscribe_removes_the_listener() {
        let dispatcher = EventDispatcher::new();
        let recorder = RecordingListener::new();
        let handle = dispatcher.subscribe(recorder.clone());
        dispatcher.dispatch(&sample_event()).unwrap();
        dispatcher.unsubscribe(handle);
        dispatcher.dispatch(&sample_event()).unwrap();
        assert_eq!(recorder.events().len(), 1);
    }
}
