//! Progress events, published fire-and-forget
//!
//! A sink must never fail the caller: publishing with nobody listening is fine.

use std::sync::Arc;

use arena_core::{BattleId, ContextId, ItemId, Outcome};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::task::{TaskId, TaskProgress, TaskStatus};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    TaskStatusChanged {
        task_id: TaskId,
        context_id: ContextId,
        kind: String,
        status: TaskStatus,
        progress: TaskProgress,
    },
    TaskProgress {
        task_id: TaskId,
        context_id: ContextId,
        progress: TaskProgress,
    },
    BattleResolved {
        context_id: ContextId,
        battle_id: BattleId,
        item_a: ItemId,
        item_b: ItemId,
        outcome: Outcome,
    },
    BattleAbandoned {
        context_id: ContextId,
        battle_id: BattleId,
        reason: String,
    },
    Convergence {
        context_id: ContextId,
        should_stop: bool,
        confidence: f64,
        progress: f64,
        reason: String,
    },
    LoopStarted {
        context_id: ContextId,
    },
    LoopStopped {
        context_id: ContextId,
        reason: String,
    },
}

impl ProgressEvent {
    pub fn context_id(&self) -> &ContextId {
        match self {
            ProgressEvent::TaskStatusChanged { context_id, .. }
            | ProgressEvent::TaskProgress { context_id, .. }
            | ProgressEvent::BattleResolved { context_id, .. }
            | ProgressEvent::BattleAbandoned { context_id, .. }
            | ProgressEvent::Convergence { context_id, .. }
            | ProgressEvent::LoopStarted { context_id }
            | ProgressEvent::LoopStopped { context_id, .. } => context_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Fans events out to any number of tokio broadcast subscribers
#[derive(Clone, Debug)]
pub struct BroadcastSink {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: ProgressEvent) {
        // Err only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }
}

/// Emits every event as a tracing record
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::TaskStatusChanged {
                task_id,
                context_id,
                kind,
                status,
                progress,
            } => tracing::info!(
                "Task {} ({} in {}) is {} [{}/{} done, {} failed]",
                task_id,
                kind,
                context_id,
                status,
                progress.completed,
                progress.total,
                progress.failed
            ),
            ProgressEvent::TaskProgress {
                task_id, progress, ..
            } => tracing::debug!(
                "Task {} progress {}/{} ({} failed){}",
                task_id,
                progress.completed,
                progress.total,
                progress.failed,
                progress.note.as_deref().map(|n| format!(" at {}", n)).unwrap_or_default()
            ),
            ProgressEvent::BattleResolved {
                context_id,
                item_a,
                item_b,
                outcome,
                ..
            } => tracing::debug!("{}: {} vs {} -> {}", context_id, item_a, item_b, outcome),
            ProgressEvent::BattleAbandoned {
                context_id,
                battle_id,
                reason,
            } => tracing::warn!("{}: battle {} abandoned: {}", context_id, battle_id, reason),
            ProgressEvent::Convergence {
                context_id,
                should_stop,
                progress,
                reason,
                ..
            } => tracing::info!(
                "{}: {:.0}% converged (stop={}) - {}",
                context_id,
                progress,
                should_stop,
                reason
            ),
            ProgressEvent::LoopStarted { context_id } => tracing::info!("Battle loop started for {}", context_id),
            ProgressEvent::LoopStopped { context_id, reason } => {
                tracing::info!("Battle loop stopped for {}: {}", context_id, reason)
            }
        }
    }
}

/// Publishes to several sinks in order
#[derive(Clone, Default)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for MultiSink {
    fn publish(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> ProgressEvent {
        ProgressEvent::LoopStarted {
            context_id: "ctx".into(),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers_is_fine() {
        BroadcastSink::new(4).publish(started());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new(4);
        let mut rx = sink.subscribe();
        sink.publish(started());
        assert_eq!(rx.recv().await.unwrap(), started());
    }

    #[tokio::test]
    async fn test_multi_sink_fans_out() {
        let first = BroadcastSink::new(4);
        let second = BroadcastSink::new(4);
        let mut rx1 = first.subscribe();
        let mut rx2 = second.subscribe();
        let multi = MultiSink::new()
            .with(Arc::new(first))
            .with(Arc::new(TracingSink))
            .with(Arc::new(second));

        multi.publish(started());
        assert_eq!(rx1.recv().await.unwrap().context_id().as_str(), "ctx");
        assert_eq!(rx2.recv().await.unwrap(), started());
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(started()).unwrap();
        assert_eq!(json["event"], "loop_started");
        assert_eq!(json["context_id"], "ctx");
    }
}
