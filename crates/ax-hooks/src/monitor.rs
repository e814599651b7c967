use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ax_core::types::TaskId;

/// A side-channel notification for dashboards and log tails. Monitors never
/// influence control flow; a slow or dead monitor is silently pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub kind: String,
    pub task_id: Option<TaskId>,
    pub data: Value,
    pub at: DateTime<Utc>,
}

impl MonitorEvent {
    pub fn new(kind: impl Into<String>, task_id: Option<TaskId>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            task_id,
            data,
            at: Utc::now(),
        }
    }
}

/// A broadcast-style bus built on flume channels.
///
/// Each call to [`attach`] creates a new receiver that sees all events
/// published after the attachment. Cloning the bus is cheap (shared `Arc`).
#[derive(Clone)]
pub struct MonitorBus {
    inner: Arc<Mutex<Vec<flume::Sender<MonitorEvent>>>>,
}

impl MonitorBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a monitor and return its receiving end.
    pub fn attach(&self) -> flume::Receiver<MonitorEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Publish to all current monitors, pruning disconnected ones.
    pub fn publish(&self, event: MonitorEvent) {
        let mut senders = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for MonitorBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_reaches_all_monitors() {
        let bus = MonitorBus::new();
        let a = bus.attach();
        let b = bus.attach();

        bus.publish(MonitorEvent::new("stream", Some(1), json!({"chunk": "x"})));

        assert_eq!(a.try_recv().unwrap().kind, "stream");
        assert_eq!(b.try_recv().unwrap().kind, "stream");
    }

    #[test]
    fn dropped_monitors_are_pruned() {
        let bus = MonitorBus::new();
        let rx = bus.attach();
        drop(rx);
        bus.publish(MonitorEvent::new("tick", None, json!({})));
        assert_eq!(bus.monitor_count(), 0);
    }
}
