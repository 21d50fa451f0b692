use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use atelier_model::ProgressEvent;

/// Per-subscriber buffer depth. A subscriber falling further behind
/// observes `Lagged` and skips intermediate progress events; terminal
/// events are the newest and therefore always retained.
const TOPIC_CAPACITY: usize = 64;

/// Per-task fan-out of progress events. Topics live while the task is
/// non-terminal plus a grace window so late subscribers still catch the
/// outcome; after that, subscribers fall back to the persisted row.
pub struct ProgressBus {
    topics: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    grace: Duration,
}

impl ProgressBus {
    pub fn new(grace: Duration) -> ProgressBus {
        ProgressBus {
            topics: Mutex::new(HashMap::new()),
            grace,
        }
    }

    pub fn open(&self, task_id: &str) {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
    }

    /// Best-effort delivery; a topic with no subscribers swallows the
    /// event, which is fine because state is persisted independently.
    pub fn publish(&self, event: &ProgressEvent) {
        let sender = {
            let topics = self.topics.lock().unwrap();
            topics.get(event.task_id()).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender.send(event.clone());
        } else {
            log::debug!("No topic for task [{}], event dropped.", event.task_id());
        }
    }

    pub fn subscribe(&self, task_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        let topics = self.topics.lock().unwrap();
        topics.get(task_id).map(|sender| sender.subscribe())
    }

    /// Schedules topic teardown after the grace window. Called right
    /// after the terminal event is published.
    pub fn close_later(self: &Arc<Self>, task_id: String) {
        let bus = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(bus.grace).await;
            bus.close_now(&task_id);
        });
    }

    pub fn close_now(&self, task_id: &str) {
        let mut topics = self.topics.lock().unwrap();
        if topics.remove(task_id).is_some() {
            log::debug!("Closed progress topic for task [{}].", task_id);
        }
    }

    #[cfg(test)]
    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap().len()
    }
}
