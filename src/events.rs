use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeEvent {
    pub pin: String,
    pub kernel_id: u32,
    /// Value read right after the edge fired.
    pub value: u8,
    pub timestamp_ms: u64,
}

/// Fans edge events out to subscribers and keeps a bounded history per pin.
pub struct EventHub {
    event_tx: broadcast::Sender<EdgeEvent>,
    history: FxHashMap<String, RwLock<VecDeque<EdgeEvent>>>,
    history_capacity: usize,
}

impl EventHub {
    pub fn new<I, S>(pins: I, broadcast_capacity: usize, history_capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (event_tx, _) = broadcast::channel(broadcast_capacity);
        let history = pins
            .into_iter()
            .map(|pin| (pin.into(), RwLock::new(VecDeque::new())))
            .collect();

        Self {
            event_tx,
            history,
            history_capacity,
        }
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if self.history_capacity > 0
            && let Some(history_lock) = self.history.get(&event.pin)
        {
            let mut history = history_lock.write();
            while history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_tx.subscribe()
    }

    /// Oldest-first history of `pin`, trimmed to the newest `limit` events.
    pub fn history(&self, pin: &str, limit: Option<usize>) -> Vec<EdgeEvent> {
        self.history
            .get(pin)
            .map(|d| {
                let d = d.read();
                let skip = limit.map_or(0, |lim| d.len().saturating_sub(lim));
                d.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn last(&self, pin: &str) -> Option<EdgeEvent> {
        self.history.get(pin).and_then(|d| d.read().back().cloned())
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
