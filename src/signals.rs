//! Signal bus: publish/subscribe by string name.
//!
//! One broadcast channel carries every signal; receivers filter by name.
//! Publishing never blocks and never fails, even with no subscribers.

use serde::Serialize;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

pub const NODES_NODE_STATE: &str = "nodes_node_state";
pub const NODES_BREAKPOINT: &str = "nodes_breakpoint";
pub const UX: &str = "ux";
pub const UX_SELECTED: &str = "ux.selected";
pub const CONFIG_CHANGED: &str = "config.changed";
pub const STATUS: &str = "status";
pub const SCENE_LOOP_START: &str = "scene_loop_start";
pub const SCENE_LOOP_END: &str = "scene_loop_end";

const CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub name: String,
    pub payload: Json,
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<Signal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Returns the number of receivers that saw the signal.
    pub fn publish(&self, name: &str, payload: Json) -> usize {
        tracing::trace!(signal = name, "publish");
        self.tx.send(Signal { name: name.to_string(), payload }).unwrap_or(0)
    }

    /// Publish a status message (`status="error"` for failures reaching the top of a turn).
    pub fn status(&self, status: &str, message: &str) -> usize {
        self.publish(STATUS, serde_json::json!({"status": status, "message": message}))
    }

    /// Receive every signal published from now on.
    pub fn subscribe(&self) -> SignalReceiver {
        SignalReceiver { rx: self.tx.subscribe(), name: None }
    }

    /// Receive only signals with the given name.
    pub fn subscribe_to(&self, name: &str) -> SignalReceiver {
        SignalReceiver { rx: self.tx.subscribe(), name: Some(name.to_string()) }
    }
}

pub struct SignalReceiver {
    rx: broadcast::Receiver<Signal>,
    name: Option<String>,
}

impl SignalReceiver {
    fn wanted(&self, signal: &Signal) -> bool {
        self.name.as_deref().is_none_or(|n| n == signal.name)
    }

    /// Wait for the next matching signal. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            match self.rx.recv().await {
                Ok(signal) if self.wanted(&signal) => return Some(signal),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "signal receiver lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching signal already queued, if any.
    pub fn try_recv(&mut self) -> Option<Signal> {
        loop {
            match self.rx.try_recv() {
                Ok(signal) if self.wanted(&signal) => return Some(signal),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every queued matching signal.
    pub fn drain(&mut self) -> Vec<Signal> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = SignalBus::new();
        assert_eq!(bus.publish("nobody", Json::Null), 0);
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = SignalBus::new();
        let mut ux = bus.subscribe_to(UX);
        let mut all = bus.subscribe();
        bus.publish(STATUS, serde_json::json!({"status": "error"}));
        bus.publish(UX, serde_json::json!({"action": "present"}));

        let got = ux.recv().await.unwrap();
        assert_eq!(got.payload["action"], "present");
        assert!(ux.try_recv().is_none());
        assert_eq!(all.drain().len(), 2);
    }
}
