//! Alert Bus (C3): a single bounded multi-producer / single-or-few-consumer
//! channel of [`AlertMessage`] (§4.3).
//!
//! Publishers use non-blocking send: if the bus is full the message is
//! dropped and the caller is told so explicitly, so it can skip the state
//! transition for that row and let the next scheduler tick retry it.

use tokio::sync::mpsc;

use crate::model::AlertMessage;

/// Capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Producer half of the bus.
#[derive(Clone)]
pub struct AlertBusSender {
    tx: mpsc::Sender<AlertMessage>,
}

impl AlertBusSender {
    /// Attempt to enqueue `message` without blocking. `Ok(())` means the
    /// message was accepted; `Err` means the bus was full and the caller
    /// must not perform the associated state transition (§4.4 step 3).
    pub fn publish(&self, message: AlertMessage) -> Result<(), AlertMessage> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) => m,
            mpsc::error::TrySendError::Closed(m) => m,
        })
    }
}

/// Consumer half of the bus.
pub struct AlertBusReceiver {
    rx: mpsc::Receiver<AlertMessage>,
}

impl AlertBusReceiver {
    /// Await the next message; `None` once every sender has been dropped.
    pub async fn recv(&mut self) -> Option<AlertMessage> {
        self.rx.recv().await
    }
}

/// Construct a bus with the given bounded capacity.
pub fn channel(capacity: usize) -> (AlertBusSender, AlertBusReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (AlertBusSender { tx }, AlertBusReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertLevel, Labels};
    use chrono::Utc;

    fn sample(id: &str) -> AlertMessage {
        AlertMessage {
            id: id.to_string(),
            service: "checkout".to_string(),
            version: "v1".to_string(),
            level: AlertLevel::P0,
            title: "cpu high".to_string(),
            alert_since: Utc::now(),
            labels: Labels::new(),
        }
    }

    #[tokio::test]
    async fn publish_then_receive_preserves_order() {
        let (tx, mut rx) = channel(4);
        tx.publish(sample("a1")).unwrap();
        tx.publish(sample("a2")).unwrap();

        assert_eq!(rx.recv().await.unwrap().id, "a1");
        assert_eq!(rx.recv().await.unwrap().id, "a2");
    }

    #[tokio::test]
    async fn publish_when_full_returns_the_message_back() {
        let (tx, mut rx) = channel(1);
        tx.publish(sample("a1")).unwrap();
        let rejected = tx.publish(sample("a2"));
        assert!(matches!(rejected, Err(ref m) if m.id == "a2"));

        assert_eq!(rx.recv().await.unwrap().id, "a1");
    }

    #[tokio::test]
    async fn receiver_ends_once_all_senders_dropped() {
        let (tx, mut rx) = channel(4);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
