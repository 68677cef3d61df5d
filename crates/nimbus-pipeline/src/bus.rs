//! The pipeline bus: how media threads talk to the application.
//!
//! Elements post typed messages from whatever thread they run on; the
//! job consumes them on its main loop, which is what makes bus
//! handlers a safe place to mutate application state.

use tokio::sync::mpsc;

use crate::pipeline::PipelineState;

/// Element-originated messages (the identity-style discontinuity
/// reports).
#[derive(Debug, Clone, PartialEq)]
pub enum ElementMessage {
    /// A gap in timestamps. `gap_secs` is the size of the gap,
    /// `timestamp_secs` the timestamp of the buffer after it.
    ImperfectTimestamp { gap_secs: f64, timestamp_secs: f64 },
    /// A gap in offsets. `gap_units` is the size of the gap, `offset`
    /// the offset of the buffer after it.
    ImperfectOffset { gap_units: i64, offset: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    StateChanged {
        element: String,
        old: PipelineState,
        new: PipelineState,
    },
    Error {
        element: String,
        text: String,
        debug: String,
    },
    Eos {
        element: String,
    },
    Element {
        element: String,
        message: ElementMessage,
    },
}

/// Posting half of a bus; elements hold clones.
#[derive(Clone)]
pub struct BusSender {
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl BusSender {
    pub fn post(&self, message: BusMessage) {
        // The receiver only disappears when the pipeline is torn
        // down; late posts from media threads are dropped.
        let _ = self.tx.send(message);
    }
}

/// The bus proper. The receiving half can be taken exactly once.
pub struct Bus {
    tx: mpsc::UnboundedSender<BusMessage>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        }
    }

    pub fn sender(&self) -> BusSender {
        BusSender {
            tx: self.tx.clone(),
        }
    }

    /// Take the receiving half; `None` if already taken.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
        self.rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_arrive_in_post_order() {
        let bus = Bus::new();
        let mut rx = bus.take_receiver().unwrap();
        let sender = bus.sender();

        sender.post(BusMessage::Eos {
            element: "eater:default".to_string(),
        });
        sender.post(BusMessage::Error {
            element: "feeder:default".to_string(),
            text: "broken".to_string(),
            debug: String::new(),
        });

        assert!(matches!(rx.recv().await, Some(BusMessage::Eos { .. })));
        assert!(matches!(rx.recv().await, Some(BusMessage::Error { .. })));
    }

    #[test]
    fn receiver_can_be_taken_once() {
        let bus = Bus::new();
        assert!(bus.take_receiver().is_some());
        assert!(bus.take_receiver().is_none());
    }
}
