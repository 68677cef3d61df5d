//! Discontinuity monitor, in the manner of an identity element.
//!
//! Sits between an eater's source and the component graph; checks each
//! buffer's timestamp and offset against what the previous buffer
//! predicted and posts an element message on the bus for every gap.
//! Buffers always pass through unchanged.

use std::sync::{Arc, Mutex};

use crate::bus::{BusMessage, BusSender, ElementMessage};
use crate::buffer::FeedItem;
use crate::pad::{ChainFn, Pad};

/// Timestamp jitter below this is noise, not a discontinuity.
const TIMESTAMP_TOLERANCE_SECS: f64 = 1e-6;

#[derive(Default)]
struct Expected {
    next_timestamp_secs: Option<f64>,
    next_offset: Option<i64>,
}

#[derive(Clone)]
pub struct DiscontMonitor {
    name: Arc<str>,
    pad: Pad,
    bus: BusSender,
    expected: Arc<Mutex<Expected>>,
}

impl DiscontMonitor {
    pub fn new(name: &str, bus: BusSender) -> Self {
        Self {
            name: Arc::from(name),
            pad: Pad::new(&format!("{name}.src")),
            bus,
            expected: Arc::new(Mutex::new(Expected::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Downstream pad.
    pub fn pad(&self) -> &Pad {
        &self.pad
    }

    /// Forget the expected position, e.g. after a reconnect.
    pub fn reset(&self) {
        *self.expected.lock().unwrap() = Expected::default();
    }

    /// The chain function to link an upstream pad to.
    pub fn chain_fn(&self) -> ChainFn {
        let monitor = self.clone();
        Arc::new(move |item| {
            if let FeedItem::Buffer(buffer) = &item {
                monitor.check(buffer);
            }
            monitor.pad.push(item);
        })
    }

    fn check(&self, buffer: &crate::buffer::Buffer) {
        let mut expected = self.expected.lock().unwrap();

        if let Some(timestamp) = buffer.timestamp_secs {
            if let Some(next) = expected.next_timestamp_secs {
                let gap = timestamp - next;
                if gap.abs() > TIMESTAMP_TOLERANCE_SECS {
                    self.bus.post(BusMessage::Element {
                        element: self.name.to_string(),
                        message: ElementMessage::ImperfectTimestamp {
                            gap_secs: gap,
                            timestamp_secs: timestamp,
                        },
                    });
                }
            }
            expected.next_timestamp_secs =
                Some(timestamp + buffer.duration_secs.unwrap_or(0.0));
        }

        if let Some(offset) = buffer.offset {
            if let Some(next) = expected.next_offset {
                let gap = offset - next;
                if gap != 0 {
                    self.bus.post(BusMessage::Element {
                        element: self.name.to_string(),
                        message: ElementMessage::ImperfectOffset {
                            gap_units: gap,
                            offset,
                        },
                    });
                }
            }
            expected.next_offset = buffer.offset_end.or(Some(offset));
        }
    }
}
