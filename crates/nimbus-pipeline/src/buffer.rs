//! Media buffers and stream events flowing through pads.

use bytes::Bytes;

/// A media buffer. Timestamps and durations are in stream seconds;
/// offsets count media units (frames, samples).
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub data: Bytes,
    pub timestamp_secs: Option<f64>,
    pub duration_secs: Option<f64>,
    pub offset: Option<i64>,
    pub offset_end: Option<i64>,
}

impl Buffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            timestamp_secs: None,
            duration_secs: None,
            offset: None,
            offset_end: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp_secs: f64) -> Self {
        self.timestamp_secs = Some(timestamp_secs);
        self
    }

    pub fn with_duration(mut self, duration_secs: f64) -> Self {
        self.duration_secs = Some(duration_secs);
        self
    }

    pub fn with_offsets(mut self, offset: i64, offset_end: i64) -> Self {
        self.offset = Some(offset);
        self.offset_end = Some(offset_end);
        self
    }
}

/// Serialized stream events that travel in-band with buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// Start of a new segment; one arrives after every (re)connection.
    NewSegment,
    /// End of stream.
    Eos,
}

/// What a pad carries: either a buffer or an in-band event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Buffer(Buffer),
    Event(StreamEvent),
}

impl FeedItem {
    pub fn is_buffer(&self) -> bool {
        matches!(self, FeedItem::Buffer(_))
    }

    pub fn is_event(&self) -> bool {
        matches!(self, FeedItem::Event(_))
    }
}
