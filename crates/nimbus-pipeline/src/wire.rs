//! The feed wire format between a feeder's sink and an eater's source.
//!
//! Self-delimited packets: a u32 big-endian payload length, a one-byte
//! tag, then the tagged body. Buffers carry their timing metadata in a
//! fixed header before the media bytes; absent values are encoded as
//! the all-ones pattern.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::{Buffer, FeedItem, StreamEvent};
use crate::error::{PipelineError, PipelineResult};

const TAG_BUFFER: u8 = 1;
const TAG_NEW_SEGMENT: u8 = 2;
const TAG_EOS: u8 = 3;

const NONE_U64: u64 = u64::MAX;
const NONE_I64: i64 = i64::MIN;

/// Buffer header: timestamp, duration (f64 bits), offset, offset_end.
const BUFFER_HEADER_LEN: usize = 8 * 4;

/// Largest accepted payload; a length above this means a corrupt or
/// hostile stream.
pub const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

pub fn encode(item: &FeedItem, dst: &mut BytesMut) {
    match item {
        FeedItem::Buffer(buffer) => {
            let len = 1 + BUFFER_HEADER_LEN + buffer.data.len();
            dst.reserve(4 + len);
            dst.put_u32(len as u32);
            dst.put_u8(TAG_BUFFER);
            dst.put_u64(encode_f64(buffer.timestamp_secs));
            dst.put_u64(encode_f64(buffer.duration_secs));
            dst.put_i64(buffer.offset.unwrap_or(NONE_I64));
            dst.put_i64(buffer.offset_end.unwrap_or(NONE_I64));
            dst.put_slice(&buffer.data);
        }
        FeedItem::Event(event) => {
            dst.reserve(5);
            dst.put_u32(1);
            dst.put_u8(match event {
                StreamEvent::NewSegment => TAG_NEW_SEGMENT,
                StreamEvent::Eos => TAG_EOS,
            });
        }
    }
}

pub fn encode_to_bytes(item: &FeedItem) -> Bytes {
    let mut dst = BytesMut::new();
    encode(item, &mut dst);
    dst.freeze()
}

/// Pull one complete packet off the front of `src`, if present.
/// Partial packets leave `src` untouched.
pub fn decode(src: &mut BytesMut) -> PipelineResult<Option<FeedItem>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(PipelineError::Wire(format!("bad packet length {len}")));
    }
    if src.len() < 4 + len {
        return Ok(None);
    }
    src.advance(4);
    let mut payload = src.split_to(len);

    let tag = payload.get_u8();
    match tag {
        TAG_BUFFER => {
            if payload.len() < BUFFER_HEADER_LEN {
                return Err(PipelineError::Wire("truncated buffer header".to_string()));
            }
            let timestamp_secs = decode_f64(payload.get_u64());
            let duration_secs = decode_f64(payload.get_u64());
            let offset = decode_i64(payload.get_i64());
            let offset_end = decode_i64(payload.get_i64());
            Ok(Some(FeedItem::Buffer(Buffer {
                data: payload.freeze(),
                timestamp_secs,
                duration_secs,
                offset,
                offset_end,
            })))
        }
        TAG_NEW_SEGMENT => Ok(Some(FeedItem::Event(StreamEvent::NewSegment))),
        TAG_EOS => Ok(Some(FeedItem::Event(StreamEvent::Eos))),
        other => Err(PipelineError::Wire(format!("unknown packet tag {other}"))),
    }
}

fn encode_f64(value: Option<f64>) -> u64 {
    match value {
        Some(v) => v.to_bits(),
        None => NONE_U64,
    }
}

fn decode_f64(bits: u64) -> Option<f64> {
    if bits == NONE_U64 {
        None
    } else {
        Some(f64::from_bits(bits))
    }
}

fn decode_i64(value: i64) -> Option<i64> {
    if value == NONE_I64 {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_survives_the_wire() {
        let item = FeedItem::Buffer(
            Buffer::new(&b"payload"[..])
                .with_timestamp(1.25)
                .with_duration(0.04)
                .with_offsets(100, 101),
        );
        let mut wire = BytesMut::new();
        encode(&item, &mut wire);
        let back = decode(&mut wire).unwrap().unwrap();
        assert_eq!(back, item);
        assert!(wire.is_empty());
    }

    #[test]
    fn absent_metadata_round_trips_as_none() {
        let item = FeedItem::Buffer(Buffer::new(&b"x"[..]));
        let mut wire = BytesMut::new();
        encode(&item, &mut wire);
        match decode(&mut wire).unwrap().unwrap() {
            FeedItem::Buffer(buffer) => {
                assert_eq!(buffer.timestamp_secs, None);
                assert_eq!(buffer.offset, None);
            }
            other => panic!("expected buffer, got {other:?}"),
        }
    }

    #[test]
    fn partial_packets_wait_for_more_bytes() {
        let item = FeedItem::Event(StreamEvent::NewSegment);
        let mut wire = BytesMut::new();
        encode(&item, &mut wire);
        encode(&FeedItem::Event(StreamEvent::Eos), &mut wire);

        let mut partial = BytesMut::from(&wire[..3]);
        assert!(decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), 3);

        assert_eq!(decode(&mut wire).unwrap(), Some(item));
        assert_eq!(
            decode(&mut wire).unwrap(),
            Some(FeedItem::Event(StreamEvent::Eos))
        );
        assert_eq!(decode(&mut wire).unwrap(), None);
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut wire = BytesMut::new();
        wire.put_u32(u32::MAX);
        assert!(decode(&mut wire).is_err());
    }
}
