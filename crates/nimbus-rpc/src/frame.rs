//! Length-prefixed JSON framing: u32 big-endian payload length, then
//! the serialized message.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, RpcResult};

/// Frames above this size indicate a corrupt peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub fn encode<T: Serialize>(message: &T, dst: &mut BytesMut) -> RpcResult<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::Frame(format!("frame too large: {}", payload.len())));
    }
    dst.reserve(4 + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

/// Pull one complete message off the front of `src`, if present.
pub fn decode<T: DeserializeOwned>(src: &mut BytesMut) -> RpcResult<Option<T>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::Frame(format!("bad frame length {len}")));
    }
    if src.len() < 4 + len {
        return Ok(None);
    }
    src.advance(4);
    let payload = src.split_to(len);
    Ok(Some(serde_json::from_slice(&payload)?))
}

pub async fn write_message<T, W>(writer: &mut W, message: &T) -> RpcResult<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode(message, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message, buffering partial frames in `acc`. `None` on a
/// clean EOF at a frame boundary.
pub async fn read_message<T, R>(reader: &mut R, acc: &mut BytesMut) -> RpcResult<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(message) = decode(acc)? {
            return Ok(Some(message));
        }
        if reader.read_buf(acc).await? == 0 {
            if acc.is_empty() {
                return Ok(None);
            }
            return Err(RpcError::Frame("eof inside frame".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
        label: String,
    }

    #[tokio::test]
    async fn round_trip_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Ping {
            n: 7,
            label: "hello".to_string(),
        };
        write_message(&mut a, &sent).await.unwrap();

        let mut acc = BytesMut::new();
        let got: Ping = read_message(&mut b, &mut acc).await.unwrap().unwrap();
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let mut acc = BytesMut::new();
        let got: Option<Ping> = read_message(&mut b, &mut acc).await.unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn partial_frames_wait() {
        let mut buf = BytesMut::new();
        encode(
            &Ping {
                n: 1,
                label: "x".to_string(),
            },
            &mut buf,
        )
        .unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        let got: Option<Ping> = decode(&mut partial).unwrap();
        assert!(got.is_none());
    }
}
