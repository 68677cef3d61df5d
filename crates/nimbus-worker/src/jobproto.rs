//! The worker↔job wire protocol.
//!
//! The job socket carries two one-way streams. Job to worker: framed
//! JSON messages (the connect-back hello, then eater reconnect
//! requests). Worker to job: SCM_RIGHTS descriptor handoffs whose tag
//! string names the operation and its arguments. Keeping each
//! direction to a single codec means a buffered frame read can never
//! swallow the data bytes of a descriptor message.

use std::io;
use std::os::fd::{OwnedFd, RawFd};

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

use nimbus_rpc::fdpassing::{
    self, TAG_EAT_FROM_FD, TAG_FEED_TO_FD, TAG_REDIRECT_STDERR, TAG_REDIRECT_STDOUT,
};
use nimbus_rpc::frame;
use nimbus_rpc::{RpcError, RpcResult};

/// What a job sends its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum JobToWorker {
    /// First message after connecting back: who this job is.
    Hello { avatar_id: String, pid: u32 },

    /// An eater starved out and wants its feed connection remade.
    ConnectEater { alias: String, feed_id: String },
}

/// A descriptor handoff from worker to job. The tag string carries
/// the operation name and its arguments, whitespace-separated.
#[derive(Debug, Clone, PartialEq)]
pub enum Handoff {
    EatFromFd { alias: String, feed_id: String },
    FeedToFd { feed_name: String, client_id: String },
    RedirectStdout,
    RedirectStderr,
}

impl Handoff {
    pub fn tag(&self) -> String {
        match self {
            Handoff::EatFromFd { alias, feed_id } => {
                format!("{TAG_EAT_FROM_FD} {alias} {feed_id}")
            }
            Handoff::FeedToFd { feed_name, client_id } => {
                format!("{TAG_FEED_TO_FD} {feed_name} {client_id}")
            }
            Handoff::RedirectStdout => TAG_REDIRECT_STDOUT.to_string(),
            Handoff::RedirectStderr => TAG_REDIRECT_STDERR.to_string(),
        }
    }

    pub fn parse(tag: &str) -> io::Result<Self> {
        let mut words = tag.split_whitespace();
        let bad = || io::Error::new(io::ErrorKind::InvalidData, format!("bad handoff tag {tag:?}"));
        let handoff = match words.next().ok_or_else(bad)? {
            TAG_EAT_FROM_FD => Handoff::EatFromFd {
                alias: words.next().ok_or_else(bad)?.to_string(),
                feed_id: words.next().ok_or_else(bad)?.to_string(),
            },
            TAG_FEED_TO_FD => Handoff::FeedToFd {
                feed_name: words.next().ok_or_else(bad)?.to_string(),
                client_id: words.next().ok_or_else(bad)?.to_string(),
            },
            TAG_REDIRECT_STDOUT => Handoff::RedirectStdout,
            TAG_REDIRECT_STDERR => Handoff::RedirectStderr,
            _ => return Err(bad()),
        };
        if words.next().is_some() {
            return Err(bad());
        }
        Ok(handoff)
    }
}

/// Send one handoff with its descriptor. The caller keeps ownership
/// of `fd`; the kernel duplicates it into the job.
pub async fn send_handoff(stream: &UnixStream, handoff: &Handoff, fd: RawFd) -> io::Result<()> {
    fdpassing::send_fds(stream, &handoff.tag(), &[fd]).await
}

/// Receive one handoff and its descriptor (job side).
pub async fn recv_handoff(stream: &UnixStream) -> io::Result<(Handoff, OwnedFd)> {
    let (tag, mut fds) = fdpassing::recv_fds(stream).await?;
    let handoff = Handoff::parse(&tag)?;
    let count = fds.len();
    match fds.pop() {
        Some(fd) if count == 1 => Ok((handoff, fd)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("handoff {tag:?} carried {count} descriptors"),
        )),
    }
}

/// Read one framed message through a shared stream reference,
/// buffering partial frames in `acc`. `None` on a clean EOF.
pub async fn read_frame<T>(stream: &UnixStream, acc: &mut BytesMut) -> RpcResult<Option<T>>
where
    T: DeserializeOwned,
{
    loop {
        if let Some(message) = frame::decode(acc)? {
            return Ok(Some(message));
        }
        stream.readable().await?;
        let mut buf = [0u8; 4096];
        match stream.try_read(&mut buf) {
            Ok(0) => {
                if acc.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::Frame("eof inside frame".to_string()));
            }
            Ok(n) => acc.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write one framed message through a shared stream reference.
pub async fn write_frame<T: serde::Serialize>(stream: &UnixStream, message: &T) -> RpcResult<()> {
    let mut buf = BytesMut::new();
    frame::encode(message, &mut buf)?;
    while !buf.is_empty() {
        stream.writable().await?;
        match stream.try_write(&buf) {
            Ok(n) => {
                let _ = buf.split_to(n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
