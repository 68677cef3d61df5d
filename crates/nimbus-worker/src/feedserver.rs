//! The TCP feed server and its dial-out counterpart.
//!
//! A consumer's worker dials the producer's worker, sends one request
//! line naming the feed and the requesting client, and reads one reply
//! line. On `OK` the socket becomes the feed connection: the server
//! hands the accepted descriptor to the producing job, and the dialer
//! hands its end to the consuming job. Both line exchanges happen on
//! the worker side, so the jobs only ever see framed media.

use std::io;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nimbus_core::FeedId;

use crate::error::{WorkerError, WorkerResult};
use crate::jobheaven::JobHeaven;

/// Dial a feed server and request `feed_id` on behalf of `client_id`.
/// The returned stream carries media from its first byte.
pub async fn request_feed(
    host: &str,
    port: u16,
    feed_id: &str,
    client_id: &str,
) -> WorkerResult<TcpStream> {
    let mut stream = TcpStream::connect((host, port)).await?;
    stream
        .write_all(format!("FEED {feed_id} {client_id}\n").as_bytes())
        .await?;
    let reply = read_line(&mut stream).await?;
    if let Some(rest) = reply.strip_prefix("OK ") {
        debug!(feed_id = rest, "feed granted");
        Ok(stream)
    } else {
        Err(WorkerError::FeedRefused(reply))
    }
}

/// Accepts feed dials and routes the sockets into producing jobs.
pub struct FeedServer {
    port: u16,
    task: JoinHandle<()>,
}

impl FeedServer {
    /// Bind `port` (0 picks a free one) and start serving.
    pub async fn start(heaven: JobHeaven, port: u16) -> WorkerResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let port = listener.local_addr()?.port();
        info!(port, "feed server listening");

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let heaven = heaven.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_dial(heaven, stream).await {
                                warn!(%peer, error = %e, "feed dial failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "feed accept failed"),
                }
            }
        });
        Ok(Self { port, task })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for FeedServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_dial(heaven: JobHeaven, mut stream: TcpStream) -> WorkerResult<()> {
    let request = read_line(&mut stream).await?;
    let mut words = request.split_whitespace();
    let (feed_id, client_id) = match (words.next(), words.next(), words.next(), words.next()) {
        (Some("FEED"), Some(feed_id), Some(client_id), None) => (feed_id, client_id),
        _ => {
            stream.write_all(b"NAK bad request\n").await?;
            return Err(WorkerError::BadFeedRequest(request));
        }
    };
    let feed = match FeedId::parse(feed_id) {
        Ok(feed) => feed,
        Err(e) => {
            stream.write_all(b"NAK bad feed id\n").await?;
            return Err(e.into());
        }
    };
    if heaven.avatar_for_component(&feed.component).is_none() {
        stream.write_all(b"NAK no such feed\n").await?;
        return Err(WorkerError::FeedRefused(feed_id.to_string()));
    }

    // Grant before the handoff, so the media follows the reply.
    stream.write_all(format!("OK {feed_id}\n").as_bytes()).await?;
    debug!(feed_id, client_id, "feed dial granted");

    let socket = stream.into_std()?;
    let fd = std::os::fd::AsRawFd::as_raw_fd(&socket);
    heaven
        .pass_feed_to(&feed.component, &feed.feed, client_id, fd)
        .await
    // Our copy of the socket drops here; the job keeps the duplicate.
}

/// Read exactly one newline-terminated line, one byte at a time.
/// Anything buffered beyond the newline would be stolen from the
/// descriptor we are about to hand off.
async fn read_line(stream: &mut TcpStream) -> WorkerResult<String> {
    use tokio::io::AsyncReadExt;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read_exact(&mut byte).await.is_err() {
            return Err(WorkerError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed during line exchange",
            )));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 512 {
            return Err(WorkerError::BadFeedRequest("line too long".to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
