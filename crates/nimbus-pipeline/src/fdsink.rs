//! Multi-client fd sink: the downstream end of a feeder.
//!
//! Each added fd gets a writer task and a bounded queue; a slow client
//! drops buffers rather than stalling the media path. Per-fd stats
//! accumulate for as long as the client is known; once an fd is
//! reclaimed, `get_stats` returns `None` and the caller must treat the
//! tick as "stats unavailable", not "client gone".

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::buffer::FeedItem;
use crate::clock::system_now_ns;
use crate::error::PipelineResult;
use crate::pad::ChainFn;
use crate::wire;

/// Per-client queue depth before buffers are dropped.
const CLIENT_QUEUE: usize = 64;

/// Cumulative statistics for one client fd.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FdStats {
    pub bytes_sent: i64,
    pub time_added_ns: i64,
    pub time_removed_ns: i64,
    pub time_active_ns: i64,
    pub time_last_activity_ns: i64,
    pub buffers_dropped: Option<i64>,
}

#[derive(Debug)]
struct StatsInner {
    stats: FdStats,
}

struct ClientSlot {
    tx: mpsc::Sender<Bytes>,
    stats: Arc<Mutex<StatsInner>>,
}

type RemovedFn = Arc<dyn Fn(RawFd) + Send + Sync>;

/// The sink element. Clones share the element.
#[derive(Clone)]
pub struct FdSink {
    name: Arc<str>,
    clients: Arc<Mutex<HashMap<RawFd, ClientSlot>>>,
    removed_cb: Arc<Mutex<Option<RemovedFn>>>,
}

impl FdSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            clients: Arc::new(Mutex::new(HashMap::new())),
            removed_cb: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called from the writer task once a client fd has been fully
    /// released. The application must hop back to its main loop
    /// before reusing the fd number.
    pub fn on_client_removed(&self, cb: RemovedFn) {
        *self.removed_cb.lock().unwrap() = Some(cb);
    }

    /// The chain function to link an upstream source pad to.
    pub fn chain_fn(&self) -> ChainFn {
        let sink = self.clone();
        Arc::new(move |item| sink.render(&item))
    }

    /// Add a client fd; the sink takes ownership.
    pub fn add_fd(&self, fd: OwnedFd) -> PipelineResult<RawFd> {
        let label = fd.as_raw_fd();
        let std_stream: std::os::unix::net::UnixStream = fd.into();
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;

        let (tx, mut rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE);
        let stats = Arc::new(Mutex::new(StatsInner {
            stats: FdStats {
                bytes_sent: 0,
                time_added_ns: system_now_ns(),
                time_removed_ns: 0,
                time_active_ns: 0,
                time_last_activity_ns: 0,
                buffers_dropped: Some(0),
            },
        }));
        self.clients.lock().unwrap().insert(
            label,
            ClientSlot {
                tx,
                stats: stats.clone(),
            },
        );
        debug!(element = %self.name, fd = label, "feed client added");

        let clients = self.clients.clone();
        let removed_cb = self.removed_cb.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(bytes) = rx.recv().await {
                let len = bytes.len() as i64;
                if let Err(e) = stream.write_all(&bytes).await {
                    warn!(element = %name, fd = label, error = %e, "feed client write failed");
                    break;
                }
                let mut inner = stats.lock().unwrap();
                let now = system_now_ns();
                inner.stats.bytes_sent += len;
                inner.stats.time_last_activity_ns = now;
                inner.stats.time_active_ns = now - inner.stats.time_added_ns;
            }
            stats.lock().unwrap().stats.time_removed_ns = system_now_ns();
            // Reclaim the slot before announcing the removal.
            clients.lock().unwrap().remove(&label);
            drop(stream);
            debug!(element = %name, fd = label, "feed client removed");
            let cb = removed_cb.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(label);
            }
        });
        Ok(label)
    }

    /// Ask for a client's removal. The writer drains its queue, closes
    /// the fd, and fires the removed callback.
    pub fn remove_fd(&self, fd: RawFd) {
        // Dropping the sender ends the writer's recv loop.
        if let Some(slot) = self.clients.lock().unwrap().get_mut(&fd) {
            let (closed_tx, _closed_rx) = mpsc::channel(1);
            slot.tx = closed_tx;
        }
    }

    /// Stats for a client, or `None` once the fd was reclaimed.
    pub fn get_stats(&self, fd: RawFd) -> Option<FdStats> {
        self.clients
            .lock()
            .unwrap()
            .get(&fd)
            .map(|slot| slot.stats.lock().unwrap().stats)
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.lock().unwrap().keys().copied().collect()
    }

    /// Fan an item out to every client. Buffers that do not fit a
    /// client's queue are counted as dropped for that client.
    fn render(&self, item: &FeedItem) {
        let encoded = wire::encode_to_bytes(item);
        let clients = self.clients.lock().unwrap();
        for slot in clients.values() {
            match slot.tx.try_send(encoded.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if item.is_buffer() {
                        let mut inner = slot.stats.lock().unwrap();
                        if let Some(dropped) = inner.stats.buffers_dropped.as_mut() {
                            *dropped += 1;
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tokio::io::AsyncReadExt;

    fn test_pair() -> (OwnedFd, std::os::unix::net::UnixStream) {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        (OwnedFd::from(a), b)
    }

    fn buffer_item(data: &[u8]) -> FeedItem {
        FeedItem::Buffer(Buffer::new(data.to_vec()))
    }

    #[tokio::test]
    async fn clients_receive_framed_items() {
        let sink = FdSink::new("feeder:default");
        let (fd, reader) = test_pair();
        reader.set_nonblocking(true).unwrap();
        let mut reader = UnixStream::from_std(reader).unwrap();
        sink.add_fd(fd).unwrap();

        let chain = sink.chain_fn();
        chain(buffer_item(b"hello"));

        let mut raw = vec![0u8; 64];
        let n = reader.read(&mut raw).await.unwrap();
        let mut frame = BytesMut::from(&raw[..n]);
        match wire::decode(&mut frame).unwrap().unwrap() {
            FeedItem::Buffer(buffer) => assert_eq!(&buffer.data[..], b"hello"),
            other => panic!("expected buffer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stats_accumulate_and_disappear_on_reclaim() {
        let sink = FdSink::new("feeder:default");
        let (fd, mut reader_raw) = test_pair();
        let label = sink.add_fd(fd).unwrap();

        let chain = sink.chain_fn();
        chain(buffer_item(b"0123456789"));
        // Give the writer task a chance to flush.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stats = sink.get_stats(label).expect("client still present");
        assert!(stats.bytes_sent > 0);
        assert!(stats.time_last_activity_ns >= stats.time_added_ns);

        let removed = Arc::new(AtomicI32::new(-1));
        let seen = removed.clone();
        sink.on_client_removed(Arc::new(move |fd| {
            seen.store(fd, Ordering::SeqCst);
        }));

        sink.remove_fd(label);
        // Drain the peer so the writer is not blocked, then wait for
        // the removal to land.
        use std::io::Read;
        reader_raw.set_nonblocking(true).unwrap();
        let mut sunk = [0u8; 256];
        for _ in 0..50 {
            let _ = reader_raw.read(&mut sunk);
            if sink.get_stats(label).is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(sink.get_stats(label).is_none());
        assert_eq!(removed.load(Ordering::SeqCst), label);
    }

    #[tokio::test]
    async fn slow_client_drops_buffers_instead_of_stalling() {
        let sink = FdSink::new("feeder:default");
        let (fd, _reader) = test_pair();
        let label = sink.add_fd(fd).unwrap();
        let chain = sink.chain_fn();

        // Nobody reads; the queue and socket buffers fill up.
        for _ in 0..CLIENT_QUEUE * 4 {
            chain(buffer_item(&[0u8; 4096]));
        }
        let stats = sink.get_stats(label).unwrap();
        assert!(stats.buffers_dropped.unwrap() > 0);
    }
}
