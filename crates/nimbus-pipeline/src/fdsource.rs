//! Fd source: the upstream end of an eater.
//!
//! A reader task (the element's media thread) decodes feed packets
//! off the fd and pushes them onto the source pad. The fd is
//! swappable: block the pad, attach the new fd, unblock. End of file
//! becomes an in-band EOS event, which the eater's probes are
//! expected to swallow.

use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::{FeedItem, StreamEvent};
use crate::bus::{BusMessage, BusSender};
use crate::error::PipelineResult;
use crate::pad::Pad;
use crate::wire;

#[derive(Clone)]
pub struct FdSource {
    name: Arc<str>,
    pad: Pad,
    bus: BusSender,
    reader: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FdSource {
    pub fn new(name: &str, bus: BusSender) -> Self {
        Self {
            name: Arc::from(name),
            pad: Pad::new(&format!("{name}.src")),
            bus,
            reader: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The source pad; probes and links go here.
    pub fn pad(&self) -> &Pad {
        &self.pad
    }

    pub fn has_fd(&self) -> bool {
        self.reader.lock().unwrap().is_some()
    }

    /// Take ownership of `fd` and start reading from it. Any previous
    /// reader is stopped first; the caller is responsible for blocking
    /// the pad around a swap.
    pub fn attach_fd(&self, fd: OwnedFd) -> PipelineResult<()> {
        let std_stream: std::os::unix::net::UnixStream = fd.into();
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;

        let mut slot = self.reader.lock().unwrap();
        if let Some(old) = slot.take() {
            old.abort();
        }

        let pad = self.pad.clone();
        let bus = self.bus.clone();
        let name = self.name.clone();
        *slot = Some(tokio::spawn(async move {
            let mut stream = stream;
            let mut acc = BytesMut::with_capacity(8192);
            loop {
                match stream.read_buf(&mut acc).await {
                    Ok(0) => {
                        debug!(element = %name, "feed fd closed, emitting eos");
                        pad.push(FeedItem::Event(StreamEvent::Eos));
                        return;
                    }
                    Ok(_) => loop {
                        match wire::decode(&mut acc) {
                            Ok(Some(item)) => pad.push(item),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(element = %name, error = %e, "feed decode failed");
                                bus.post(BusMessage::Error {
                                    element: name.to_string(),
                                    text: "feed stream corrupt".to_string(),
                                    debug: e.to_string(),
                                });
                                return;
                            }
                        }
                    },
                    Err(e) => {
                        debug!(element = %name, error = %e, "feed fd read failed, emitting eos");
                        pad.push(FeedItem::Event(StreamEvent::Eos));
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop reading and drop the fd.
    pub fn stop(&self) {
        if let Some(task) = self.reader.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for FdSource {
    fn drop(&mut self) {
        // Last clone going away stops the reader.
        if Arc::strong_count(&self.reader) == 1 {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::bus::Bus;
    use crate::pad::ChainFn;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn collector() -> (ChainFn, mpsc::UnboundedReceiver<FeedItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(move |item| drop(tx.send(item))), rx)
    }

    async fn write_item(stream: &mut UnixStream, item: &FeedItem) {
        stream
            .write_all(&wire::encode_to_bytes(item))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn decodes_packets_onto_the_pad() {
        let bus = Bus::new();
        let source = FdSource::new("eater:default", bus.sender());
        let (chain, mut rx) = collector();
        source.pad().link(chain);

        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        source.attach_fd(OwnedFd::from(a)).unwrap();
        b.set_nonblocking(true).unwrap();
        let mut writer = UnixStream::from_std(b).unwrap();

        let item = FeedItem::Buffer(Buffer::new(&b"frame"[..]).with_timestamp(0.5));
        write_item(&mut writer, &FeedItem::Event(StreamEvent::NewSegment)).await;
        write_item(&mut writer, &item).await;

        assert_eq!(
            rx.recv().await,
            Some(FeedItem::Event(StreamEvent::NewSegment))
        );
        assert_eq!(rx.recv().await, Some(item));
    }

    #[tokio::test]
    async fn eof_becomes_eos() {
        let bus = Bus::new();
        let source = FdSource::new("eater:default", bus.sender());
        let (chain, mut rx) = collector();
        source.pad().link(chain);

        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        source.attach_fd(OwnedFd::from(a)).unwrap();
        drop(b);

        assert_eq!(rx.recv().await, Some(FeedItem::Event(StreamEvent::Eos)));
    }

    #[tokio::test]
    async fn fd_swap_under_block_loses_nothing() {
        let bus = Bus::new();
        let source = FdSource::new("eater:default", bus.sender());
        let (chain, mut rx) = collector();
        source.pad().link(chain);

        let (a1, b1) = std::os::unix::net::UnixStream::pair().unwrap();
        source.attach_fd(OwnedFd::from(a1)).unwrap();
        b1.set_nonblocking(true).unwrap();
        let mut w1 = UnixStream::from_std(b1).unwrap();
        write_item(&mut w1, &FeedItem::Buffer(Buffer::new(&b"one"[..]))).await;
        assert!(rx.recv().await.is_some());

        source.pad().block();
        let (a2, b2) = std::os::unix::net::UnixStream::pair().unwrap();
        source.attach_fd(OwnedFd::from(a2)).unwrap();
        b2.set_nonblocking(true).unwrap();
        let mut w2 = UnixStream::from_std(b2).unwrap();
        write_item(&mut w2, &FeedItem::Buffer(Buffer::new(&b"two"[..]))).await;
        // Queued behind the block.
        tokio::task::yield_now().await;
        source.pad().unblock();

        match rx.recv().await {
            Some(FeedItem::Buffer(buffer)) => assert_eq!(&buffer.data[..], b"two"),
            other => panic!("expected buffer, got {other:?}"),
        }
    }
}
