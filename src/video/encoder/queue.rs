//! Hand-off queues between the submitting thread and the workers
//!
//! Both queues are unbounded FIFOs. The metadata queue is bounded in
//! practice by the raw-input pool: at most one entry exists per in-flight
//! frame.

use tokio::sync::mpsc;

use super::packet::EncodedPacket;
use crate::error::{EncoderError, Result};
use crate::video::frame::FrameExtra;

/// Create the per-session frame metadata FIFO
pub fn frame_metadata_queue() -> (FrameMetadataSender, FrameMetadataReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrameMetadataSender { tx }, FrameMetadataReceiver { rx })
}

/// Producer side of the metadata FIFO, owned by the submitting thread
#[derive(Clone)]
pub struct FrameMetadataSender {
    tx: mpsc::UnboundedSender<FrameExtra>,
}

impl FrameMetadataSender {
    pub fn push(&self, extra: FrameExtra) -> Result<()> {
        self.tx
            .send(extra)
            .map_err(|_| EncoderError::SessionFailed("dequeue worker has exited".to_string()))
    }
}

/// Consumer side of the metadata FIFO, owned by the dequeue worker
pub struct FrameMetadataReceiver {
    rx: mpsc::UnboundedReceiver<FrameExtra>,
}

impl FrameMetadataReceiver {
    /// Oldest queued entry, without waiting
    pub fn try_pop(&mut self) -> Option<FrameExtra> {
        self.rx.try_recv().ok()
    }

    /// Number of entries still queued
    pub fn drain_remaining(&mut self) -> usize {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

/// Item handed from the dequeue worker to the writer worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterMessage {
    Packet(EncodedPacket),
    EndOfStream,
}

/// Create the per-session packet FIFO feeding the writer
pub fn packet_queue() -> (PacketSender, PacketReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketSender { tx }, PacketReceiver { rx })
}

pub struct PacketSender {
    tx: mpsc::UnboundedSender<WriterMessage>,
}

impl PacketSender {
    pub fn push_packet(&self, packet: EncodedPacket) -> Result<()> {
        self.send(WriterMessage::Packet(packet))
    }

    /// Tell the writer no more packets follow in this segment
    pub fn push_end(&self) -> Result<()> {
        self.send(WriterMessage::EndOfStream)
    }

    fn send(&self, message: WriterMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| EncoderError::SessionFailed("writer worker has exited".to_string()))
    }
}

pub struct PacketReceiver {
    rx: mpsc::UnboundedReceiver<WriterMessage>,
}

impl PacketReceiver {
    /// Wait for the next message; `None` once every sender is gone.
    ///
    /// Must not be called from inside an async runtime.
    pub fn pop(&mut self) -> Option<WriterMessage> {
        self.rx.blocking_recv()
    }

    pub fn try_pop(&mut self) -> Option<WriterMessage> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::device::BufferFlags;
    use crate::video::encoder::packet::EncodeType;
    use bytes::Bytes;

    #[test]
    fn test_metadata_fifo_order() {
        let (tx, mut rx) = frame_metadata_queue();
        for i in 0..3 {
            tx.push(FrameExtra::new(i, 0, i as u64 * 1000)).unwrap();
        }
        assert_eq!(rx.try_pop().map(|e| e.frame_id), Some(0));
        assert_eq!(rx.try_pop().map(|e| e.frame_id), Some(1));
        assert_eq!(rx.drain_remaining(), 1);
        assert!(rx.try_pop().is_none());
    }

    #[test]
    fn test_metadata_push_after_receiver_dropped() {
        let (tx, rx) = frame_metadata_queue();
        drop(rx);
        assert!(tx.push(FrameExtra::default()).is_err());
    }

    #[test]
    fn test_packet_queue_end_marker() {
        let (tx, mut rx) = packet_queue();
        let packet = EncodedPacket::new(
            &FrameExtra::new(1, 2, 3000),
            EncodeType::FullHevc,
            0,
            0,
            BufferFlags(BufferFlags::KEYFRAME),
            Bytes::from_static(b"frame"),
            None,
        );
        tx.push_packet(packet.clone()).unwrap();
        tx.push_end().unwrap();

        let handle = std::thread::spawn(move || {
            let first = rx.pop();
            let second = rx.pop();
            (first, second, rx.pop())
        });
        drop(tx);
        let (first, second, third) = handle.join().unwrap();
        assert_eq!(first, Some(WriterMessage::Packet(packet)));
        assert_eq!(second, Some(WriterMessage::EndOfStream));
        assert_eq!(third, None);
    }
}
