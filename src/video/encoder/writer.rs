//! Writer worker
//!
//! Persists one segment: waits for packets from the dequeue worker and feeds
//! them to a container writer until the end-of-stream marker arrives.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use super::queue::{PacketReceiver, WriterMessage};
use crate::config::SessionConfig;
use crate::container::{ContainerFactory, ContainerWriter};
use crate::error::{EncoderError, Result};

/// What the writer persisted for one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    pub packets: u64,
    pub bytes: u64,
}

/// Start the writer thread for one segment
pub fn spawn(
    config: SessionConfig,
    segment_num: u32,
    factory: Arc<dyn ContainerFactory>,
    packets: PacketReceiver,
) -> Result<JoinHandle<Result<WriterSummary>>> {
    let name = format!("wr-{}", config.filename);
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let result = factory
            .create(&config, segment_num)
            .and_then(|writer| run(writer, packets));
        match &result {
            Ok(summary) => info!(
                "{}: segment {} written ({} packets, {} bytes)",
                name, segment_num, summary.packets, summary.bytes
            ),
            Err(e) => error!("{}: writer failed: {}", name, e),
        }
        result
    })?;
    Ok(handle)
}

/// Drain `packets` into `writer` until end-of-stream
pub fn run(mut writer: Box<dyn ContainerWriter>, mut packets: PacketReceiver) -> Result<WriterSummary> {
    let mut summary = WriterSummary::default();
    let mut first = true;

    loop {
        let packet = match packets.pop() {
            Some(WriterMessage::Packet(packet)) => packet,
            Some(WriterMessage::EndOfStream) => break,
            None => {
                return Err(EncoderError::SessionFailed(
                    "packet queue closed without end-of-stream".to_string(),
                ))
            }
        };

        let timestamp_us = packet.timestamp_eof / 1000;
        if first {
            let header = match &packet.header {
                Some(header) if packet.is_keyframe() && !header.is_empty() => header,
                _ => {
                    return Err(EncoderError::MalformedStream(format!(
                        "segment starts with frame {} which is not a keyframe with codec header",
                        packet.frame_id
                    )))
                }
            };
            writer.write(header, timestamp_us, true, false)?;
            summary.bytes += header.len() as u64;
            first = false;
        }

        if !packet.data.is_empty() {
            writer.write(&packet.data, timestamp_us, false, packet.is_keyframe())?;
            summary.bytes += packet.data.len() as u64;
        }
        summary.packets += 1;
        debug!("wrote packet {} ({} bytes)", packet.encode_id, packet.len);
    }

    if packets.try_pop().is_some() {
        return Err(EncoderError::MalformedStream(
            "packet queued after end-of-stream".to_string(),
        ));
    }

    writer.finish()?;
    Ok(summary)
}
