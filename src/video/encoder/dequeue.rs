//! Dequeue worker
//!
//! Waits on both device queues and turns completions into published
//! packets. Raw-input completions give the buffer back to the pool;
//! encoded-output completions are classified by their flags:
//!
//! - end-of-stream: forward the end marker to the writer and exit
//! - codec config: remember the header for the next keyframe
//! - data: pair with the oldest queued frame metadata, publish, requeue

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::packet::{EncodeType, EncodedPacket};
use super::pool::BufferPool;
use super::queue::{FrameMetadataReceiver, PacketSender};
use super::session::EncoderCounters;
use crate::error::{EncoderError, Result};
use crate::events::PacketPublisher;
use crate::video::device::{BufferArena, Completion, DeviceBuffer, DeviceSession, QueueRole};

/// Readiness wait; expiry only produces a liveness warning
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// State handed back to the session when the worker exits cleanly
pub struct DequeueOutcome {
    /// Metadata left over after end-of-stream, expected empty
    pub extras: FrameMetadataReceiver,
    /// Last codec header seen, carried over to the next segment
    pub header: Option<Bytes>,
    /// Output buffer that carried end-of-stream and was not requeued
    pub eos_buffer: u32,
    /// Data packets published in this segment
    pub packets: u32,
}

/// One segment's worth of completion handling
pub struct DequeueWorker {
    pub name: String,
    pub device: Arc<dyn DeviceSession>,
    pub outputs: BufferArena,
    pub input_pool: Arc<BufferPool>,
    pub extras: FrameMetadataReceiver,
    pub packets: Option<PacketSender>,
    pub publisher: Arc<dyn PacketPublisher>,
    pub service: &'static str,
    pub encode_type: EncodeType,
    pub segment_num: u32,
    pub header: Option<Bytes>,
    pub debug_level: u8,
    pub counters: Arc<EncoderCounters>,
    /// Set when the session gives up on a clean end-of-stream
    pub abort: Arc<AtomicBool>,
}

impl DequeueWorker {
    /// Run the worker on its own thread.
    ///
    /// A failing worker poisons the raw-input pool so the submitting thread
    /// does not block forever on a buffer that will never come back.
    pub fn spawn(self) -> Result<JoinHandle<Result<DequeueOutcome>>> {
        let thread_name = format!("dq-{}", self.name);
        let pool = self.input_pool.clone();
        let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            let result = self.run();
            if let Err(e) = &result {
                error!("{}: {}", thread_name, e);
                pool.poison(e.to_string());
            }
            result
        })?;
        Ok(handle)
    }

    pub fn run(mut self) -> Result<DequeueOutcome> {
        let mut encode_id: u32 = 0;
        loop {
            if self.abort.load(Ordering::Acquire) {
                return Err(EncoderError::SessionFailed(format!(
                    "{} aborted before end-of-stream",
                    self.name
                )));
            }
            let ready = self.device.poll(POLL_TIMEOUT)?;
            if ready.is_empty() {
                warn!("{}: encoder dequeue poll timeout", self.name);
                continue;
            }
            if self.debug_level >= 2 {
                debug!("{}: poll {}", self.name, ready);
            }

            if ready.output_ready {
                let completion = self.device.dequeue(QueueRole::EncodedOutput)?;
                if completion.flags.is_eos() {
                    return self.finish(completion, encode_id);
                }
                if completion.flags.is_codec_config() {
                    self.cache_header(&completion)?;
                } else {
                    self.emit_packet(&completion, encode_id)?;
                    encode_id += 1;
                }
                self.requeue_output(completion.index)?;
            }

            if ready.input_released {
                self.release_input()?;
            }
        }
    }

    fn output_buffer(&self, index: u32) -> Result<&DeviceBuffer> {
        self.outputs.get(index).ok_or_else(|| {
            EncoderError::device("dqbuf", format!("encoded-output index {} out of range", index))
        })
    }

    fn cache_header(&mut self, completion: &Completion) -> Result<()> {
        let header = self
            .output_buffer(completion.index)?
            .copy_out(completion.bytes_used);
        debug!("{}: codec header {} bytes", self.name, header.len());
        self.header = Some(header);
        Ok(())
    }

    fn emit_packet(&mut self, completion: &Completion, encode_id: u32) -> Result<()> {
        let extra = self.extras.try_pop().ok_or_else(|| {
            EncoderError::MalformedStream(format!(
                "encoded frame at {}us has no queued metadata",
                completion.timestamp.as_micros()
            ))
        })?;
        if extra.eof_micros() != completion.timestamp.as_micros() {
            return Err(EncoderError::ProtocolDesync {
                expected_us: extra.eof_micros(),
                device_us: completion.timestamp.as_micros(),
            });
        }

        let data = self
            .output_buffer(completion.index)?
            .copy_out(completion.bytes_used);
        let header = if completion.flags.is_keyframe() {
            self.header.clone()
        } else {
            None
        };
        let packet = EncodedPacket::new(
            &extra,
            self.encode_type,
            encode_id,
            self.segment_num,
            completion.flags,
            data,
            header,
        );

        if self.debug_level >= 1 {
            info!(
                "{}: frame {} encode_id {} ts {} flags {} {} bytes",
                self.name,
                packet.frame_id,
                encode_id,
                completion.timestamp.as_micros(),
                completion.flags,
                packet.len
            );
        }

        self.publisher.publish(self.service, packet.encode());
        self.counters.record_packet(&packet);

        if let Some(packets) = &self.packets {
            packets.push_packet(packet)?;
        }
        Ok(())
    }

    fn requeue_output(&self, index: u32) -> Result<()> {
        let buffer = self.output_buffer(index)?;
        self.device
            .submit(QueueRole::EncodedOutput, buffer, 0, Default::default())
    }

    fn release_input(&self) -> Result<()> {
        let completion = self.device.dequeue(QueueRole::RawInput)?;
        self.input_pool.release(completion.index)
    }

    fn finish(mut self, completion: Completion, packets: u32) -> Result<DequeueOutcome> {
        info!(
            "{}: end of stream, segment {} had {} packets",
            self.name, self.segment_num, packets
        );
        // Raw buffers released together with the last frames
        while self.device.poll(Duration::ZERO)?.input_released {
            self.release_input()?;
        }
        if let Some(tx) = self.packets.take() {
            tx.push_end()?;
        }
        Ok(DequeueOutcome {
            extras: self.extras,
            header: self.header,
            eos_buffer: completion.index,
            packets,
        })
    }
}
