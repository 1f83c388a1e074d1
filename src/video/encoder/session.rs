//! Encoder session
//!
//! Owns one hardware encode device for one camera stream. Frames are
//! submitted from the caller's thread; a dequeue worker publishes encoded
//! packets and, when persisting, a writer worker stores them.
//!
//! Lifecycle: `open` → `submit_frame`* → `close`, repeatable. Each
//! open/close cycle is one segment. Device setup happens on the first
//! `open`; teardown when the session is dropped.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dequeue::{DequeueOutcome, DequeueWorker};
use super::packet::{EncodeType, EncodedPacket};
use super::pool::BufferPool;
use super::queue::{frame_metadata_queue, packet_queue, FrameMetadataSender};
use super::writer::{self, WriterSummary};
use crate::config::SessionConfig;
use crate::container::ContainerFactory;
use crate::error::{EncoderError, Result};
use crate::events::PacketPublisher;
use crate::video::convert::i420_to_nv12;
use crate::video::device::{
    BufferArena, CodecParams, DeviceSession, FormatInfo, QueueRole, Timestamp,
};
use crate::video::frame::{FrameExtra, I420Frame};

/// Raw-input buffers allocated on the device
pub const DEFAULT_INPUT_BUFFERS: u32 = 7;
/// Encoded-output buffers allocated on the device
pub const DEFAULT_OUTPUT_BUFFERS: u32 = 6;

/// Running totals shared with the dequeue worker
#[derive(Debug, Default)]
pub struct EncoderCounters {
    frames_submitted: AtomicU64,
    packets_published: AtomicU64,
    bytes_published: AtomicU64,
    keyframes: AtomicU64,
}

impl EncoderCounters {
    fn record_submit(&self) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packet(&self, packet: &EncodedPacket) {
        self.packets_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published
            .fetch_add(packet.len as u64, Ordering::Relaxed);
        if packet.is_keyframe() {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Session statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_submitted: u64,
    pub packets_published: u64,
    pub bytes_published: u64,
    pub keyframes: u64,
    pub input_buffers: u32,
    pub free_input_buffers: usize,
    /// Segment of the current open/close cycle
    pub segment_num: Option<u32>,
}

/// Device resources set up on first open
struct Prepared {
    format: FormatInfo,
    inputs: BufferArena,
    outputs: BufferArena,
    pool: Arc<BufferPool>,
}

/// Per-segment state
struct Running {
    segment_num: u32,
    extras: FrameMetadataSender,
    abort: Arc<AtomicBool>,
    dequeue: JoinHandle<Result<DequeueOutcome>>,
    writer: Option<JoinHandle<Result<WriterSummary>>>,
}

/// Hardware encoder session for one camera stream
pub struct EncoderSession {
    config: SessionConfig,
    device: Arc<dyn DeviceSession>,
    publisher: Arc<dyn PacketPublisher>,
    containers: Option<Arc<dyn ContainerFactory>>,
    input_count: u32,
    output_count: u32,
    prepared: Option<Prepared>,
    running: Option<Running>,
    next_segment: u32,
    /// Codec header carried across segments
    header: Option<Bytes>,
    /// Output buffer held back after end-of-stream
    parked_output: Option<u32>,
    submit_counter: u32,
    counters: Arc<EncoderCounters>,
    failure: Option<String>,
}

impl EncoderSession {
    pub fn new(
        config: SessionConfig,
        device: Arc<dyn DeviceSession>,
        publisher: Arc<dyn PacketPublisher>,
    ) -> Self {
        Self {
            config,
            device,
            publisher,
            containers: None,
            input_count: DEFAULT_INPUT_BUFFERS,
            output_count: DEFAULT_OUTPUT_BUFFERS,
            prepared: None,
            running: None,
            next_segment: 0,
            header: None,
            parked_output: None,
            submit_counter: 0,
            counters: Arc::new(EncoderCounters::default()),
            failure: None,
        }
    }

    /// Persist segments through `factory`; required when `config.write` is set
    pub fn with_containers(mut self, factory: Arc<dyn ContainerFactory>) -> Self {
        self.containers = Some(factory);
        self
    }

    /// Override the device buffer counts (only before the first open)
    pub fn with_buffer_counts(mut self, input: u32, output: u32) -> Self {
        self.input_count = input;
        self.output_count = output;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    /// Fatal error that ended the session, if any
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Segment number of the current open/close cycle
    pub fn segment_num(&self) -> Option<u32> {
        self.running.as_ref().map(|r| r.segment_num)
    }

    /// Negotiated device formats, available after the first open
    pub fn format(&self) -> Option<FormatInfo> {
        self.prepared.as_ref().map(|p| p.format)
    }

    pub fn stats(&self) -> EncoderStats {
        let (input_buffers, free_input_buffers) = self
            .prepared
            .as_ref()
            .map_or((0, 0), |p| (p.pool.capacity(), p.pool.available()));
        EncoderStats {
            frames_submitted: self.counters.frames_submitted.load(Ordering::Relaxed),
            packets_published: self.counters.packets_published.load(Ordering::Relaxed),
            bytes_published: self.counters.bytes_published.load(Ordering::Relaxed),
            keyframes: self.counters.keyframes.load(Ordering::Relaxed),
            input_buffers,
            free_input_buffers,
            segment_num: self.segment_num(),
        }
    }

    fn name(&self) -> &str {
        if self.config.filename.is_empty() {
            self.config.service_name()
        } else {
            &self.config.filename
        }
    }

    fn check_failed(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(EncoderError::SessionFailed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record a fatal error; every later operation fails with it
    fn fail(&mut self, err: &EncoderError) {
        if !err.is_fatal() {
            return;
        }
        if self.failure.is_none() {
            error!("{}: encoder session failed: {}", self.name(), err);
            self.failure = Some(err.to_string());
        }
        if let Some(prepared) = &self.prepared {
            prepared.pool.poison(err.to_string());
        }
    }

    /// Start a new segment
    pub fn open(&mut self) -> Result<()> {
        self.check_failed()?;
        if self.running.is_some() {
            warn!("{}: encoder already open", self.name());
            return Ok(());
        }
        self.config.validate()?;
        if self.config.write && self.containers.is_none() {
            return Err(EncoderError::Config(format!(
                "{}: writing requested without a container",
                self.name()
            )));
        }

        if let Err(e) = self.start_device() {
            self.fail(&e);
            return Err(e);
        }

        let segment_num = self.next_segment;
        match self.spawn_workers(segment_num) {
            Ok(running) => {
                self.next_segment += 1;
                self.submit_counter = 0;
                self.running = Some(running);
                info!(
                    "{}: encoder open, segment {} on {}",
                    self.name(),
                    segment_num,
                    self.device.name()
                );
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn start_device(&mut self) -> Result<()> {
        if self.prepared.is_none() {
            self.prepared = Some(self.prepare()?);
            return Ok(());
        }

        self.device.start()?;
        if let (Some(index), Some(prepared)) = (self.parked_output.take(), &self.prepared) {
            let buffer = prepared.outputs.get(index).ok_or_else(|| {
                EncoderError::device("qbuf", format!("parked output index {} unknown", index))
            })?;
            self.device
                .submit(QueueRole::EncodedOutput, buffer, 0, Timestamp::default())?;
        }
        Ok(())
    }

    fn prepare(&self) -> Result<Prepared> {
        let params = CodecParams::from_config(&self.config);
        let format = self.device.configure(&params)?;
        debug!(
            "{}: input {} bytes ({}x{} stride {}), output {} bytes",
            self.name(),
            format.input_size,
            params.input.width,
            params.input.height,
            format.input_layout.y_stride,
            format.output_size
        );

        let outputs = BufferArena::new(
            self.device
                .request_buffers(QueueRole::EncodedOutput, self.output_count)?,
        );
        let inputs = BufferArena::new(
            self.device
                .request_buffers(QueueRole::RawInput, self.input_count)?,
        );
        if inputs.is_empty() || outputs.is_empty() {
            return Err(EncoderError::device("reqbufs", "device allocated no buffers"));
        }

        self.device.stream_on(QueueRole::EncodedOutput)?;
        self.device.stream_on(QueueRole::RawInput)?;
        for buffer in outputs.iter() {
            self.device
                .submit(QueueRole::EncodedOutput, buffer, 0, Timestamp::default())?;
        }

        info!(
            "{}: {} {} -> {} @ {}fps {}bps, {} input / {} output buffers",
            self.name(),
            params.codec,
            params.input,
            params.output,
            params.fps,
            params.bitrate,
            inputs.len(),
            outputs.len()
        );

        Ok(Prepared {
            format,
            pool: Arc::new(BufferPool::new(inputs.len() as u32)),
            inputs,
            outputs,
        })
    }

    fn spawn_workers(&self, segment_num: u32) -> Result<Running> {
        let prepared = self.prepared.as_ref().ok_or(EncoderError::NotOpen)?;
        let (extras_tx, extras_rx) = frame_metadata_queue();

        let (packets, writer) = match (&self.containers, self.config.write) {
            (Some(factory), true) => {
                let (tx, rx) = packet_queue();
                let handle = writer::spawn(self.config.clone(), segment_num, factory.clone(), rx)?;
                (Some(tx), Some(handle))
            }
            _ => (None, None),
        };

        let abort = Arc::new(AtomicBool::new(false));
        let worker = DequeueWorker {
            name: self.name().to_string(),
            device: self.device.clone(),
            outputs: prepared.outputs.clone(),
            input_pool: prepared.pool.clone(),
            extras: extras_rx,
            packets,
            publisher: self.publisher.clone(),
            service: self.config.service_name(),
            encode_type: EncodeType::from(self.config.codec),
            segment_num,
            header: self.header.clone(),
            debug_level: self.config.debug_level,
            counters: self.counters.clone(),
            abort: abort.clone(),
        };
        let dequeue = worker.spawn()?;

        Ok(Running {
            segment_num,
            extras: extras_tx,
            abort,
            dequeue,
            writer,
        })
    }

    /// Encode one frame.
    ///
    /// Blocks while every raw-input buffer is held by the device. Returns
    /// the index of the frame within the current segment.
    pub fn submit_frame(&mut self, frame: &I420Frame<'_>, extra: &FrameExtra) -> Result<u32> {
        self.check_failed()?;
        match self.submit_inner(frame, extra) {
            Ok(()) => {
                self.counters.record_submit();
                let index = self.submit_counter;
                self.submit_counter += 1;
                Ok(index)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn submit_inner(&self, frame: &I420Frame<'_>, extra: &FrameExtra) -> Result<()> {
        let running = self.running.as_ref().ok_or(EncoderError::NotOpen)?;
        let prepared = self.prepared.as_ref().ok_or(EncoderError::NotOpen)?;

        let expected = self.config.input_resolution();
        if frame.resolution != expected {
            return Err(EncoderError::GeometryMismatch {
                expected: expected.to_string(),
                actual: frame.resolution.to_string(),
            });
        }

        let index = prepared.pool.acquire()?;
        let buffer = prepared.inputs.get(index).ok_or_else(|| {
            EncoderError::device("qbuf", format!("raw-input index {} unknown", index))
        })?;
        buffer.write(|data| i420_to_nv12(frame, data, &prepared.format.input_layout))?;

        // Metadata must be queued before the device can complete the frame;
        // the dequeue worker does not wait for it
        running.extras.push(*extra)?;
        self.device.submit(
            QueueRole::RawInput,
            buffer,
            prepared.format.input_size,
            Timestamp::from_nanos(extra.timestamp_eof),
        )
    }

    /// Flush every in-flight frame and end the segment.
    ///
    /// Waits for the device to report end-of-stream; an unresponsive device
    /// blocks here. Calling `close` on a closed session does nothing.
    pub fn close(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let Some(pool) = self.prepared.as_ref().map(|p| p.pool.clone()) else {
            return Ok(());
        };

        let mut shutdown_error = None;
        if !running.dequeue.is_finished() {
            let flushed = pool.drain().and_then(|_| self.device.stop());
            if let Err(e) = flushed {
                running.abort.store(true, Ordering::Release);
                shutdown_error = Some(e);
            }
        }

        let dequeue_error = match running.dequeue.join() {
            Ok(Ok(mut outcome)) => {
                let leftover = outcome.extras.drain_remaining();
                self.header = outcome.header.take();
                self.parked_output = Some(outcome.eos_buffer);
                if leftover > 0 {
                    Some(EncoderError::MalformedStream(format!(
                        "{} frames queued but never encoded",
                        leftover
                    )))
                } else {
                    None
                }
            }
            Ok(Err(e)) => Some(e),
            Err(_) => Some(EncoderError::SessionFailed(
                "dequeue worker panicked".to_string(),
            )),
        };
        drop(running.extras);

        let writer_error = match running.writer.map(|h| h.join()) {
            None | Some(Ok(Ok(_))) => None,
            Some(Ok(Err(e))) => Some(e),
            Some(Err(_)) => Some(EncoderError::SessionFailed(
                "writer worker panicked".to_string(),
            )),
        };

        match root_cause([dequeue_error, writer_error, shutdown_error]) {
            Some(e) => {
                self.fail(&e);
                Err(e)
            }
            None => {
                info!(
                    "{}: segment {} closed after {} frames",
                    self.name(),
                    running.segment_num,
                    self.submit_counter
                );
                Ok(())
            }
        }
    }
}

/// Pick the error that explains a failed shutdown; secondary
/// "worker has exited" failures only count when nothing else went wrong.
fn root_cause<const N: usize>(errors: [Option<EncoderError>; N]) -> Option<EncoderError> {
    let mut fallback = None;
    for err in errors.into_iter().flatten() {
        if !matches!(err, EncoderError::SessionFailed(_)) {
            return Some(err);
        }
        fallback.get_or_insert(err);
    }
    fallback
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        if self.running.is_some() {
            if let Err(e) = self.close() {
                error!("{}: close on drop failed: {}", self.name(), e);
            }
        }
        if self.prepared.take().is_none() {
            return;
        }
        for role in [QueueRole::RawInput, QueueRole::EncodedOutput] {
            if let Err(e) = self.device.stream_off(role) {
                warn!("{}: stream off {} failed: {}", self.name(), role, e);
            }
            if let Err(e) = self.device.request_buffers(role, 0) {
                warn!("{}: releasing {} buffers failed: {}", self.name(), role, e);
            }
        }
        debug!("{}: device released", self.name());
    }
}
