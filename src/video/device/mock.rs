//! Simulated encode device
//!
//! Behaves like a stateful memory-to-memory encoder: a codec-config buffer
//! precedes the first frame of every stream, keyframes follow the configured
//! interval, timestamps are copied from raw-input to encoded-output buffers,
//! and a stop command is answered with an end-of-stream buffer once every
//! queued frame has been encoded.
//!
//! Encoding runs inline whenever the device is touched, so tests are fully
//! deterministic. Hooks allow holding back completions, corrupting timestamps
//! and failing operations.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::{
    BufferFlags, CodecParams, Completion, DeviceBuffer, DeviceSession, FormatInfo, QueueRole,
    Readiness, Timestamp,
};
use crate::config::CodecVariant;
use crate::error::{EncoderError, Result};
use crate::video::format::Nv12Layout;

/// Minimum size of an encoded-output buffer
const MIN_OUTPUT_BUFFER_SIZE: usize = 4096;

struct PendingFrame {
    buffer: DeviceBuffer,
    bytes_used: usize,
    timestamp: Timestamp,
}

#[derive(Default)]
struct MockState {
    params: Option<CodecParams>,
    format: Option<FormatInfo>,
    input_streaming: bool,
    output_streaming: bool,
    pending_input: VecDeque<PendingFrame>,
    free_output: VecDeque<DeviceBuffer>,
    released_input: VecDeque<u32>,
    ready_output: VecDeque<Completion>,
    header_sent: bool,
    frames_in_stream: u64,
    frames_encoded: u64,
    stop_requested: bool,
    eos_sent: bool,
    paused: bool,
    suppress_eos: bool,
    corrupt_timestamps: u32,
    fail_op: Option<&'static str>,
}

/// Device counters observed by tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub frames_encoded: u64,
    pub pending_input: usize,
    pub queued_output: usize,
    pub stop_requested: bool,
    pub eos_sent: bool,
}

/// In-process encode device
pub struct MockDevice {
    name: String,
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_name("mock-venc")
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
            changed: Condvar::new(),
        }
    }

    /// Hold back all completions until [`MockDevice::resume`]
    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        Self::pump(&mut state);
        self.changed.notify_all();
    }

    /// Report the next `count` encoded frames with a shifted timestamp
    pub fn corrupt_next_timestamps(&self, count: u32) {
        self.state.lock().corrupt_timestamps = count;
    }

    /// Hold back the end-of-stream answer to a stop command; releasing it
    /// emits the pending end-of-stream
    pub fn suppress_eos(&self, suppress: bool) {
        let mut state = self.state.lock();
        state.suppress_eos = suppress;
        Self::pump(&mut state);
        self.changed.notify_all();
    }

    /// Fail the next call of the named operation (`"dequeue"`, `"submit"`, ...)
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().fail_op = Some(op);
    }

    /// Emit end-of-stream as if a stop command had been issued
    pub fn inject_eos(&self) {
        let mut state = self.state.lock();
        state.stop_requested = true;
        Self::pump(&mut state);
        self.changed.notify_all();
    }

    pub fn stats(&self) -> MockStats {
        let state = self.state.lock();
        MockStats {
            frames_encoded: state.frames_encoded,
            pending_input: state.pending_input.len(),
            queued_output: state.free_output.len(),
            stop_requested: state.stop_requested,
            eos_sent: state.eos_sent,
        }
    }

    fn check_fail(state: &mut MockState, op: &'static str) -> Result<()> {
        if state.fail_op == Some(op) {
            state.fail_op = None;
            return Err(EncoderError::device(op, "injected failure"));
        }
        Ok(())
    }

    /// Encode as much as the queued buffers allow
    fn pump(state: &mut MockState) {
        if state.paused {
            return;
        }
        let Some(params) = state.params.clone() else {
            return;
        };

        while !state.pending_input.is_empty() {
            if !state.header_sent {
                let Some(out) = state.free_output.pop_front() else {
                    break;
                };
                let header = codec_header(params.codec);
                let bytes_used = out.write(|data| {
                    let len = header.len().min(data.len());
                    data[..len].copy_from_slice(&header[..len]);
                    len
                });
                state.ready_output.push_back(Completion {
                    index: out.index(),
                    bytes_used,
                    flags: BufferFlags(BufferFlags::CODEC_CONFIG),
                    timestamp: Timestamp::default(),
                });
                state.header_sent = true;
                continue;
            }

            let Some(out) = state.free_output.pop_front() else {
                break;
            };
            let Some(frame) = state.pending_input.pop_front() else {
                break;
            };

            let keyframe = state.frames_in_stream % params.keyframe_interval() as u64 == 0;
            let checksum = frame.buffer.read(|data| {
                data[..frame.bytes_used.min(data.len())]
                    .iter()
                    .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32))
            });
            let payload = frame_payload(params.codec, keyframe, state.frames_in_stream, checksum);
            let bytes_used = out.write(|data| {
                let len = payload.len().min(data.len());
                data[..len].copy_from_slice(&payload[..len]);
                len
            });

            let mut timestamp = frame.timestamp;
            if state.corrupt_timestamps > 0 {
                state.corrupt_timestamps -= 1;
                timestamp = Timestamp(timestamp.0 + 1);
            }

            let mut flags = BufferFlags::TIMESTAMP_COPY;
            if keyframe {
                flags |= BufferFlags::KEYFRAME;
            }
            state.ready_output.push_back(Completion {
                index: out.index(),
                bytes_used,
                flags: BufferFlags(flags),
                timestamp,
            });
            state.released_input.push_back(frame.buffer.index());
            state.frames_in_stream += 1;
            state.frames_encoded += 1;
            trace!(
                "mock encoded frame {} into output {}",
                state.frames_encoded,
                out.index()
            );
        }

        if state.stop_requested
            && !state.eos_sent
            && !state.suppress_eos
            && state.pending_input.is_empty()
        {
            if let Some(out) = state.free_output.pop_front() {
                state.ready_output.push_back(Completion {
                    index: out.index(),
                    bytes_used: 0,
                    flags: BufferFlags(BufferFlags::EOS),
                    timestamp: Timestamp::default(),
                });
                state.eos_sent = true;
                debug!("mock device emitted end-of-stream");
            }
        }
    }

    fn readiness(state: &MockState) -> Readiness {
        Readiness {
            output_ready: !state.ready_output.is_empty(),
            input_released: !state.released_input.is_empty(),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, params: &CodecParams) -> Result<FormatInfo> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "configure")?;
        let input_layout = Nv12Layout::venus(params.input);
        let format = FormatInfo {
            input_size: input_layout.buffer_size(),
            output_size: ((params.output.pixels() as usize) * 3 / 4).max(MIN_OUTPUT_BUFFER_SIZE),
            input_layout,
        };
        state.params = Some(params.clone());
        state.format = Some(format);
        Ok(format)
    }

    fn request_buffers(&self, role: QueueRole, count: u32) -> Result<Vec<DeviceBuffer>> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "request_buffers")?;
        let format = state
            .format
            .ok_or_else(|| EncoderError::device("request_buffers", "device not configured"))?;
        let size = match role {
            QueueRole::RawInput => format.input_size,
            QueueRole::EncodedOutput => format.output_size,
        };
        if count == 0 {
            match role {
                QueueRole::RawInput => state.pending_input.clear(),
                QueueRole::EncodedOutput => state.free_output.clear(),
            }
        }
        Ok((0..count).map(|index| DeviceBuffer::heap(index, size)).collect())
    }

    fn submit(
        &self,
        role: QueueRole,
        buffer: &DeviceBuffer,
        bytes_used: usize,
        timestamp: Timestamp,
    ) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "submit")?;
        match role {
            QueueRole::RawInput => {
                if !state.input_streaming {
                    return Err(EncoderError::device("qbuf", "raw-input queue not streaming"));
                }
                if state.stop_requested {
                    return Err(EncoderError::device("qbuf", "encoder is stopped"));
                }
                state.pending_input.push_back(PendingFrame {
                    buffer: buffer.clone(),
                    bytes_used,
                    timestamp,
                });
            }
            QueueRole::EncodedOutput => {
                if !state.output_streaming {
                    return Err(EncoderError::device(
                        "qbuf",
                        "encoded-output queue not streaming",
                    ));
                }
                state.free_output.push_back(buffer.clone());
            }
        }
        Self::pump(&mut state);
        self.changed.notify_all();
        Ok(())
    }

    fn dequeue(&self, role: QueueRole) -> Result<Completion> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "dequeue")?;
        let completion = match role {
            QueueRole::RawInput => state.released_input.pop_front().map(|index| Completion {
                index,
                bytes_used: 0,
                flags: BufferFlags::default(),
                timestamp: Timestamp::default(),
            }),
            QueueRole::EncodedOutput => state.ready_output.pop_front(),
        };
        completion.ok_or_else(|| EncoderError::device("dqbuf", format!("{} queue empty", role)))
    }

    fn poll(&self, timeout: Duration) -> Result<Readiness> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "poll")?;
        loop {
            Self::pump(&mut state);
            let ready = Self::readiness(&state);
            if !ready.is_empty() {
                return Ok(ready);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return Ok(Self::readiness(&state));
            }
        }
    }

    fn stream_on(&self, role: QueueRole) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "stream_on")?;
        match role {
            QueueRole::RawInput => state.input_streaming = true,
            QueueRole::EncodedOutput => state.output_streaming = true,
        }
        Ok(())
    }

    fn stream_off(&self, role: QueueRole) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "stream_off")?;
        match role {
            QueueRole::RawInput => {
                state.input_streaming = false;
                state.pending_input.clear();
                state.released_input.clear();
            }
            QueueRole::EncodedOutput => {
                state.output_streaming = false;
                state.free_output.clear();
                state.ready_output.clear();
            }
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "start")?;
        state.stop_requested = false;
        state.eos_sent = false;
        state.header_sent = false;
        state.frames_in_stream = 0;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_fail(&mut state, "stop")?;
        state.stop_requested = true;
        Self::pump(&mut state);
        self.changed.notify_all();
        Ok(())
    }
}

fn codec_header(codec: CodecVariant) -> Vec<u8> {
    match codec {
        // SPS + PPS
        CodecVariant::H264 => vec![
            0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28, 0xac, 0x2b, 0x40, 0, 0, 0, 1, 0x68, 0xee, 0x3c,
            0x80,
        ],
        // VPS + SPS + PPS
        CodecVariant::Hevc => vec![
            0, 0, 0, 1, 0x40, 0x01, 0x0c, 0x01, 0, 0, 0, 1, 0x42, 0x01, 0x01, 0x01, 0, 0, 0, 1,
            0x44, 0x01, 0xc1, 0x72,
        ],
    }
}

fn frame_payload(codec: CodecVariant, keyframe: bool, frame: u64, checksum: u32) -> Vec<u8> {
    let nal = match (codec, keyframe) {
        (CodecVariant::H264, true) => vec![0x65, 0x88],
        (CodecVariant::H264, false) => vec![0x41, 0x9a],
        (CodecVariant::Hevc, true) => vec![0x26, 0x01],
        (CodecVariant::Hevc, false) => vec![0x02, 0x01],
    };
    let mut payload = vec![0, 0, 0, 1];
    payload.extend_from_slice(&nal);
    payload.extend_from_slice(&(frame as u32).to_le_bytes());
    payload.extend_from_slice(&checksum.to_le_bytes());
    // Vary the chunk size a little, like real rate control does
    payload.resize(payload.len() + (frame % 7) as usize * 3, 0x5a);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::video::format::Resolution;

    fn configured(codec: CodecVariant) -> (MockDevice, Vec<DeviceBuffer>, Vec<DeviceBuffer>) {
        let device = MockDevice::new();
        let config = SessionConfig {
            codec,
            input_width: 64,
            input_height: 32,
            output_width: 64,
            output_height: 32,
            ..Default::default()
        };
        device.configure(&CodecParams::from_config(&config)).unwrap();
        let outputs = device.request_buffers(QueueRole::EncodedOutput, 4).unwrap();
        let inputs = device.request_buffers(QueueRole::RawInput, 4).unwrap();
        device.stream_on(QueueRole::EncodedOutput).unwrap();
        device.stream_on(QueueRole::RawInput).unwrap();
        for out in &outputs {
            device
                .submit(QueueRole::EncodedOutput, out, 0, Timestamp::default())
                .unwrap();
        }
        (device, inputs, outputs)
    }

    #[test]
    fn test_configure_reports_sizes() {
        let device = MockDevice::new();
        let config = SessionConfig::default();
        let format = device.configure(&CodecParams::from_config(&config)).unwrap();
        assert_eq!(
            format.input_size,
            Nv12Layout::venus(Resolution::AR0231).buffer_size()
        );
        assert!(format.output_size >= MIN_OUTPUT_BUFFER_SIZE);
    }

    #[test]
    fn test_header_then_keyframe() {
        let (device, inputs, _outputs) = configured(CodecVariant::Hevc);
        device
            .submit(QueueRole::RawInput, &inputs[0], 16, Timestamp(1000))
            .unwrap();

        let ready = device.poll(Duration::from_millis(10)).unwrap();
        assert!(ready.output_ready);
        assert!(ready.input_released);

        let header = device.dequeue(QueueRole::EncodedOutput).unwrap();
        assert!(header.flags.is_codec_config());
        assert!(header.bytes_used > 0);

        let frame = device.dequeue(QueueRole::EncodedOutput).unwrap();
        assert!(frame.flags.is_keyframe());
        assert_eq!(frame.timestamp, Timestamp(1000));

        let released = device.dequeue(QueueRole::RawInput).unwrap();
        assert_eq!(released.index, 0);
    }

    #[test]
    fn test_keyframe_interval() {
        let (device, inputs, outputs) = configured(CodecVariant::H264);
        let mut keyframes = Vec::new();
        for i in 0..16u64 {
            let input = &inputs[(i % 4) as usize];
            device
                .submit(QueueRole::RawInput, input, 16, Timestamp(i))
                .unwrap();
            loop {
                let Ok(c) = device.dequeue(QueueRole::EncodedOutput) else {
                    break;
                };
                if !c.flags.is_codec_config() {
                    keyframes.push(c.flags.is_keyframe());
                }
                device
                    .submit(
                        QueueRole::EncodedOutput,
                        &outputs[c.index as usize],
                        0,
                        Timestamp::default(),
                    )
                    .unwrap();
            }
            device.dequeue(QueueRole::RawInput).unwrap();
        }
        assert_eq!(keyframes.len(), 16);
        assert!(keyframes[0]);
        assert!(keyframes[1..15].iter().all(|k| !k));
        assert!(keyframes[15]);
    }

    #[test]
    fn test_pause_holds_completions() {
        let (device, inputs, _outputs) = configured(CodecVariant::Hevc);
        device.pause();
        device
            .submit(QueueRole::RawInput, &inputs[0], 16, Timestamp(5))
            .unwrap();
        let ready = device.poll(Duration::from_millis(20)).unwrap();
        assert!(ready.is_empty());
        assert_eq!(device.stats().pending_input, 1);

        device.resume();
        let ready = device.poll(Duration::from_millis(20)).unwrap();
        assert!(ready.output_ready);
    }

    #[test]
    fn test_stop_emits_eos_after_pending_frames() {
        let (device, inputs, _outputs) = configured(CodecVariant::Hevc);
        device
            .submit(QueueRole::RawInput, &inputs[0], 16, Timestamp(7))
            .unwrap();
        device.stop().unwrap();

        let flags: Vec<BufferFlags> = std::iter::from_fn(|| device.dequeue(QueueRole::EncodedOutput).ok())
            .map(|c| c.flags)
            .collect();
        assert_eq!(flags.len(), 3);
        assert!(flags[0].is_codec_config());
        assert!(flags[1].is_keyframe());
        assert!(flags[2].is_eos());
        assert!(device.stats().eos_sent);

        // No more raw frames once stopped
        assert!(device
            .submit(QueueRole::RawInput, &inputs[1], 16, Timestamp(8))
            .is_err());
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let (device, _inputs, _outputs) = configured(CodecVariant::Hevc);
        device.fail_next("dequeue");
        assert!(device.dequeue(QueueRole::EncodedOutput).is_err());
        // Second failure is the ordinary "queue empty" one
        let err = device.dequeue(QueueRole::EncodedOutput).unwrap_err();
        assert!(err.to_string().contains("queue empty"));
    }

    #[test]
    fn test_submit_requires_streaming() {
        let device = MockDevice::new();
        device
            .configure(&CodecParams::from_config(&SessionConfig::default()))
            .unwrap();
        let inputs = device.request_buffers(QueueRole::RawInput, 1).unwrap();
        assert!(device
            .submit(QueueRole::RawInput, &inputs[0], 0, Timestamp(0))
            .is_err());
    }
}
