//! Encode device session
//!
//! A thin capability wrapper around a memory-to-memory video encoder. Two
//! independent buffer queues exist: raw frames go in on [`QueueRole::RawInput`]
//! and compressed chunks come back on [`QueueRole::EncodedOutput`]. Buffers
//! are exchanged by index; a buffer is owned either by software or by the
//! device, never both.

mod buffer;
pub mod mock;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use buffer::{BufferArena, BufferMemory, DeviceBuffer};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{CodecVariant, SessionConfig};
use crate::error::Result;
use crate::video::format::{Nv12Layout, PixelFormat, Resolution};

/// Device buffer queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    /// Raw frames submitted for encoding (V4L2 OUTPUT_MPLANE)
    RawInput,
    /// Encoded chunks produced by the device (V4L2 CAPTURE_MPLANE)
    EncodedOutput,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueRole::RawInput => write!(f, "raw-input"),
            QueueRole::EncodedOutput => write!(f, "encoded-output"),
        }
    }
}

/// Buffer flags reported by the device (V4L2 buffer flag bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferFlags(pub u32);

impl BufferFlags {
    pub const KEYFRAME: u32 = 0x0000_0008;
    pub const TIMESTAMP_COPY: u32 = 0x0000_4000;
    /// Vendor flag: buffer carries codec configuration (parameter sets)
    pub const CODEC_CONFIG: u32 = 0x0002_0000;
    /// Vendor flag: last buffer after a stop command
    pub const EOS: u32 = 0x0200_0000;

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn is_keyframe(&self) -> bool {
        self.contains(Self::KEYFRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.contains(Self::CODEC_CONFIG)
    }

    pub fn is_eos(&self) -> bool {
        self.contains(Self::EOS)
    }
}

impl fmt::Display for BufferFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:8x}", self.0)
    }
}

/// Device timestamp in microseconds (V4L2 keeps `timeval` precision)
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_nanos(nanos: u64) -> Self {
        Timestamp(nanos / 1000)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Split into `(tv_sec, tv_usec)`
    pub fn as_timeval(&self) -> (i64, i64) {
        ((self.0 / 1_000_000) as i64, (self.0 % 1_000_000) as i64)
    }

    pub fn from_timeval(tv_sec: i64, tv_usec: i64) -> Self {
        let micros = tv_sec.wrapping_mul(1_000_000).wrapping_add(tv_usec);
        Timestamp(micros.max(0) as u64)
    }
}

/// A buffer handed back by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub index: u32,
    pub bytes_used: usize,
    pub flags: BufferFlags,
    pub timestamp: Timestamp,
}

/// Result of a multiplexed readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    /// An encoded-output buffer can be dequeued (POLLIN)
    pub output_ready: bool,
    /// A raw-input buffer was released by the device (POLLOUT)
    pub input_released: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !self.output_ready && !self.input_released
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bits = 0u8;
        if self.output_ready {
            bits |= 0x1;
        }
        if self.input_released {
            bits |= 0x4;
        }
        write!(f, "{:x}", bits)
    }
}

/// Rate control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Variable bitrate, constant frame rate
    VbrCfr,
}

/// Codec profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    H264High,
    HevcMain,
}

/// Codec level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Chosen by the device
    H264Unknown,
    /// HEVC high tier, level 5
    HevcHighTier5,
}

/// Entropy coding mode (H.264 only)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyMode {
    /// CABAC with context model 0
    Cabac0,
}

/// Full device configuration applied at session open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecParams {
    pub codec: CodecVariant,
    pub input: Resolution,
    pub output: Resolution,
    pub fps: u32,
    pub bitrate: u32,
    pub rate_control: RateControl,
    pub profile: Profile,
    pub level: Level,
    pub p_frames: u32,
    pub b_frames: u32,
    /// Every I-frame is an IDR
    pub idr_period: u32,
    pub entropy: Option<EntropyMode>,
    /// Parameter sets are delivered in their own buffer
    pub separate_header: bool,
}

impl CodecParams {
    pub fn from_config(config: &SessionConfig) -> Self {
        let (profile, level, entropy) = match config.codec {
            CodecVariant::Hevc => (Profile::HevcMain, Level::HevcHighTier5, None),
            CodecVariant::H264 => (
                Profile::H264High,
                Level::H264Unknown,
                Some(EntropyMode::Cabac0),
            ),
        };
        Self {
            codec: config.codec,
            input: config.input_resolution(),
            output: config.output_resolution(),
            fps: config.fps,
            bitrate: config.bitrate,
            rate_control: RateControl::VbrCfr,
            profile,
            level,
            p_frames: config.codec.p_frames(),
            b_frames: 0,
            idr_period: 1,
            entropy,
            separate_header: true,
        }
    }

    pub fn input_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }

    pub fn output_format(&self) -> PixelFormat {
        self.codec.pixel_format()
    }

    pub fn keyframe_interval(&self) -> u32 {
        self.p_frames + self.b_frames + 1
    }
}

/// Formats negotiated with the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    /// Size of one raw-input buffer
    pub input_size: usize,
    /// Size of one encoded-output buffer
    pub output_size: usize,
    /// Device-native NV12 layout of raw-input buffers
    pub input_layout: Nv12Layout,
}

/// Capability set of an encode device
pub trait DeviceSession: Send + Sync {
    /// Human readable device name
    fn name(&self) -> &str;

    /// Apply formats and codec controls
    fn configure(&self, params: &CodecParams) -> Result<FormatInfo>;

    /// Allocate `count` buffers on a queue; `0` releases them
    fn request_buffers(&self, role: QueueRole, count: u32) -> Result<Vec<DeviceBuffer>>;

    /// Hand a buffer over to the device
    fn submit(
        &self,
        role: QueueRole,
        buffer: &DeviceBuffer,
        bytes_used: usize,
        timestamp: Timestamp,
    ) -> Result<()>;

    /// Take back a buffer the device is done with
    fn dequeue(&self, role: QueueRole) -> Result<Completion>;

    /// Wait until either queue has a completion, or the timeout expires
    fn poll(&self, timeout: Duration) -> Result<Readiness>;

    fn stream_on(&self, role: QueueRole) -> Result<()>;

    fn stream_off(&self, role: QueueRole) -> Result<()>;

    /// Resume encoding after a stop/flush
    fn start(&self) -> Result<()>;

    /// Flush pending frames; the device answers with an end-of-stream buffer
    fn stop(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_flags() {
        let flags = BufferFlags(BufferFlags::KEYFRAME | BufferFlags::TIMESTAMP_COPY);
        assert!(flags.is_keyframe());
        assert!(!flags.is_eos());
        assert!(!flags.is_codec_config());
        assert!(BufferFlags(BufferFlags::EOS).is_eos());
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = Timestamp::from_nanos(12_345_678_901);
        assert_eq!(ts.as_micros(), 12_345_678);
        assert_eq!(ts.as_timeval(), (12, 345_678));
        assert_eq!(Timestamp::from_timeval(12, 345_678), ts);
    }

    #[test]
    fn test_codec_params() {
        let config = SessionConfig {
            codec: CodecVariant::H264,
            ..Default::default()
        };
        let params = CodecParams::from_config(&config);
        assert_eq!(params.profile, Profile::H264High);
        assert_eq!(params.keyframe_interval(), 15);
        assert_eq!(params.entropy, Some(EntropyMode::Cabac0));
        assert_eq!(params.output_format(), PixelFormat::H264);

        let params = CodecParams::from_config(&SessionConfig::default());
        assert_eq!(params.level, Level::HevcHighTier5);
        assert_eq!(params.keyframe_interval(), 30);
        assert!(params.entropy.is_none());
    }
}
