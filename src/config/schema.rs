use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use crate::error::{EncoderError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Logical camera channel feeding an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraRole {
    /// Forward-facing road camera
    Road,
    /// Cabin-facing driver camera
    Driver,
    /// Forward-facing wide-angle camera
    WideRoad,
}

impl Default for CameraRole {
    fn default() -> Self {
        Self::Road
    }
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraRole::Road => "road",
            CameraRole::Driver => "driver",
            CameraRole::WideRoad => "wide_road",
        };
        write!(f, "{}", name)
    }
}

/// Supported codec variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecVariant {
    /// H.264 high profile (small "q" streams)
    H264,
    /// H.265 main profile (full-quality streams)
    Hevc,
}

impl Default for CodecVariant {
    fn default() -> Self {
        Self::Hevc
    }
}

impl CodecVariant {
    /// Compressed pixel format produced by the device
    pub fn pixel_format(&self) -> PixelFormat {
        match self {
            CodecVariant::H264 => PixelFormat::H264,
            CodecVariant::Hevc => PixelFormat::Hevc,
        }
    }

    /// Number of P-frames between keyframes
    pub fn p_frames(&self) -> u32 {
        match self {
            CodecVariant::H264 => 14,
            CodecVariant::Hevc => 29,
        }
    }

    /// Distance in frames between keyframes
    pub fn keyframe_interval(&self) -> u32 {
        self.p_frames() + 1
    }
}

impl fmt::Display for CodecVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecVariant::H264 => write!(f, "H.264"),
            CodecVariant::Hevc => write!(f, "HEVC"),
        }
    }
}

/// Encoder session configuration, immutable for the session's lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Camera channel this encoder serves
    pub camera: CameraRole,
    /// Raw input width
    pub input_width: u32,
    /// Raw input height
    pub input_height: u32,
    /// Encoded output width (the device scales for free)
    pub output_width: u32,
    /// Encoded output height
    pub output_height: u32,
    /// Target frame rate
    pub fps: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Codec variant
    pub codec: CodecVariant,
    /// Persist the stream to `filename`
    pub write: bool,
    /// Output filename, relative to the output directory
    pub filename: String,
    /// Debug verbosity: 0 = quiet, 1 = one line per packet, 2 = also poll wake-ups
    pub debug_level: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            camera: CameraRole::Road,
            input_width: Resolution::AR0231.width,
            input_height: Resolution::AR0231.height,
            output_width: Resolution::AR0231.width,
            output_height: Resolution::AR0231.height,
            fps: 20,
            bitrate: 10_000_000,
            codec: CodecVariant::Hevc,
            write: true,
            filename: "fcamera.hevc".to_string(),
            debug_level: 0,
        }
    }
}

impl SessionConfig {
    pub fn input_resolution(&self) -> Resolution {
        Resolution::new(self.input_width, self.input_height)
    }

    pub fn output_resolution(&self) -> Resolution {
        Resolution::new(self.output_width, self.output_height)
    }

    /// Pub/sub channel the session publishes encoded packets on
    pub fn service_name(&self) -> &'static str {
        match (self.camera, self.codec) {
            (CameraRole::Road, CodecVariant::Hevc) => "roadEncodeData",
            (CameraRole::Road, CodecVariant::H264) => "qRoadEncodeData",
            (CameraRole::Driver, CodecVariant::Hevc) => "driverEncodeData",
            (CameraRole::Driver, CodecVariant::H264) => "qDriverEncodeData",
            (CameraRole::WideRoad, CodecVariant::Hevc) => "wideRoadEncodeData",
            (CameraRole::WideRoad, CodecVariant::H264) => "qWideRoadEncodeData",
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.input_resolution().is_valid() {
            return Err(EncoderError::Config(format!(
                "invalid input resolution {}",
                self.input_resolution()
            )));
        }
        if !self.output_resolution().is_valid() {
            return Err(EncoderError::Config(format!(
                "invalid output resolution {}",
                self.output_resolution()
            )));
        }
        if self.fps == 0 {
            return Err(EncoderError::Config("fps must be non-zero".to_string()));
        }
        if self.bitrate == 0 || self.bitrate > i32::MAX as u32 {
            return Err(EncoderError::Config(format!(
                "bitrate {} out of range",
                self.bitrate
            )));
        }
        if self.write && self.filename.trim().is_empty() {
            return Err(EncoderError::Config(
                "filename is required when writing".to_string(),
            ));
        }
        Ok(())
    }
}

/// Encode device backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackend {
    /// In-process simulated encoder
    Mock,
    /// V4L2 memory-to-memory encoder device
    V4l2,
}

impl Default for DeviceBackend {
    fn default() -> Self {
        Self::Mock
    }
}

/// Encode device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backend type
    pub backend: DeviceBackend,
    /// Device node of the encoder
    pub path: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackend::Mock,
            path: "/dev/v4l/by-path/platform-aa00000.qcom_vidc-video-index1".to_string(),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Encode device settings
    pub device: DeviceConfig,
    /// Directory receiving persisted streams
    pub output_dir: PathBuf,
    /// One encoder session per entry
    pub sessions: Vec<SessionConfig>,
    /// Number of synthetic frames to feed each session
    pub frames: u32,
    /// Pause between synthetic frames in milliseconds
    pub frame_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            output_dir: PathBuf::from("/data/media/0/realdata"),
            sessions: vec![SessionConfig::default()],
            frames: 100,
            frame_interval_ms: 50,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sessions.is_empty() {
            return Err(EncoderError::Config("no encoder sessions configured".to_string()));
        }
        let mut services = HashSet::new();
        let mut files = HashSet::new();
        for session in &self.sessions {
            session.validate()?;
            if !services.insert(session.service_name()) {
                return Err(EncoderError::Config(format!(
                    "duplicate encoder for {}",
                    session.service_name()
                )));
            }
            if session.write && !files.insert(session.filename.as_str()) {
                return Err(EncoderError::Config(format!(
                    "duplicate output file {}",
                    session.filename
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_service_names_unique() {
        let roles = [CameraRole::Road, CameraRole::Driver, CameraRole::WideRoad];
        let codecs = [CodecVariant::H264, CodecVariant::Hevc];
        let mut names = HashSet::new();
        for camera in roles {
            for codec in codecs {
                let config = SessionConfig {
                    camera,
                    codec,
                    ..Default::default()
                };
                assert!(names.insert(config.service_name()));
            }
        }
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn test_keyframe_interval() {
        assert_eq!(CodecVariant::H264.keyframe_interval(), 15);
        assert_eq!(CodecVariant::Hevc.keyframe_interval(), 30);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SessionConfig {
            fps: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            input_width: 1927,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            write: true,
            filename: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            write: false,
            filename: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_sessions_rejected() {
        let config = AppConfig {
            sessions: vec![SessionConfig::default(), SessionConfig::default()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
