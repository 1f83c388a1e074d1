//! Video frames, formats and the encode pipeline

pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;

pub use convert::i420_to_nv12;
pub use device::{DeviceSession, QueueRole};
pub use encoder::{EncodedPacket, EncoderSession, EncoderStats};
pub use format::{Nv12Layout, PixelFormat, Resolution};
pub use frame::{FrameExtra, I420Frame};
