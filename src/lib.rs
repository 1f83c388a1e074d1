//! venc-logger - hardware video encoder sessions for camera logging
//!
//! This crate drives a memory-to-memory video encoder (V4L2 stateful
//! encoder API, or an in-process simulation), publishes every encoded
//! frame as a packet on a per-camera service and optionally persists the
//! elementary stream to disk.

pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod video;

pub use error::{EncoderError, Result};
