//! Hardware encoder session
//!
//! This module provides the session that feeds raw camera frames to an
//! encode device and fans the results out:
//! - Buffer pool of raw-input indices (backpressure for the submitter)
//! - Frame metadata and packet hand-off queues
//! - Dequeue worker publishing encoded packets
//! - Writer worker persisting them

pub mod dequeue;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod session;
pub mod writer;

pub use packet::{EncodeType, EncodedPacket};
pub use pool::BufferPool;
pub use session::{EncoderSession, EncoderStats, DEFAULT_INPUT_BUFFERS, DEFAULT_OUTPUT_BUFFERS};
pub use writer::WriterSummary;
