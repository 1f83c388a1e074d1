use thiserror::Error;

/// Encoder-wide error type
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Device error [{op}]: {reason}")]
    Device { op: &'static str, reason: String },

    #[error("Encoder out of sync: queued frame eof {expected_us}us, device reported {device_us}us")]
    ProtocolDesync { expected_us: u64, device_us: u64 },

    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    #[error("Frame geometry mismatch: expected {expected}, got {actual}")]
    GeometryMismatch { expected: String, actual: String },

    #[error("Encoder session is not open")]
    NotOpen,

    #[error("Encoder session failed: {0}")]
    SessionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Packet decode error: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncoderError {
    pub fn device(op: &'static str, reason: impl ToString) -> Self {
        EncoderError::Device {
            op,
            reason: reason.to_string(),
        }
    }

    /// Whether the error leaves the session (and the logged stream) unusable.
    ///
    /// Fatal errors poison the session; callers are expected to tear the
    /// process down and let the supervisor restart it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EncoderError::Device { .. }
                | EncoderError::ProtocolDesync { .. }
                | EncoderError::MalformedStream(_)
                | EncoderError::GeometryMismatch { .. }
                | EncoderError::SessionFailed(_)
                | EncoderError::Io(_)
        )
    }
}

/// Result type alias for the encoder
pub type Result<T> = std::result::Result<T, EncoderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EncoderError::device("qbuf", "EINVAL").is_fatal());
        assert!(EncoderError::ProtocolDesync {
            expected_us: 1,
            device_us: 2
        }
        .is_fatal());
        assert!(EncoderError::MalformedStream("no header".into()).is_fatal());
        assert!(EncoderError::Io(std::io::Error::other("disk full")).is_fatal());
        assert!(!EncoderError::NotOpen.is_fatal());
        assert!(!EncoderError::Config("bad".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = EncoderError::device("streamon", "EBUSY");
        assert_eq!(err.to_string(), "Device error [streamon]: EBUSY");
    }
}
