use std::path::Path;

use tracing::{debug, info};

use super::AppConfig;
use crate::error::{EncoderError, Result};

/// Load the application configuration from a TOML file.
///
/// Missing keys fall back to their defaults; the result is validated.
pub fn load(path: &Path) -> Result<AppConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EncoderError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config = parse(&text)
        .map_err(|e| EncoderError::Config(format!("{}: {}", path.display(), e)))?;
    info!(
        "Loaded configuration from {} ({} sessions)",
        path.display(),
        config.sessions.len()
    );
    Ok(config)
}

/// Parse and validate a TOML configuration document
pub fn parse(text: &str) -> Result<AppConfig> {
    let config: AppConfig =
        toml::from_str(text).map_err(|e| EncoderError::Config(e.to_string()))?;
    config.validate()?;
    debug!("Configuration: {:?}", config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraRole, CodecVariant, DeviceBackend};
    use std::io::Write;

    #[test]
    fn test_parse_partial_document() {
        let config = parse(
            r#"
            frames = 10
            output_dir = "/tmp/out"

            [device]
            backend = "v4l2"

            [[sessions]]
            camera = "driver"
            codec = "h264"
            filename = "dcamera.h264"
            bitrate = 2500000
            "#,
        )
        .unwrap();

        assert_eq!(config.frames, 10);
        assert_eq!(config.device.backend, DeviceBackend::V4l2);
        assert_eq!(config.sessions.len(), 1);
        let session = &config.sessions[0];
        assert_eq!(session.camera, CameraRole::Driver);
        assert_eq!(session.codec, CodecVariant::H264);
        assert_eq!(session.bitrate, 2_500_000);
        assert_eq!(session.fps, 20);
        assert_eq!(session.service_name(), "qDriverEncodeData");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse("frames = \"many\"").is_err());
        assert!(parse("[[sessions]]\nfps = 0").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "frames = 3").unwrap();
        let config = load(file.path()).unwrap();
        assert_eq!(config.frames, 3);

        assert!(load(Path::new("/nonexistent/venc.toml")).is_err());
    }
}
