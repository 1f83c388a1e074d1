//! Stream persistence
//!
//! The writer worker feeds every packet of a segment to a
//! [`ContainerWriter`]. The codec header is written first, flagged with
//! `is_header`, followed by the frame payloads in encode order.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;

/// Sink for one segment of one stream
pub trait ContainerWriter: Send {
    /// Append one chunk. `timestamp_us` is the end-of-frame time in microseconds.
    fn write(
        &mut self,
        data: &[u8],
        timestamp_us: u64,
        is_header: bool,
        is_keyframe: bool,
    ) -> Result<()>;

    /// Flush and close the segment
    fn finish(&mut self) -> Result<()>;
}

/// Opens a writer for each new segment
pub trait ContainerFactory: Send + Sync {
    fn create(&self, config: &SessionConfig, segment_num: u32) -> Result<Box<dyn ContainerWriter>>;
}

/// Writes elementary streams into `<output_dir>/<segment_num>/<filename>`
#[derive(Debug, Clone)]
pub struct RawStreamFactory {
    output_dir: PathBuf,
}

impl RawStreamFactory {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn segment_path(&self, config: &SessionConfig, segment_num: u32) -> PathBuf {
        self.output_dir
            .join(segment_num.to_string())
            .join(&config.filename)
    }
}

impl ContainerFactory for RawStreamFactory {
    fn create(&self, config: &SessionConfig, segment_num: u32) -> Result<Box<dyn ContainerWriter>> {
        let path = self.segment_path(config, segment_num);
        Ok(Box::new(RawStreamWriter::create(&path)?))
    }
}

/// Annex-B elementary stream file
pub struct RawStreamWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    records: u64,
    bytes: u64,
    last_timestamp: Option<u64>,
}

impl RawStreamWriter {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        info!("Writing stream to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
            records: 0,
            bytes: 0,
            last_timestamp: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl ContainerWriter for RawStreamWriter {
    fn write(
        &mut self,
        data: &[u8],
        timestamp_us: u64,
        is_header: bool,
        is_keyframe: bool,
    ) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream already finished",
            )
            .into());
        };
        if !is_header {
            if let Some(last) = self.last_timestamp {
                if timestamp_us < last {
                    warn!(
                        "{}: timestamp went backwards ({} < {})",
                        self.path.display(),
                        timestamp_us,
                        last
                    );
                }
            }
            self.last_timestamp = Some(timestamp_us);
        }
        file.write_all(data)?;
        self.records += 1;
        self.bytes += data.len() as u64;
        if is_keyframe {
            debug!("{}: keyframe at {}us", self.path.display(), timestamp_us);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            info!(
                "Closed {} ({} records, {} bytes)",
                self.path.display(),
                self.records,
                self.bytes
            );
        }
        Ok(())
    }
}

impl Drop for RawStreamWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_stream_layout() {
        let dir = tempfile::tempdir().unwrap();
        let factory = RawStreamFactory::new(dir.path());
        let config = SessionConfig::default();

        let mut writer = factory.create(&config, 2).unwrap();
        writer.write(b"HDR", 1000, true, false).unwrap();
        writer.write(b"KEY", 1000, false, true).unwrap();
        writer.write(b"P", 1050, false, false).unwrap();
        writer.finish().unwrap();

        let path = dir.path().join("2").join("fcamera.hevc");
        assert_eq!(factory.segment_path(&config, 2), path);
        assert_eq!(fs::read(path).unwrap(), b"HDRKEYP");
    }

    #[test]
    fn test_write_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RawStreamWriter::create(&dir.path().join("a.h264")).unwrap();
        writer.write(&[0, 0, 0, 1], 0, true, false).unwrap();
        writer.finish().unwrap();
        assert_eq!(writer.records(), 1);
        assert_eq!(writer.bytes(), 4);
        assert!(writer.write(&[1], 1, false, false).is_err());
        // Finishing twice is harmless
        writer.finish().unwrap();
    }
}
