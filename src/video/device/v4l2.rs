//! V4L2 memory-to-memory encoder backend (v4l2r ioctl layer)
//!
//! Raw frames go to the OUTPUT_MPLANE queue, encoded chunks come back on
//! CAPTURE_MPLANE. Both queues use MMAP buffers with a single plane.
//! Codec controls are applied one by one with VIDIOC_S_CTRL, including
//! the msm_vidc vendor controls the Venus encoder needs.

use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};
use v4l2r::bindings::{
    v4l2_buffer, v4l2_control, v4l2_encoder_cmd, v4l2_plane, v4l2_streamparm,
    v4l2_streamparm__bindgen_ty_1,
};
use v4l2r::ioctl::{self, Capabilities, Capability, MemoryConsistency, PlaneMapping, V4l2Buffer};
use v4l2r::memory::MemoryType;
use v4l2r::{Format as V4l2rFormat, PixelFormat as V4l2rPixelFormat, QueueType};

use super::{
    BufferFlags, CodecParams, Completion, DeviceBuffer, DeviceSession, EntropyMode, FormatInfo,
    Level, Profile, QueueRole, RateControl, Readiness, Timestamp,
};
use crate::error::{EncoderError, Result};
use crate::video::format::{Nv12Layout, PixelFormat, Resolution};

nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, v4l2_control);
nix::ioctl_readwrite!(vidioc_encoder_cmd, b'V', 77, v4l2_encoder_cmd);

/// Driver and card names reported by the Venus encoder node
const VIDC_DRIVER: &str = "msm_vidc_driver";
const VIDC_ENCODER_CARD: &str = "msm_vidc_venc";

const V4L2_ENC_CMD_START: u32 = 0;
const V4L2_ENC_CMD_STOP: u32 = 1;

/// Standard MPEG-class codec controls
mod cid {
    const MPEG_BASE: u32 = 0x0099_0900;

    pub const BITRATE: u32 = MPEG_BASE + 207;
    pub const HEADER_MODE: u32 = MPEG_BASE + 216;
    pub const MULTI_SLICE_MODE: u32 = MPEG_BASE + 221;
    pub const H264_ENTROPY_MODE: u32 = MPEG_BASE + 352;
    pub const H264_LEVEL: u32 = MPEG_BASE + 354;
    pub const H264_LOOP_FILTER_ALPHA: u32 = MPEG_BASE + 355;
    pub const H264_LOOP_FILTER_BETA: u32 = MPEG_BASE + 356;
    pub const H264_LOOP_FILTER_MODE: u32 = MPEG_BASE + 357;
    pub const H264_PROFILE: u32 = MPEG_BASE + 358;

    pub const HEADER_MODE_SEPARATE: i32 = 0;
    pub const H264_PROFILE_HIGH: i32 = 4;
    pub const H264_ENTROPY_CABAC: i32 = 1;

    /// msm_vidc vendor controls
    pub mod vidc {
        const VIDC_BASE: u32 = 0x0099_2000;

        pub const NUM_P_FRAMES: u32 = VIDC_BASE + 15;
        pub const NUM_B_FRAMES: u32 = VIDC_BASE + 16;
        pub const IDR_PERIOD: u32 = VIDC_BASE + 17;
        pub const RATE_CONTROL: u32 = VIDC_BASE + 19;
        pub const H264_CABAC_MODEL: u32 = VIDC_BASE + 21;
        pub const HEVC_PROFILE: u32 = VIDC_BASE + 72;
        pub const HEVC_TIER_LEVEL: u32 = VIDC_BASE + 73;
        pub const PRIORITY: u32 = VIDC_BASE + 86;

        pub const RATE_CONTROL_VBR_CFR: i32 = 2;
        pub const PRIORITY_REALTIME_DISABLE: i32 = 1;
        pub const HEVC_PROFILE_MAIN: i32 = 0;
        pub const HEVC_HIGH_TIER_LEVEL_5: i32 = 15;
        pub const H264_LEVEL_UNKNOWN: i32 = 17;
        pub const CABAC_MODEL_0: i32 = 0;
    }
}

/// mmap'd plane handed out as device buffer memory
struct MappedPlane(PlaneMapping);

// SAFETY: the mapping is owned by exactly one DeviceBuffer and only touched
// under its lock; the kernel side is synchronized by queue ownership.
unsafe impl Send for MappedPlane {}

impl Deref for MappedPlane {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for MappedPlane {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Encoder device node
pub struct V4l2Device {
    fd: File,
    name: String,
}

fn queue_type(role: QueueRole) -> QueueType {
    match role {
        QueueRole::RawInput => QueueType::VideoOutputMplane,
        QueueRole::EncodedOutput => QueueType::VideoCaptureMplane,
    }
}

/// Vendor controls in `apply_controls` only exist on the msm_vidc encoder
fn check_identity(driver: &str, card: &str) -> Result<()> {
    if driver != VIDC_DRIVER || card != VIDC_ENCODER_CARD {
        return Err(EncoderError::device(
            "querycap",
            format!(
                "unsupported encoder {}/{}, expected {}/{}",
                driver, card, VIDC_DRIVER, VIDC_ENCODER_CARD
            ),
        ));
    }
    Ok(())
}

impl V4l2Device {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fd = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EncoderError::device("open", format!("{}: {}", path.display(), e)))?;

        let caps: Capability =
            ioctl::querycap(&fd).map_err(|e| EncoderError::device("querycap", e))?;
        check_identity(&caps.driver, &caps.card)?;
        if !caps.device_caps().contains(Capabilities::VIDEO_M2M_MPLANE) {
            return Err(EncoderError::device(
                "querycap",
                format!("{} is not a multi-planar mem2mem device", path.display()),
            ));
        }

        info!("Opened encoder {} ({})", path.display(), caps.card);
        Ok(Self {
            fd,
            name: caps.card,
        })
    }

    fn set_format(
        &self,
        role: QueueRole,
        resolution: Resolution,
        format: PixelFormat,
    ) -> Result<V4l2rFormat> {
        let queue = queue_type(role);
        let mut fmt: V4l2rFormat =
            ioctl::g_fmt(&self.fd, queue).map_err(|e| EncoderError::device("g_fmt", e))?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.pixelformat = V4l2rPixelFormat::from(&format.fourcc());

        // s_fmt wants exclusive access to the descriptor; configure only borrows self
        let mut fd = self
            .fd
            .try_clone()
            .map_err(|e| EncoderError::device("s_fmt", e))?;
        let actual: V4l2rFormat =
            ioctl::s_fmt(&mut fd, (queue, &fmt)).map_err(|e| EncoderError::device("s_fmt", e))?;
        if actual.width != resolution.width || actual.height != resolution.height {
            return Err(EncoderError::device(
                "s_fmt",
                format!(
                    "{} queue: requested {}, driver chose {}x{}",
                    role, resolution, actual.width, actual.height
                ),
            ));
        }
        debug!("{} format: {:?}", role, actual);
        Ok(actual)
    }

    fn set_fps(&self, fps: u32) -> Result<()> {
        let mut params = unsafe { std::mem::zeroed::<v4l2_streamparm>() };
        params.type_ = QueueType::VideoOutputMplane as u32;
        params.parm = v4l2_streamparm__bindgen_ty_1 {
            output: v4l2r::bindings::v4l2_outputparm {
                timeperframe: v4l2r::bindings::v4l2_fract {
                    numerator: 1,
                    denominator: fps,
                },
                ..unsafe { std::mem::zeroed() }
            },
        };
        let _actual: v4l2_streamparm =
            ioctl::s_parm(&self.fd, params).map_err(|e| EncoderError::device("s_parm", e))?;
        Ok(())
    }

    fn set_control(&self, id: u32, value: i32) -> Result<()> {
        let mut ctrl = v4l2_control { id, value };
        // SAFETY: ctrl is a valid v4l2_control for the duration of the call
        unsafe { vidioc_s_ctrl(self.fd.as_raw_fd(), &mut ctrl) }
            .map_err(|e| EncoderError::device("s_ctrl", format!("control {:#x}: {}", id, e)))?;
        Ok(())
    }

    fn apply_controls(&self, params: &CodecParams) -> Result<()> {
        let mut controls = Vec::with_capacity(16);
        if params.separate_header {
            controls.push((cid::HEADER_MODE, cid::HEADER_MODE_SEPARATE));
        }
        controls.extend([
            (cid::BITRATE, params.bitrate as i32),
            (cid::vidc::PRIORITY, cid::vidc::PRIORITY_REALTIME_DISABLE),
            (cid::vidc::IDR_PERIOD, params.idr_period as i32),
        ]);
        match params.rate_control {
            RateControl::VbrCfr => {
                controls.push((cid::vidc::RATE_CONTROL, cid::vidc::RATE_CONTROL_VBR_CFR))
            }
        }
        match params.profile {
            Profile::HevcMain => {
                controls.push((cid::vidc::HEVC_PROFILE, cid::vidc::HEVC_PROFILE_MAIN))
            }
            Profile::H264High => controls.push((cid::H264_PROFILE, cid::H264_PROFILE_HIGH)),
        }
        match params.level {
            Level::HevcHighTier5 => {
                controls.push((cid::vidc::HEVC_TIER_LEVEL, cid::vidc::HEVC_HIGH_TIER_LEVEL_5))
            }
            Level::H264Unknown => controls.push((cid::H264_LEVEL, cid::vidc::H264_LEVEL_UNKNOWN)),
        }
        controls.push((cid::vidc::NUM_P_FRAMES, params.p_frames as i32));
        controls.push((cid::vidc::NUM_B_FRAMES, params.b_frames as i32));
        if let Some(EntropyMode::Cabac0) = params.entropy {
            controls.extend([
                (cid::H264_ENTROPY_MODE, cid::H264_ENTROPY_CABAC),
                (cid::vidc::H264_CABAC_MODEL, cid::vidc::CABAC_MODEL_0),
                (cid::H264_LOOP_FILTER_MODE, 0),
                (cid::H264_LOOP_FILTER_ALPHA, 0),
                (cid::H264_LOOP_FILTER_BETA, 0),
                (cid::MULTI_SLICE_MODE, 0),
            ]);
        }

        for (id, value) in controls {
            self.set_control(id, value)?;
        }
        Ok(())
    }

    fn encoder_cmd(&self, cmd: u32, op: &'static str) -> Result<()> {
        let mut command = unsafe { std::mem::zeroed::<v4l2_encoder_cmd>() };
        command.cmd = cmd;
        // SAFETY: command is a valid, zeroed v4l2_encoder_cmd
        unsafe { vidioc_encoder_cmd(self.fd.as_raw_fd(), &mut command) }
            .map_err(|e| EncoderError::device(op, e))?;
        Ok(())
    }
}

impl DeviceSession for V4l2Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&self, params: &CodecParams) -> Result<FormatInfo> {
        let capture = self.set_format(
            QueueRole::EncodedOutput,
            params.output,
            params.output_format(),
        )?;
        let output = self.set_format(QueueRole::RawInput, params.input, params.input_format())?;

        if let Err(e) = self.set_fps(params.fps) {
            warn!("Failed to set encoder frame rate: {}", e);
        }
        self.apply_controls(params)?;

        let input_layout = Nv12Layout::venus(params.input);
        let input_size = output
            .plane_fmt
            .first()
            .map_or(0, |p| p.sizeimage as usize)
            .max(input_layout.buffer_size());
        let output_size = capture
            .plane_fmt
            .first()
            .map_or(0, |p| p.sizeimage as usize);
        if output_size == 0 {
            return Err(EncoderError::device("s_fmt", "driver reported no output buffer size"));
        }

        Ok(FormatInfo {
            input_size,
            output_size,
            input_layout,
        })
    }

    fn request_buffers(&self, role: QueueRole, count: u32) -> Result<Vec<DeviceBuffer>> {
        let queue = queue_type(role);
        let req: v4l2r::bindings::v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            queue,
            MemoryType::Mmap,
            count,
            MemoryConsistency::empty(),
        )
        .map_err(|e| EncoderError::device("reqbufs", e))?;

        let mut buffers = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let query: ioctl::QueryBuffer = ioctl::querybuf(&self.fd, queue, index as usize)
                .map_err(|e| EncoderError::device("querybuf", e))?;
            let plane = query.planes.first().ok_or_else(|| {
                EncoderError::device("querybuf", format!("buffer {} has no planes", index))
            })?;
            let mapping = ioctl::mmap(&self.fd, plane.mem_offset, plane.length)
                .map_err(|e| EncoderError::device("mmap", e))?;
            buffers.push(DeviceBuffer::new(index, Box::new(MappedPlane(mapping))));
        }
        debug!("{}: {} buffers allocated", role, buffers.len());
        Ok(buffers)
    }

    fn submit(
        &self,
        role: QueueRole,
        buffer: &DeviceBuffer,
        bytes_used: usize,
        timestamp: Timestamp,
    ) -> Result<()> {
        let mut plane = unsafe { std::mem::zeroed::<v4l2_plane>() };
        plane.bytesused = bytes_used as u32;
        plane.length = buffer.len() as u32;

        let mut buf = unsafe { std::mem::zeroed::<v4l2_buffer>() };
        buf.index = buffer.index();
        buf.type_ = queue_type(role) as u32;
        buf.memory = MemoryType::Mmap as u32;
        buf.flags = BufferFlags::TIMESTAMP_COPY;
        let (sec, usec) = timestamp.as_timeval();
        buf.timestamp.tv_sec = sec as _;
        buf.timestamp.tv_usec = usec as _;
        buf.m.planes = &mut plane;
        buf.length = 1;

        // SAFETY: buf and the plane it points to outlive the call
        unsafe { vidioc_qbuf(self.fd.as_raw_fd(), &mut buf) }
            .map_err(|e| EncoderError::device("qbuf", format!("{} {}: {}", role, buffer.index(), e)))?;
        Ok(())
    }

    fn dequeue(&self, role: QueueRole) -> Result<Completion> {
        let dqbuf: V4l2Buffer = ioctl::dqbuf(&self.fd, queue_type(role))
            .map_err(|e| EncoderError::device("dqbuf", format!("{}: {}", role, e)))?;
        let raw = dqbuf.as_v4l2_buffer();
        let bytes_used = dqbuf
            .planes_iter()
            .next()
            .map_or(0, |plane| *plane.bytesused as usize);

        Ok(Completion {
            index: raw.index,
            bytes_used,
            flags: BufferFlags(raw.flags),
            timestamp: Timestamp::from_timeval(raw.timestamp.tv_sec as i64, raw.timestamp.tv_usec as i64),
        })
    }

    fn poll(&self, timeout: Duration) -> Result<Readiness> {
        let mut fds = [PollFd::new(
            self.fd.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLOUT,
        )];
        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let ready = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| EncoderError::device("poll", e))?;
        if ready == 0 {
            return Ok(Readiness::default());
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLERR) {
            return Err(EncoderError::device("poll", "POLLERR"));
        }
        Ok(Readiness {
            output_ready: revents.contains(PollFlags::POLLIN),
            input_released: revents.contains(PollFlags::POLLOUT),
        })
    }

    fn stream_on(&self, role: QueueRole) -> Result<()> {
        ioctl::streamon(&self.fd, queue_type(role)).map_err(|e| EncoderError::device("streamon", e))
    }

    fn stream_off(&self, role: QueueRole) -> Result<()> {
        ioctl::streamoff(&self.fd, queue_type(role))
            .map_err(|e| EncoderError::device("streamoff", e))
    }

    fn start(&self) -> Result<()> {
        self.encoder_cmd(V4L2_ENC_CMD_START, "encoder_cmd start")
    }

    fn stop(&self) -> Result<()> {
        self.encoder_cmd(V4L2_ENC_CMD_STOP, "encoder_cmd stop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_identity() {
        check_identity("msm_vidc_driver", "msm_vidc_venc").unwrap();

        let err = check_identity("msm_vidc_driver", "msm_vidc_vdec").unwrap_err();
        assert!(matches!(err, EncoderError::Device { op: "querycap", .. }));
        assert!(check_identity("hantro-vpu", "msm_vidc_venc").is_err());
    }

    #[test]
    fn test_queue_types() {
        assert_eq!(queue_type(QueueRole::RawInput), QueueType::VideoOutputMplane);
        assert_eq!(
            queue_type(QueueRole::EncodedOutput),
            QueueType::VideoCaptureMplane
        );
    }
}
