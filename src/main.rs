use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use venc_logger::config::{self, AppConfig, DeviceBackend, DeviceConfig, SessionConfig};
use venc_logger::container::RawStreamFactory;
use venc_logger::events::EncodeBus;
use venc_logger::video::device::mock::MockDevice;
use venc_logger::video::device::DeviceSession;
use venc_logger::video::encoder::EncodedPacket;
use venc_logger::video::frame::{i420_buffer_size, i420_chroma_size};
use venc_logger::video::{EncoderSession, FrameExtra, I420Frame, Resolution};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Encode device backend
#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Mock,
    V4l2,
}

impl From<BackendArg> for DeviceBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Mock => DeviceBackend::Mock,
            BackendArg::V4l2 => DeviceBackend::V4l2,
        }
    }
}

/// Hardware encoder logger command line arguments
#[derive(Parser, Debug)]
#[command(name = "venc-logger")]
#[command(version, about = "Encode camera streams on a hardware video encoder", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Encode device backend (overrides config)
    #[arg(short = 'b', long, value_name = "BACKEND")]
    backend: Option<BackendArg>,

    /// Encoder device node (overrides config)
    #[arg(long, value_name = "PATH")]
    device: Option<String>,

    /// Output directory for persisted streams (overrides config)
    #[arg(short = 'o', long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Number of frames to encode per session (overrides config)
    #[arg(short = 'n', long, value_name = "COUNT")]
    frames: Option<u32>,

    /// Per-packet debug output for every session (0, 1 or 2)
    #[arg(long, value_name = "LEVEL")]
    debug_level: Option<u8>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting venc-logger v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => config::store::load(path)?,
        None => AppConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let bus = Arc::new(EncodeBus::new());
    let factory = Arc::new(RawStreamFactory::new(&config.output_dir));
    let running = Arc::new(AtomicBool::new(true));

    let mut monitors = Vec::new();
    for session in &config.sessions {
        let rx = bus.subscribe(session.service_name());
        monitors.push(tokio::spawn(monitor_service(session.service_name(), rx)));
    }

    let mut encoders = Vec::new();
    for session in config.sessions.clone() {
        let device = open_device(&config.device, &session)?;
        let mut encoder = EncoderSession::new(session, device, bus.clone());
        if encoder.config().write {
            encoder = encoder.with_containers(factory.clone());
        }
        let frames = config.frames;
        let interval = Duration::from_millis(config.frame_interval_ms);
        let running = running.clone();
        encoders.push(tokio::task::spawn_blocking(move || {
            run_session(encoder, frames, interval, &running)
        }));
    }

    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                running.store(false, Ordering::Release);
            }
        });
    }

    let mut failed = false;
    for handle in encoders {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("{:#}", e);
                failed = true;
            }
            Err(e) => {
                tracing::error!("Encoder task panicked: {}", e);
                failed = true;
            }
        }
    }

    // Dropping the bus closes every service channel
    drop(bus);
    for monitor in monitors {
        let _ = monitor.await;
    }

    if failed {
        anyhow::bail!("encoder session failed");
    }
    tracing::info!("All encoder sessions finished");
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(backend) = args.backend {
        config.device.backend = backend.into();
    }
    if let Some(path) = &args.device {
        config.device.path = path.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(frames) = args.frames {
        config.frames = frames;
    }
    if let Some(level) = args.debug_level {
        for session in &mut config.sessions {
            session.debug_level = level;
        }
    }
}

fn open_device(
    device: &DeviceConfig,
    session: &SessionConfig,
) -> anyhow::Result<Arc<dyn DeviceSession>> {
    match device.backend {
        DeviceBackend::Mock => Ok(Arc::new(MockDevice::with_name(format!(
            "mock-{}",
            session.service_name()
        )))),
        #[cfg(feature = "v4l2")]
        DeviceBackend::V4l2 => {
            let device = venc_logger::video::device::v4l2::V4l2Device::open(&device.path)
                .with_context(|| format!("Failed to open encoder {}", device.path))?;
            Ok(Arc::new(device))
        }
        #[cfg(not(feature = "v4l2"))]
        DeviceBackend::V4l2 => {
            anyhow::bail!(
                "{}: built without V4L2 support (enable the `v4l2` feature)",
                device.path
            )
        }
    }
}

/// Feed `frames` synthetic frames through one encoder, one segment
fn run_session(
    mut encoder: EncoderSession,
    frames: u32,
    interval: Duration,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let service = encoder.config().service_name();
    let resolution = encoder.config().input_resolution();
    let mut pixels = vec![0u8; i420_buffer_size(resolution)];
    let start = Instant::now();

    encoder
        .open()
        .with_context(|| format!("{}: open failed", service))?;

    for frame_id in 0..frames {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let sof = start.elapsed().as_nanos() as u64;
        fill_test_pattern(&mut pixels, resolution, frame_id);
        let eof = start.elapsed().as_nanos() as u64;

        let frame = I420Frame::from_contiguous(&pixels, resolution)
            .context("test pattern buffer too small")?;
        encoder
            .submit_frame(&frame, &FrameExtra::new(frame_id, sof, eof))
            .with_context(|| format!("{}: frame {} failed", service, frame_id))?;

        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    encoder
        .close()
        .with_context(|| format!("{}: close failed", service))?;
    tracing::info!("{}: {:?}", service, encoder.stats());
    Ok(())
}

/// Moving diagonal gradient with slowly rotating chroma
fn fill_test_pattern(data: &mut [u8], resolution: Resolution, frame: u32) {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let (luma, chroma) = data.split_at_mut(width * height);
    for (row, line) in luma.chunks_exact_mut(width).enumerate() {
        for (col, px) in line.iter_mut().enumerate() {
            *px = (col + row + frame as usize * 4) as u8;
        }
    }
    let (u, v) = chroma.split_at_mut(i420_chroma_size(resolution));
    u.fill(128u8.wrapping_add((frame % 64) as u8));
    v.fill(128u8.wrapping_sub((frame % 64) as u8));
}

/// Count packets published on one service until the bus goes away
async fn monitor_service(service: &'static str, mut rx: broadcast::Receiver<bytes::Bytes>) {
    let mut packets = 0u64;
    let mut keyframes = 0u64;
    loop {
        match rx.recv().await {
            Ok(payload) => match EncodedPacket::decode(payload) {
                Ok(packet) => {
                    packets += 1;
                    if packet.is_keyframe() {
                        keyframes += 1;
                        tracing::debug!(
                            "{}: keyframe {} (segment {})",
                            service,
                            packet.encode_id,
                            packet.segment_num
                        );
                    }
                }
                Err(e) => tracing::warn!("{}: undecodable packet: {}", service, e),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("{}: monitor lagged, {} packets missed", service, n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::info!(
        "{}: {} packets published ({} keyframes)",
        service,
        packets,
        keyframes
    );
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "venc_logger=error",
        LogLevel::Warn => "venc_logger=warn",
        LogLevel::Info => "venc_logger=info",
        LogLevel::Verbose => "venc_logger=debug",
        LogLevel::Debug => "venc_logger=debug,v4l2r=info",
        LogLevel::Trace => "venc_logger=trace,v4l2r=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
