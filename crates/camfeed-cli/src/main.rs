//! `camfeed`: run a preview pipeline against the virtual camera with the
//! headless GPU and display backends, then print the final metrics.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use camfeed_capture::{VirtualCameraConfig, VirtualCameraProvider};
use camfeed_encoder::{SurfaceEncoder, VideoEncoderConfig};
use camfeed_engine::CameraPreview;
use camfeed_gpu::HeadlessGpu;
use camfeed_ipc::{NegotiatedFormat, PipelineConfig, PipelineEvent, ScaleMode, Size};
use camfeed_render::RecordingDisplay;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Surface id the encoder is registered under.
const ENCODER_SURFACE_ID: u32 = 2;

const METRICS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "camfeed")]
#[command(about = "Run a headless camera preview pipeline")]
#[command(version)]
struct Cli {
    /// JSON pipeline configuration; missing fields take defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to run
    #[arg(short, long, default_value = "5")]
    duration_secs: u64,

    /// Override the configured scale mode
    #[arg(short, long)]
    scale_mode: Option<ScaleMode>,

    /// Run the bridge on its own shared GPU context
    #[arg(long)]
    shared_context: bool,

    /// Attach a pass-through encoder once the format is negotiated
    #[arg(short, long)]
    encode: bool,

    /// Display surface size
    #[arg(long, default_value = "1920x1080", value_parser = parse_size)]
    view: Size,
}

fn parse_size(s: &str) -> Result<Size, String> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let width = width.parse().map_err(|e| format!("bad width: {e}"))?;
    let height = height.parse().map_err(|e| format!("bad height: {e}"))?;
    Ok(Size::new(width, height))
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "camfeed=debug,camfeed_engine=debug,camfeed_capture=debug,camfeed_gpu=info,camfeed_render=info,camfeed_encoder=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(mode) = cli.scale_mode {
        config.scale_mode = mode;
    }
    if cli.shared_context {
        config.shared_gpu_context = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn start_encoder(preview: &CameraPreview, format: &NegotiatedFormat) -> Result<SurfaceEncoder> {
    let size = format.actual_size();
    let encoder = SurfaceEncoder::raw(
        "camfeed",
        VideoEncoderConfig {
            width: size.width,
            height: size.height,
            fps: format.frame_rate.max_fps().round().max(1.0) as u32,
            ..Default::default()
        },
    )?;
    encoder.start()?;
    preview.attach_encoder(ENCODER_SURFACE_ID, &encoder)?;
    info!(recording = ?preview.recording_surface_ids(), "Recording surfaces");
    Ok(encoder)
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    if cli.view.is_empty() {
        bail!("view size must be non-zero");
    }
    let config = load_config(&cli)?;
    info!(?config, "Starting camfeed");

    let gpu = HeadlessGpu::new();
    let (display, display_log) = RecordingDisplay::new();
    let provider = Arc::new(VirtualCameraProvider::new(VirtualCameraConfig::default()));
    let camera_stats = provider.stats();
    let preview = CameraPreview::new(config, provider, gpu.context(), Box::new(display))?;
    let events = preview.events();

    preview.surface_created()?;
    preview.surface_changed(cli.view.width, cli.view.height)?;

    let mut encoder: Option<SurfaceEncoder> = None;
    let mut encoded_packets = 0u64;
    let mut encoded_bytes = 0u64;
    let deadline = Instant::now() + Duration::from_secs(cli.duration_secs);
    let mut next_report = Instant::now() + METRICS_INTERVAL;

    while Instant::now() < deadline {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PipelineEvent::Negotiated(format)) => {
                info!(
                    size = %format.actual_size(),
                    rotation = format.rotation_degrees,
                    "Negotiated"
                );
                if cli.encode && encoder.is_none() {
                    match start_encoder(&preview, &format) {
                        Ok(started) => encoder = Some(started),
                        Err(e) => warn!(error = %e, "Failed to start encoder"),
                    }
                }
            }
            Ok(PipelineEvent::RenderFatal { message }) => bail!("render failed: {message}"),
            Ok(event) => debug!(?event, "Pipeline event"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(encoder) = &encoder {
            for packet in encoder.packets().try_iter() {
                encoded_packets += 1;
                encoded_bytes += packet.data.len() as u64;
            }
        }

        if Instant::now() >= next_report {
            let metrics = preview.report_metrics();
            info!(
                fps = metrics.fps,
                rendered = metrics.frames_rendered,
                coalesced = metrics.frames_coalesced,
                "Metrics"
            );
            next_report += METRICS_INTERVAL;
        }
    }

    preview.on_pause()?;
    if let Some(encoder) = encoder.take() {
        preview.remove_surface(ENCODER_SURFACE_ID);
        encoder.stop();
        for packet in encoder.packets().try_iter() {
            encoded_packets += 1;
            encoded_bytes += packet.data.len() as u64;
        }
        info!(
            packets = encoded_packets,
            bytes = encoded_bytes,
            dropped = encoder.input().frames_dropped(),
            "Encoder finished"
        );
    }

    let metrics = preview.metrics();
    preview.surface_destroyed()?;
    info!(
        frames_produced = camera_stats.frames_produced(),
        draws = display_log.draws(),
        "Pipeline finished"
    );
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
