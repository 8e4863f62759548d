//! H.264 Recorder - Main Entry Point
//!
//! ```bash
//! # Record /dev/video0 into clip_out.h264 until Ctrl-C
//! h264-recorder /dev/video0 clip
//!
//! # Settings from a file, overridden by the environment
//! RECORDER_CAPTURE__WIDTH=1920 h264-recorder --config cam.toml
//!
//! # Exercise the pipeline without a camera
//! h264-recorder --dry-run /dev/video0 clip
//! ```

use anyhow::{Context, Result};
use h264_recorder::{init_logging, record, CliArgs, RecorderSettings};
use tracing::{error, info};
use v4l2_capture::StopSignal;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::from_env()?;
    let settings = RecorderSettings::load(&args).context("Failed to load settings")?;
    init_logging(&settings.log)?;

    info!("=== H.264 Recorder v{} ===", env!("CARGO_PKG_VERSION"));
    let source = if settings.dry_run {
        "synthetic camera".to_string()
    } else {
        settings.capture.device.display().to_string()
    };
    info!(
        "Capturing {} at {}x{} {} ({}) into {}",
        source,
        settings.capture.width,
        settings.capture.height,
        settings.capture.pixel_format,
        settings.capture.frame_interval,
        settings.output.path().display()
    );

    let stop = StopSignal::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping capture");
            ctrl_c_stop.request_stop();
        }
    });

    let capture_stop = stop.clone();
    let result = tokio::task::spawn_blocking(move || record(&settings, &capture_stop))
        .await
        .context("Capture task panicked")?;

    match result {
        Ok(stats) => {
            info!(
                "Capture finished: {} frames, {} bytes, {} poll timeouts",
                stats.frames, stats.bytes, stats.timeouts
            );
            Ok(())
        }
        Err(err) => {
            error!("Capture failed: {}", err);
            Err(err).context("Recording aborted")
        }
    }
}
