//! H.264 Recorder
//!
//! Thin surface over `v4l2-capture`: loads settings, installs logging and
//! streams a camera's encoded output into `<base>_out.h264`. A dry run feeds
//! the same pipeline from the synthetic driver instead of a camera.

pub mod error;
pub mod output;
pub mod settings;

pub use error::{RecorderError, SettingsError};
pub use output::{open_output, output_path, OutputSettings};
pub use settings::{CliArgs, LogSettings, RecorderSettings};

use std::io::BufWriter;
use std::str::FromStr;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use v4l2_capture::mock::{MockDevice, MockScript};
use v4l2_capture::{CaptureSession, ControlChannel, LoopStats, StopSignal, WriterSink};

/// Size of every frame the dry-run camera delivers
pub const DRY_RUN_FRAME_SIZE: u32 = 4096;

/// Initialize logging
pub fn init_logging(settings: &LogSettings) -> Result<(), SettingsError> {
    let level = Level::from_str(&settings.level)
        .map_err(|_| SettingsError::LogLevel(settings.level.clone()))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);
    let installed = if settings.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.map_err(|err| SettingsError::Logging(err.to_string()))
}

/// Record from the configured device until `stop` is requested
pub fn record(settings: &RecorderSettings, stop: &StopSignal) -> Result<LoopStats, RecorderError> {
    if settings.dry_run {
        info!("Dry run: capturing from a synthetic camera");
        let device = MockDevice::new(MockScript::paced(DRY_RUN_FRAME_SIZE));
        return record_with(CaptureSession::with_device(device), settings, stop);
    }
    let session = CaptureSession::open(&settings.capture.device)?;
    record_with(session, settings, stop)
}

/// Record through an already opened session.
///
/// The output file is created only once the device is open, so a missing
/// device leaves no empty output behind.
pub fn record_with<D: ControlChannel>(
    session: CaptureSession<D>,
    settings: &RecorderSettings,
    stop: &StopSignal,
) -> Result<LoopStats, RecorderError> {
    let path = settings.output.path();
    let mut sink = WriterSink::new(BufWriter::new(open_output(&path)?));

    let stats = session.capture(&settings.capture, &mut sink, stop)?;
    info!(
        "Recorded {} frames ({} bytes) to {}",
        stats.frames,
        stats.bytes,
        path.display()
    );
    Ok(stats)
}
