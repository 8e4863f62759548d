//! Recorder settings
//!
//! Layers, lowest first: built-in defaults, an optional TOML file, `RECORDER_*`
//! environment variables (`__` separates nested keys, e.g.
//! `RECORDER_CAPTURE__WIDTH=1920`), then the positional command line.

use std::path::PathBuf;

use config::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use tracing::debug;
use v4l2_capture::CaptureConfig;

use crate::error::SettingsError;
use crate::output::OutputSettings;

/// Configuration file read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "recorder.toml";

pub const USAGE: &str = "h264-recorder [--config <file>] [--dry-run] [<device>] [<output-base>]";

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Max level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Everything the recorder needs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub capture: CaptureConfig,
    pub output: OutputSettings,
    pub log: LogSettings,
    /// Capture from a synthetic camera instead of the configured device
    pub dry_run: bool,
}

/// Parsed command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub device: Option<PathBuf>,
    pub output_base: Option<PathBuf>,
    pub dry_run: bool,
}

impl CliArgs {
    /// Parse arguments, excluding the program name
    pub fn parse<I, S>(args: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = Self::default();
        let mut positional = Vec::new();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    let path = args.next().ok_or_else(|| {
                        SettingsError::Usage(format!("{} requires a path\n{}", arg, USAGE))
                    })?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "-n" | "--dry-run" => parsed.dry_run = true,
                "-h" | "--help" => return Err(SettingsError::Usage(USAGE.to_string())),
                flag if flag.starts_with('-') && flag.len() > 1 => {
                    return Err(SettingsError::Usage(format!(
                        "unknown option {}\n{}",
                        flag, USAGE
                    )));
                }
                _ => positional.push(PathBuf::from(arg)),
            }
        }

        if positional.len() > 2 {
            return Err(SettingsError::Usage(format!(
                "too many arguments\n{}",
                USAGE
            )));
        }
        let mut positional = positional.into_iter();
        parsed.device = positional.next();
        parsed.output_base = positional.next();
        Ok(parsed)
    }

    /// Parse the process arguments
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::parse(std::env::args().skip(1))
    }
}

impl RecorderSettings {
    /// Load settings using the process environment
    pub fn load(args: &CliArgs) -> Result<Self, SettingsError> {
        Self::load_with_env(args, None)
    }

    /// Load settings, reading environment variables from `env` when given
    pub fn load_with_env(
        args: &CliArgs,
        env: Option<Map<String, String>>,
    ) -> Result<Self, SettingsError> {
        let (file, required) = match &args.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        debug!("Loading settings (file: {}, required: {})", file.display(), required);

        let mut builder = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(file.as_path()).required(required))
            .add_source(
                Environment::with_prefix("RECORDER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            );

        if let Some(device) = &args.device {
            builder = builder.set_override("capture.device", device.to_string_lossy().into_owned())?;
        }
        if let Some(base) = &args.output_base {
            builder = builder.set_override("output.base", base.to_string_lossy().into_owned())?;
        }
        if args.dry_run {
            builder = builder.set_override("dry_run", true)?;
        }

        let settings: Self = builder.build()?.try_deserialize()?;
        settings
            .capture
            .validate()
            .map_err(|err| SettingsError::Invalid(err.to_string()))?;
        Ok(settings)
    }
}
