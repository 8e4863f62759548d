//! Output file naming and creation

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RecorderError;

/// Suffix appended to the output base name
pub const DEFAULT_SUFFIX: &str = "_out.h264";

/// Where the encoded stream is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Base name; the file is `<base><suffix>`
    pub base: PathBuf,
    pub suffix: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            base: PathBuf::from("capture"),
            suffix: DEFAULT_SUFFIX.to_string(),
        }
    }
}

impl OutputSettings {
    pub fn path(&self) -> PathBuf {
        output_path(&self.base, &self.suffix)
    }
}

/// `<base><suffix>`, e.g. `clip` -> `clip_out.h264`
pub fn output_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Create (or truncate) the output file with mode 0644
pub fn open_output(path: &Path) -> Result<File, RecorderError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map_err(|source| RecorderError::Output {
            path: path.to_path_buf(),
            source,
        })?;
    info!("Writing stream to {}", path.display());
    Ok(file)
}
