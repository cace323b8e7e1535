use crate::error::{CirclefyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_PATCH_TIMEOUT_SECS: u64 = 120;
const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Runtime settings for the repackager.
///
/// Every field may be omitted from the TOML file; missing fields fall back to
/// [`Config::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where finished archives are written.
    pub documents_dir: PathBuf,
    /// Where extracted trees live while a pipeline invocation runs.
    pub work_dir: PathBuf,
    /// Upper bound on each hand-off to the patch executor.
    pub patch_timeout_secs: u64,
    /// 0 stores entries, 1-9 deflate.
    pub compression_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("circlefy");
        let documents_dir = base.join("Documents");
        Self {
            work_dir: documents_dir.clone(),
            documents_dir,
            patch_timeout_secs: DEFAULT_PATCH_TIMEOUT_SECS,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CirclefyError::FileNotFound(path.to_path_buf()));
        }
        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(CirclefyError::InvalidInput(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.patch_timeout_secs == 0 {
            return Err(CirclefyError::InvalidInput(
                "patch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn patch_timeout(&self) -> Duration {
        Duration::from_secs(self.patch_timeout_secs)
    }

    pub fn with_documents_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        let dir = dir.into();
        self.work_dir = dir.clone();
        self.documents_dir = dir;
        self
    }
}
