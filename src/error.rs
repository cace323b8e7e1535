use std::path::PathBuf;
use thiserror::Error;

/// Low-level failures from the archive, plist, Mach-O and config layers.
#[derive(Error, Debug)]
pub enum CirclefyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("Mach-O parse error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Multiple app bundles in Payload: {}", .0.join(", "))]
    AmbiguousBundle(Vec<String>),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid archive: {0}")]
    InvalidArchive(String),

    #[error("Mach-O patch error: {0}")]
    MachO(String),

    /// Terminal outcome of a repackaging run.
    #[error("{0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),
}

pub type Result<T> = std::result::Result<T, CirclefyError>;
