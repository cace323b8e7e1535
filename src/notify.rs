//! Collaborator sinks the core reports into.
//!
//! The pipeline never talks to a UI directly: human-readable status goes to a
//! [`Notifier`], stage changes and archive percentages go to a
//! [`ProgressSink`]. Both are observational and never affect control flow.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Stages of one repackaging invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Extracting,
    Locating,
    Probing,
    Patching,
    Packaging,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Extracting => "extracting",
            Stage::Locating => "locating",
            Stage::Probing => "probing",
            Stage::Patching => "patching",
            Stage::Packaging => "packaging",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub trait ProgressSink: Send + Sync {
    fn stage(&self, stage: Stage);

    /// Percentage in `[0, 100]` for the archive step running in `stage`.
    fn progress(&self, stage: Stage, percent: f32);
}

/// Routes notifications into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => tracing::info!("{}", message),
            Severity::Warning => tracing::warn!("{}", message),
            Severity::Error => tracing::error!("{}", message),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn stage(&self, stage: Stage) {
        tracing::debug!(%stage, "stage changed");
    }

    fn progress(&self, _stage: Stage, _percent: f32) {}
}
