//! Extract, patch and repackage an IPA.
//!
//! One [`Repackager::process`] call owns one extracted tree inside the
//! configured work directory. The tree is a [`TempDir`] guard created before
//! extraction starts, so it is gone by the time the call returns whatever the
//! outcome. The source archive is only ever read.

use crate::app_bundle::AppBundle;
use crate::config::Config;
use crate::error::CirclefyError;
use crate::executable::{ExecutablePatcher, HandoffError, PatchExecutor, PlatformCode};
use crate::ipa::ArchiveCodec;
use crate::notify::{NoProgress, Notifier, ProgressSink, Severity, Stage, TracingNotifier};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Failed to extract IPA: {0}")]
    ExtractionFailed(String),

    #[error("Failed to locate executable: {0}")]
    ExecutableNotFound(String),

    #[error("Multiple app bundles in Payload: {}", .0.join(", "))]
    AmbiguousBundle(Vec<String>),

    #[error("Patch routine is unavailable")]
    PatchUnavailable,

    #[error("Failed to patch executable: {0}")]
    PatchFailed(String),

    #[error("Patch routine did not finish within {}s", .0.as_secs())]
    PatchTimeout(Duration),

    #[error("Failed to create modified IPA: {0}")]
    PackagingFailed(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<HandoffError> for PipelineError {
    fn from(e: HandoffError) -> Self {
        match e {
            HandoffError::Timeout(d) => PipelineError::PatchTimeout(d),
            HandoffError::Closed => PipelineError::PatchUnavailable,
            HandoffError::Failed(msg) => PipelineError::PatchFailed(msg),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Which of the two entry points is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Fresh,
    Signed,
}

impl Flow {
    fn tree_suffix(self) -> &'static str {
        match self {
            Flow::Fresh => "",
            Flow::Signed => "_signed_extract",
        }
    }

    fn output_suffix(self) -> &'static str {
        match self {
            Flow::Fresh => "_circlefy.ipa",
            Flow::Signed => "_circlefy_signed.ipa",
        }
    }
}

pub struct Repackager {
    config: Config,
    codec: ArchiveCodec,
    executor: PatchExecutor,
    notifier: Arc<dyn Notifier>,
    progress: Arc<dyn ProgressSink>,
}

impl Repackager {
    /// Spawns the patch executor for `patcher` with the configured timeout.
    pub fn new(config: Config, patcher: Arc<dyn ExecutablePatcher>) -> crate::Result<Self> {
        config.validate()?;
        let executor = PatchExecutor::spawn(patcher, config.patch_timeout())?;
        Ok(Self {
            codec: ArchiveCodec::new(config.compression_level),
            config,
            executor,
            notifier: Arc::new(TracingNotifier),
            progress: Arc::new(NoProgress),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Repackages an unsigned archive into `<documents>/<uuid>_circlefy.ipa`.
    pub fn process(
        &self,
        source: &Path,
        platform: PlatformCode,
        cancel: &CancellationToken,
    ) -> PipelineResult<PathBuf> {
        self.run(Flow::Fresh, source, platform, cancel)
    }

    /// Same steps on an already signed archive; output is
    /// `<documents>/<uuid>_circlefy_signed.ipa`.
    pub fn process_signed(
        &self,
        source: &Path,
        platform: PlatformCode,
        cancel: &CancellationToken,
    ) -> PipelineResult<PathBuf> {
        self.notifier.notify(
            "Starting Circlefy modification on signed IPA...",
            Severity::Warning,
        );
        self.run(Flow::Signed, source, platform, cancel)
    }

    fn run(
        &self,
        flow: Flow,
        source: &Path,
        platform: PlatformCode,
        cancel: &CancellationToken,
    ) -> PipelineResult<PathBuf> {
        self.progress.stage(Stage::Idle);
        let span = tracing::info_span!("repackage", ?flow, source = %source.display());
        let _enter = span.enter();

        let result = self.run_steps(flow, source, platform, cancel);
        match &result {
            Ok(path) => {
                self.progress.stage(Stage::Done);
                let name = path
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                self.notifier
                    .notify(&format!("Saved {}", name), Severity::Success);
                tracing::info!(output = %path.display(), "repackaging finished");
            }
            Err(e) => {
                self.progress.stage(Stage::Failed);
                self.notifier.notify(&e.to_string(), Severity::Error);
                tracing::warn!("repackaging failed: {}", e);
            }
        }
        result
    }

    fn run_steps(
        &self,
        flow: Flow,
        source: &Path,
        platform: PlatformCode,
        cancel: &CancellationToken,
    ) -> PipelineResult<PathBuf> {
        checkpoint(cancel)?;
        self.progress.stage(Stage::Extracting);
        let tree = self.create_tree(flow)?;
        tracing::debug!(tree = %tree.path().display(), "created extracted tree");

        self.codec
            .try_decompress(source, tree.path(), |p| {
                self.progress.progress(Stage::Extracting, p)
            })
            .map_err(|e| PipelineError::ExtractionFailed(e.to_string()))?;
        self.notifier.notify(
            &format!("Applying {} mask to IPA", platform.mask_name()),
            Severity::Warning,
        );

        checkpoint(cancel)?;
        self.progress.stage(Stage::Locating);
        let bundle = AppBundle::locate(tree.path()).map_err(|e| match e {
            CirclefyError::AmbiguousBundle(names) => PipelineError::AmbiguousBundle(names),
            other => PipelineError::ExecutableNotFound(other.to_string()),
        })?;
        let executable = bundle.executable_path();

        checkpoint(cancel)?;
        self.progress.stage(Stage::Probing);
        if !self.executor.is_available()? {
            return Err(PipelineError::PatchUnavailable);
        }

        checkpoint(cancel)?;
        self.progress.stage(Stage::Patching);
        self.executor.patch(executable, platform)?;
        self.notifier.notify(
            match flow {
                Flow::Fresh => "Circlefy modification applied",
                Flow::Signed => "Circlefy modification applied to signed executable",
            },
            Severity::Success,
        );

        checkpoint(cancel)?;
        self.progress.stage(Stage::Packaging);
        let destination = self.destination(flow)?;
        self.codec
            .try_compress_payload(tree.path(), &destination, |p| {
                self.progress.progress(Stage::Packaging, p)
            })
            .map_err(|e| PipelineError::PackagingFailed(e.to_string()))?;

        if let Err(e) = tree.close() {
            tracing::warn!("failed to remove extracted tree: {}", e);
        }
        Ok(destination)
    }

    fn create_tree(&self, flow: Flow) -> PipelineResult<TempDir> {
        let work_dir = &self.config.work_dir;
        fs::create_dir_all(work_dir)
            .map_err(|e| PipelineError::ExtractionFailed(e.to_string()))?;

        tempfile::Builder::new()
            .prefix(&uuid::Uuid::new_v4().to_string())
            .suffix(flow.tree_suffix())
            .rand_bytes(0)
            .tempdir_in(work_dir)
            .map_err(|e| PipelineError::ExtractionFailed(e.to_string()))
    }

    fn destination(&self, flow: Flow) -> PipelineResult<PathBuf> {
        let dir = &self.config.documents_dir;
        fs::create_dir_all(dir).map_err(|e| PipelineError::PackagingFailed(e.to_string()))?;
        Ok(dir.join(format!("{}{}", uuid::Uuid::new_v4(), flow.output_suffix())))
    }
}

fn checkpoint(cancel: &CancellationToken) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_errors_map_to_pipeline_errors() {
        assert_eq!(
            PipelineError::from(HandoffError::Timeout(Duration::from_secs(3))),
            PipelineError::PatchTimeout(Duration::from_secs(3))
        );
        assert_eq!(
            PipelineError::from(HandoffError::Closed),
            PipelineError::PatchUnavailable
        );
        assert_eq!(
            PipelineError::from(HandoffError::Failed("bad".into())),
            PipelineError::PatchFailed("bad".into())
        );
    }

    #[test]
    fn flows_name_their_outputs() {
        assert_eq!(Flow::Fresh.output_suffix(), "_circlefy.ipa");
        assert_eq!(Flow::Signed.output_suffix(), "_circlefy_signed.ipa");
        assert_eq!(Flow::Signed.tree_suffix(), "_signed_extract");
    }

    #[test]
    fn timeout_message_is_readable() {
        let e = PipelineError::PatchTimeout(Duration::from_secs(120));
        assert_eq!(e.to_string(), "Patch routine did not finish within 120s");
    }
}
