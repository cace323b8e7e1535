pub mod app_bundle;
pub mod config;
pub mod error;
pub mod executable;
pub mod ipa;
pub mod macho;
pub mod notify;
pub mod pipeline;
pub mod plist_ext;
pub mod repository;
pub mod validation;

pub use app_bundle::{inspect_archive, AppBundle, IpaSummary};
pub use config::Config;
pub use error::{CirclefyError, Result};
pub use executable::{ExecutablePatcher, HandoffError, MachoPlatformPatcher, PatchExecutor, PlatformCode};
pub use ipa::{archive_digest, package_app, ArchiveCodec};
pub use notify::{NoProgress, Notifier, ProgressSink, Severity, Stage, TracingNotifier};
pub use pipeline::{PipelineError, Repackager};
pub use plist_ext::PlistFile;
pub use repository::Repository;
pub use validation::{deduplicate_url_lines, filter_valid_urls, validate_repository, ValidationError};
