use crate::error::{CirclefyError, Result};
use crate::macho;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Platform marker written into `LC_BUILD_VERSION`. Values follow the Mach-O
/// `PLATFORM_*` constants; unknown values are passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformCode(pub u32);

impl PlatformCode {
    pub const MACOS: PlatformCode = PlatformCode(1);
    pub const IOS: PlatformCode = PlatformCode(2);
    pub const VISIONOS: PlatformCode = PlatformCode(11);

    /// Name of the icon mask the platform gets on the home screen.
    pub fn mask_name(self) -> &'static str {
        if self == Self::VISIONOS {
            "Circle"
        } else {
            "No Mask"
        }
    }
}

impl Default for PlatformCode {
    fn default() -> Self {
        Self::VISIONOS
    }
}

impl fmt::Display for PlatformCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MACOS => write!(f, "macos ({})", self.0),
            Self::IOS => write!(f, "ios ({})", self.0),
            Self::VISIONOS => write!(f, "visionos ({})", self.0),
            other => write!(f, "{}", other.0),
        }
    }
}

impl FromStr for PlatformCode {
    type Err = CirclefyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "visionos" | "circle" => Ok(Self::VISIONOS),
            "macos" | "nomask" | "no-mask" => Ok(Self::MACOS),
            "ios" => Ok(Self::IOS),
            other => other.parse::<u32>().map(PlatformCode).map_err(|_| {
                CirclefyError::InvalidInput(format!(
                    "unknown platform '{}', expected visionos, macos, ios or a number",
                    s
                ))
            }),
        }
    }
}

/// Something that can rewrite an executable's platform marker in place.
pub trait ExecutablePatcher: Send + Sync {
    fn is_available(&self) -> bool;
    fn patch(&self, path: &Path, platform: PlatformCode) -> Result<()>;
}

/// Rewrites `LC_BUILD_VERSION` with goblin-located offsets.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachoPlatformPatcher;

impl ExecutablePatcher for MachoPlatformPatcher {
    fn is_available(&self) -> bool {
        true
    }

    fn patch(&self, path: &Path, platform: PlatformCode) -> Result<()> {
        let count = macho::set_platform(path, platform.0)?;
        tracing::info!(
            path = %path.display(),
            %platform,
            commands = count,
            "patched executable platform"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    /// The executor did not answer within the configured bound.
    Timeout(Duration),
    /// The executor thread is gone.
    Closed,
    /// The patch routine returned an error or panicked.
    Failed(String),
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Timeout(d) => write!(f, "no reply after {}s", d.as_secs()),
            HandoffError::Closed => f.write_str("patch executor is not running"),
            HandoffError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for HandoffError {}

enum Request {
    Probe(SyncSender<bool>),
    Patch {
        path: PathBuf,
        platform: PlatformCode,
        reply: SyncSender<std::result::Result<(), String>>,
    },
    Shutdown,
}

/// Dedicated thread that serializes every call into the patcher.
///
/// Callers block on the reply for at most `timeout`. A request that times out
/// keeps running on the worker; later requests queue behind it.
pub struct PatchExecutor {
    sender: mpsc::Sender<Request>,
    timeout: Duration,
    _handle: thread::JoinHandle<()>,
}

impl PatchExecutor {
    pub fn spawn(patcher: Arc<dyn ExecutablePatcher>, timeout: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("patch-executor".to_string())
            .spawn(move || run_worker(patcher, receiver))?;

        Ok(Self {
            sender,
            timeout,
            _handle: handle,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_available(&self) -> std::result::Result<bool, HandoffError> {
        self.call(Request::Probe)
    }

    pub fn patch(
        &self,
        path: PathBuf,
        platform: PlatformCode,
    ) -> std::result::Result<(), HandoffError> {
        self.call(|reply| Request::Patch {
            path,
            platform,
            reply,
        })?
        .map_err(HandoffError::Failed)
    }

    fn call<T>(
        &self,
        make: impl FnOnce(SyncSender<T>) -> Request,
    ) -> std::result::Result<T, HandoffError> {
        let (reply, response) = mpsc::sync_channel(1);
        self.sender
            .send(make(reply))
            .map_err(|_| HandoffError::Closed)?;

        match response.recv_timeout(self.timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout = ?self.timeout, "patch executor did not reply in time");
                Err(HandoffError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(HandoffError::Closed),
        }
    }
}

impl Drop for PatchExecutor {
    fn drop(&mut self) {
        let _ = self.sender.send(Request::Shutdown);
    }
}

fn run_worker(patcher: Arc<dyn ExecutablePatcher>, receiver: mpsc::Receiver<Request>) {
    while let Ok(request) = receiver.recv() {
        match request {
            Request::Probe(reply) => {
                let available = panic::catch_unwind(AssertUnwindSafe(|| patcher.is_available()))
                    .unwrap_or_else(|payload| {
                        tracing::error!("availability probe panicked: {}", panic_message(&payload));
                        false
                    });
                let _ = reply.send(available);
            }
            Request::Patch {
                path,
                platform,
                reply,
            } => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| patcher.patch(&path, platform)));
                let result = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(payload) => {
                        let msg = format!("patch routine panicked: {}", panic_message(&payload));
                        tracing::error!("{}", msg);
                        Err(msg)
                    }
                };
                // The caller may have given up already.
                let _ = reply.send(result);
            }
            Request::Shutdown => break,
        }
    }
    tracing::debug!("patch executor stopped");
}

/// Payload text of a caught panic.
fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
