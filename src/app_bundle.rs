use crate::error::{CirclefyError, Result};
use crate::ipa::PAYLOAD_DIR;
use crate::plist_ext::PlistFile;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

const APP_SUFFIX: &str = ".app";
const INFO_PLIST: &str = "Info.plist";

/// The `*.app` directory inside an extracted IPA's `Payload` folder.
#[derive(Debug, Clone)]
pub struct AppBundle {
    pub path: PathBuf,
    pub plist: PlistFile,
    pub executable_name: String,
}

impl AppBundle {
    /// Finds the single bundle under `<extracted_root>/Payload` and resolves
    /// its main executable.
    ///
    /// Fails with [`CirclefyError::NotFound`] when there is no bundle, no
    /// readable `Info.plist`, no `CFBundleExecutable`, or no file behind it,
    /// and with [`CirclefyError::AmbiguousBundle`] when several bundles exist.
    pub fn locate<P: AsRef<Path>>(extracted_root: P) -> Result<Self> {
        let payload = extracted_root.as_ref().join(PAYLOAD_DIR);
        let path = find_app_in_payload(&payload)?;
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let plist = PlistFile::open(path.join(INFO_PLIST)).map_err(|e| match e {
            CirclefyError::NotFound(msg) => CirclefyError::NotFound(msg),
            other => CirclefyError::NotFound(format!("unreadable Info.plist: {}", other)),
        })?;

        let executable_name = plist
            .executable_name()
            .ok_or_else(|| CirclefyError::NotFound("no CFBundleExecutable in Info.plist".to_string()))?
            .to_string();
        if !is_plain_file_name(&executable_name) {
            return Err(CirclefyError::NotFound(format!(
                "CFBundleExecutable is not a plain file name: {}",
                executable_name
            )));
        }

        let bundle = Self {
            path,
            plist,
            executable_name,
        };

        // Symlinks are refused so the patch never lands outside the bundle.
        let exec_path = bundle.executable_path();
        match fs::symlink_metadata(&exec_path) {
            Ok(meta) if meta.file_type().is_file() => {}
            Ok(_) => {
                return Err(CirclefyError::NotFound(format!(
                    "executable {} is not a regular file",
                    exec_path.display()
                )));
            }
            Err(_) => {
                return Err(CirclefyError::NotFound(format!(
                    "executable {} is missing",
                    exec_path.display()
                )));
            }
        }

        tracing::debug!(bundle = %bundle.path.display(), executable = %bundle.executable_name, "located app bundle");
        Ok(bundle)
    }

    pub fn executable_path(&self) -> PathBuf {
        self.path.join(&self.executable_name)
    }

    /// Bundle folder name without the `.app` suffix.
    pub fn folder_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn display_name(&self) -> String {
        self.plist
            .display_name()
            .map(str::to_string)
            .unwrap_or_else(|| self.folder_stem())
    }
}

fn find_app_in_payload(payload: &Path) -> Result<PathBuf> {
    if !payload.is_dir() {
        return Err(CirclefyError::NotFound(format!(
            "no {} folder found",
            PAYLOAD_DIR
        )));
    }

    let mut apps = Vec::new();
    for entry in fs::read_dir(payload)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type()?.is_dir() && name.ends_with(APP_SUFFIX) {
            apps.push(name);
        }
    }
    apps.sort();

    match apps.len() {
        0 => Err(CirclefyError::NotFound("no .app folder found".to_string())),
        1 => Ok(payload.join(&apps[0])),
        _ => Err(CirclefyError::AmbiguousBundle(apps)),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Identification read straight from an archive, without extracting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpaSummary {
    pub display_name: String,
    pub bundle_id: String,
    pub version: String,
    pub executable: Option<String>,
    /// Archive path of the `Info.plist` that was read.
    pub plist_entry: String,
}

pub fn inspect_archive<P: AsRef<Path>>(ipa_path: P) -> Result<IpaSummary> {
    let ipa_path = ipa_path.as_ref();
    let file = File::open(ipa_path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

    let candidates: Vec<String> = archive
        .file_names()
        .filter(|name| is_main_info_plist(name))
        .map(str::to_string)
        .collect();

    let entry_name = candidates.first().cloned().ok_or_else(|| {
        CirclefyError::NotFound("main app Info.plist not found in IPA".to_string())
    })?;
    if candidates.len() > 1 {
        tracing::warn!(
            count = candidates.len(),
            chosen = %entry_name,
            "archive holds several app bundles, using the first"
        );
    }

    let mut data = Vec::new();
    archive.by_name(&entry_name)?.read_to_end(&mut data)?;
    let plist = PlistFile::from_bytes(&data)?;

    let display_name = plist
        .display_name()
        .map(str::to_string)
        .or_else(|| app_stem_from_entry(&entry_name))
        .or_else(|| {
            ipa_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "Unknown App".to_string());

    Ok(IpaSummary {
        display_name,
        bundle_id: plist.bundle_id().to_string(),
        version: plist.version().to_string(),
        executable: plist.executable_name().map(str::to_string),
        plist_entry: entry_name,
    })
}

/// Matches exactly `Payload/<name>.app/Info.plist`.
fn is_main_info_plist(name: &str) -> bool {
    let parts: Vec<&str> = name.split('/').collect();
    parts.len() == 3
        && parts[0] == PAYLOAD_DIR
        && parts[1].ends_with(APP_SUFFIX)
        && !parts[1].contains("Frameworks")
        && parts[2] == INFO_PLIST
}

fn app_stem_from_entry(entry_name: &str) -> Option<String> {
    entry_name
        .split('/')
        .nth(1)
        .and_then(|folder| folder.strip_suffix(APP_SUFFIX))
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}
