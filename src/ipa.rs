use crate::error::{CirclefyError, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::{DirEntry, WalkDir};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

pub const PAYLOAD_DIR: &str = "Payload";

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Zip codec for IPA archives.
///
/// Progress callbacks receive a percentage in `[0, 100]`: bytes written for
/// compression, entries processed for extraction. The callback always sees
/// `0.0` first and `100.0` last on success.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveCodec {
    compression_level: u32,
}

impl Default for ArchiveCodec {
    fn default() -> Self {
        Self::new(6)
    }
}

impl ArchiveCodec {
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: compression_level.min(9),
        }
    }

    /// Archives the contents of `source_dir` into `destination`, replacing any
    /// existing file. Returns `false` and logs the cause on failure.
    pub fn compress<F: FnMut(f32)>(&self, source_dir: &Path, destination: &Path, progress: F) -> bool {
        match self.try_compress(source_dir, destination, progress) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(source = %source_dir.display(), "compression failed: {}", e);
                false
            }
        }
    }

    pub fn try_compress<F: FnMut(f32)>(&self, source_dir: &Path, destination: &Path, progress: F) -> Result<()> {
        self.write_archive(source_dir, source_dir, destination, false, progress)
    }

    /// Archives `<root>/Payload` with entry names relative to `root`, so the
    /// result reads `Payload/<App>.app/...`. Hidden files are left out
    /// (installd rejects them).
    pub fn compress_payload<F: FnMut(f32)>(&self, root: &Path, destination: &Path, progress: F) -> bool {
        match self.try_compress_payload(root, destination, progress) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(root = %root.display(), "packaging failed: {}", e);
                false
            }
        }
    }

    pub fn try_compress_payload<F: FnMut(f32)>(&self, root: &Path, destination: &Path, progress: F) -> Result<()> {
        let payload = root.join(PAYLOAD_DIR);
        if !payload.is_dir() {
            return Err(CirclefyError::NotFound(format!(
                "no {} folder in {}",
                PAYLOAD_DIR,
                root.display()
            )));
        }
        self.write_archive(root, &payload, destination, true, progress)
    }

    /// Extracts `archive` into `destination` (created if absent). Returns
    /// `None` and logs the cause on failure.
    pub fn decompress<F: FnMut(f32)>(&self, archive: &Path, destination: &Path, progress: F) -> Option<PathBuf> {
        match self.try_decompress(archive, destination, progress) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(archive = %archive.display(), "extraction failed: {}", e);
                None
            }
        }
    }

    pub fn try_decompress<F: FnMut(f32)>(
        &self,
        archive: &Path,
        destination: &Path,
        mut progress: F,
    ) -> Result<PathBuf> {
        if !archive.is_file() {
            return Err(CirclefyError::FileNotFound(archive.to_path_buf()));
        }
        fs::create_dir_all(destination)?;

        let file = File::open(archive)?;
        let mut zip = zip::ZipArchive::new(BufReader::new(file))?;
        let total = zip.len();
        tracing::debug!(archive = %archive.display(), entries = total, "extracting");

        progress(0.0);
        for i in 0..total {
            let mut entry = zip.by_index(i)?;
            let relative = entry.enclosed_name().ok_or_else(|| {
                CirclefyError::InvalidArchive(format!("entry escapes destination: {}", entry.name()))
            })?;
            reject_symlinked_path(destination, &relative)?;
            let outpath = destination.join(relative);
            let mode = entry.unix_mode();

            if entry.is_dir() {
                fs::create_dir_all(&outpath)?;
            } else {
                if let Some(parent) = outpath.parent() {
                    fs::create_dir_all(parent)?;
                }

                if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
                    let mut target = String::new();
                    io::Read::read_to_string(&mut entry, &mut target)?;
                    write_symlink(&target, &outpath)?;
                } else {
                    let mut outfile = File::create(&outpath)?;
                    io::copy(&mut entry, &mut outfile)?;
                    drop(outfile);
                    restore_permissions(&outpath, mode)?;
                }
            }

            progress(percent(i as u64 + 1, total as u64));
        }
        progress(100.0);

        Ok(destination.to_path_buf())
    }

    fn write_archive<F: FnMut(f32)>(
        &self,
        base: &Path,
        start: &Path,
        destination: &Path,
        skip_hidden: bool,
        mut progress: F,
    ) -> Result<()> {
        if !start.is_dir() {
            return Err(CirclefyError::FileNotFound(start.to_path_buf()));
        }

        if destination.is_dir() {
            fs::remove_dir_all(destination)?;
        } else if destination.exists() || destination.is_symlink() {
            fs::remove_file(destination)?;
        }

        let entries: Vec<DirEntry> = WalkDir::new(start)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !skip_hidden || e.depth() == 0 || !is_hidden(e))
            .collect::<std::result::Result<_, _>>()?;

        let total_bytes: u64 = entries
            .iter()
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();

        let result = self.write_entries(base, &entries, destination, total_bytes, &mut progress);
        if result.is_err() {
            // Never leave a half-written archive behind.
            let _ = fs::remove_file(destination);
        }
        result
    }

    fn write_entries<F: FnMut(f32)>(
        &self,
        base: &Path,
        entries: &[DirEntry],
        destination: &Path,
        total_bytes: u64,
        progress: &mut F,
    ) -> Result<()> {
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = File::create(destination)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = self.file_options();

        let mut written = 0u64;
        progress(0.0);

        for entry in entries {
            let path = entry.path();
            let relative = path.strip_prefix(base).map_err(|_| {
                CirclefyError::InvalidInput(format!("{} is outside {}", path.display(), base.display()))
            })?;
            if entry.depth() == 0 || relative.as_os_str().is_empty() {
                continue;
            }
            let name = relative.to_string_lossy().replace('\\', "/");
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                let target = fs::read_link(path)?;
                let target = target.to_string_lossy();
                zip.add_symlink(name.as_str(), &*target, options)?;
            } else if file_type.is_dir() {
                zip.add_directory(format!("{}/", name), with_permissions(options, entry))?;
            } else {
                zip.start_file(name.as_str(), with_permissions(options, entry))?;
                let mut f = File::open(path)?;
                written += io::copy(&mut f, &mut zip)?;
                progress(percent(written, total_bytes));
            }
        }

        zip.finish()?;
        progress(100.0);
        tracing::debug!(destination = %destination.display(), bytes = written, "archive written");

        Ok(())
    }

    fn file_options(&self) -> SimpleFileOptions {
        match self.compression_level {
            0 => SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
            level => SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(level as i64)),
        }
    }
}

/// Wraps a bare `.app` directory into an IPA at `destination`.
pub fn package_app(codec: &ArchiveCodec, app_path: &Path, destination: &Path, work_dir: &Path) -> Result<()> {
    if !app_path.join("Info.plist").is_file() {
        return Err(CirclefyError::NotFound(format!(
            "no Info.plist in {}",
            app_path.display()
        )));
    }
    let app_name = app_path
        .file_name()
        .ok_or_else(|| CirclefyError::InvalidInput("Invalid app path".to_string()))?;

    fs::create_dir_all(work_dir)?;
    let staging = TempDir::with_prefix_in("package-", work_dir)?;
    let payload = staging.path().join(PAYLOAD_DIR);
    fs::create_dir_all(&payload)?;
    copy_dir_all(app_path, &payload.join(app_name))?;

    codec.try_compress_payload(staging.path(), destination, |_| {})
}

/// Hex SHA-256 of a file, streamed.
pub fn archive_digest<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut file = BufReader::new(File::open(path.as_ref())?);
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            copy_dir_all(&src_path, &dst_path)?;
        } else if ty.is_symlink() {
            let target = fs::read_link(&src_path)?;
            write_symlink(&target.to_string_lossy(), &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}

/// Fails if any existing component of `destination/relative` is a symlink,
/// so an earlier link entry cannot redirect a later write.
fn reject_symlinked_path(destination: &Path, relative: &Path) -> Result<()> {
    let mut current = destination.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(CirclefyError::InvalidArchive(format!(
                    "entry passes through symlink: {}",
                    relative.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn percent(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 100.0;
    }
    ((done as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as f32
}

#[cfg(unix)]
fn with_permissions(options: SimpleFileOptions, entry: &DirEntry) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    match entry.metadata() {
        Ok(meta) => options.unix_permissions(meta.permissions().mode() & 0o7777),
        Err(_) => options,
    }
}

#[cfg(not(unix))]
fn with_permissions(options: SimpleFileOptions, _entry: &DirEntry) -> SimpleFileOptions {
    options
}

#[cfg(unix)]
fn restore_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode.map(|m| m & 0o7777).filter(|m| *m != 0) {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_permissions(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn write_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(windows)]
fn write_symlink(target: &str, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, content) in files {
            let full = root.join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn compress_overwrites_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_tree(&src, &[("a.txt", b"fresh")]);

        let out = dir.path().join("out.zip");
        fs::write(&out, b"stale bytes, not a zip").unwrap();

        assert!(ArchiveCodec::default().compress(&src, &out, |_| {}));
        let zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(zip.file_names().collect::<Vec<_>>(), vec!["a.txt"]);
    }

    #[test]
    fn progress_starts_at_zero_and_ends_at_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_tree(&src, &[("one", &[1u8; 4096]), ("two/three", &[2u8; 1024])]);

        let mut seen = Vec::new();
        let out = dir.path().join("out.zip");
        assert!(ArchiveCodec::default().compress(&src, &out, |p| seen.push(p)));

        assert_eq!(seen.first(), Some(&0.0));
        assert_eq!(seen.last(), Some(&100.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn payload_packaging_skips_hidden_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        write_tree(
            &root,
            &[
                ("Payload/Demo.app/Demo", b"bin"),
                ("Payload/Demo.app/.DS_Store", b"junk"),
                ("iTunesMetadata.plist", b"meta"),
            ],
        );

        let out = dir.path().join("out.ipa");
        assert!(ArchiveCodec::default().compress_payload(&root, &out, |_| {}));

        let zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut names: Vec<_> = zip.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["Payload/Demo.app/", "Payload/Demo.app/Demo"]);
    }

    #[test]
    fn payload_packaging_requires_payload_folder() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.ipa");
        assert!(!ArchiveCodec::default().compress_payload(dir.path(), &out, |_| {}));
        assert!(!out.exists());
    }

    #[test]
    fn decompress_missing_or_malformed_archive_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let codec = ArchiveCodec::default();

        assert!(codec
            .decompress(&dir.path().join("nope.ipa"), &dir.path().join("x"), |_| {})
            .is_none());

        let bogus = dir.path().join("bogus.ipa");
        fs::write(&bogus, b"definitely not a zip archive").unwrap();
        assert!(codec.decompress(&bogus, &dir.path().join("y"), |_| {}).is_none());
    }

    #[test]
    fn decompress_rejects_entries_outside_destination() {
        let dir = tempfile::tempdir().unwrap();
        let evil = dir.path().join("evil.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&evil).unwrap());
            zip.start_file("../escaped.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"gotcha").unwrap();
            zip.finish().unwrap();
        }

        let dest = dir.path().join("dest");
        let err = ArchiveCodec::default()
            .try_decompress(&evil, &dest, |_| {})
            .unwrap_err();
        assert!(matches!(err, CirclefyError::InvalidArchive(_)));
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn decompress_refuses_to_write_through_symlink_entries() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        let evil = dir.path().join("evil.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&evil).unwrap());
            zip.add_symlink("Payload/link", outside.to_string_lossy(), SimpleFileOptions::default())
                .unwrap();
            zip.start_file("Payload/link/escaped.txt", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"gotcha").unwrap();
            zip.finish().unwrap();
        }

        let err = ArchiveCodec::default()
            .try_decompress(&evil, &dir.path().join("dest"), |_| {})
            .unwrap_err();
        assert!(matches!(err, CirclefyError::InvalidArchive(_)));
        assert!(!outside.join("escaped.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn relative_symlinks_inside_the_tree_still_extract() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fw.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
            zip.start_file("Kit.framework/Versions/A/Kit", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"kit").unwrap();
            zip.add_symlink("Kit.framework/Kit", "Versions/A/Kit", SimpleFileOptions::default())
                .unwrap();
            zip.finish().unwrap();
        }

        let dest = dir.path().join("dest");
        ArchiveCodec::default()
            .try_decompress(&archive, &dest, |_| {})
            .unwrap();
        assert_eq!(fs::read(dest.join("Kit.framework/Kit")).unwrap(), b"kit");
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_survives_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        write_tree(&src, &[("tool", b"#!/bin/sh\n")]);
        fs::set_permissions(src.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();

        let out = dir.path().join("out.zip");
        let codec = ArchiveCodec::default();
        assert!(codec.compress(&src, &out, |_| {}));
        let dest = codec.decompress(&out, &dir.path().join("dest"), |_| {}).unwrap();

        let mode = fs::metadata(dest.join("tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn package_app_wraps_bundle_in_payload() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Demo.app");
        write_tree(&app, &[("Info.plist", b"<plist/>"), ("Demo", b"bin")]);

        let out = dir.path().join("Demo.ipa");
        let work = dir.path().join("work");
        package_app(&ArchiveCodec::default(), &app, &out, &work).unwrap();

        let zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert!(zip.file_names().any(|n| n == "Payload/Demo.app/Demo"));
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn digest_is_stable_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            archive_digest(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
