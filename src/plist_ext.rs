use crate::error::{CirclefyError, Result};
use plist::Value;
use std::path::{Path, PathBuf};

pub const KEY_EXECUTABLE: &str = "CFBundleExecutable";
pub const KEY_DISPLAY_NAME: &str = "CFBundleDisplayName";
pub const KEY_NAME: &str = "CFBundleName";
pub const KEY_IDENTIFIER: &str = "CFBundleIdentifier";
pub const KEY_VERSION: &str = "CFBundleVersion";

/// A parsed `Info.plist` (binary or XML).
#[derive(Debug, Clone)]
pub struct PlistFile {
    pub path: Option<PathBuf>,
    pub data: plist::Dictionary,
}

impl PlistFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(CirclefyError::NotFound(format!(
                "no Info.plist at {}",
                path.display()
            )));
        }
        let data = plist::from_file::<_, plist::Dictionary>(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data = plist::from_bytes::<plist::Dictionary>(bytes)?;
        Ok(Self { path: None, data })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_string())
    }

    /// Like [`get_string`](Self::get_string) but treats `""` as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get_string(key).filter(|s| !s.is_empty())
    }

    pub fn executable_name(&self) -> Option<&str> {
        self.get_non_empty(KEY_EXECUTABLE)
    }

    /// `CFBundleDisplayName`, then `CFBundleName`.
    pub fn display_name(&self) -> Option<&str> {
        self.get_non_empty(KEY_DISPLAY_NAME)
            .or_else(|| self.get_non_empty(KEY_NAME))
    }

    pub fn bundle_id(&self) -> &str {
        self.get_string(KEY_IDENTIFIER).unwrap_or_default()
    }

    pub fn version(&self) -> &str {
        self.get_string(KEY_VERSION).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, &str)]) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        for (k, v) in pairs {
            d.insert(k.to_string(), Value::String(v.to_string()));
        }
        d
    }

    #[test]
    fn reads_binary_plists() {
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &dict(&[(KEY_EXECUTABLE, "Demo")])).unwrap();

        let pl = PlistFile::from_bytes(&buf).unwrap();
        assert_eq!(pl.executable_name(), Some("Demo"));
    }

    #[test]
    fn display_name_skips_empty_values() {
        let mut buf = Vec::new();
        plist::to_writer_xml(
            &mut buf,
            &dict(&[(KEY_DISPLAY_NAME, ""), (KEY_NAME, "Bundle Name")]),
        )
        .unwrap();

        let pl = PlistFile::from_bytes(&buf).unwrap();
        assert_eq!(pl.display_name(), Some("Bundle Name"));
        assert_eq!(pl.bundle_id(), "");
        assert_eq!(pl.version(), "");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(PlistFile::from_bytes(b"not a plist at all").is_err());
    }
}
