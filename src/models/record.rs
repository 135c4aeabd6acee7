use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Recognized capture file suffixes
pub const CAPTURE_SUFFIXES: [&str; 3] = [".pcap", ".pcapng", ".cap"];

/// One capture file on disk and the names derived from its path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureRecord {
    /// Absolute path of the file
    pub path: PathBuf,

    /// File name with extension, e.g. `sample.pcap`
    pub base_name: String,

    /// Extension including the dot, e.g. `.pcap`
    pub ext: String,

    /// File name without extension
    pub name: String,

    /// Path relative to the owning finder's root (or its working copy)
    pub relative_path: PathBuf,

    /// Parent of `relative_path`, `.` for files at the root
    pub relative_dir: PathBuf,
}

impl CaptureRecord {
    /// Derive a record for `path`, which must live under `root` or `working_root`.
    pub fn parse(path: &Path, root: &Path, working_root: &Path) -> AppResult<Self> {
        let base_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AppError::DiscoveryError(format!("{} has no file name", path.display()))
            })?;
        let ext = match base_name.rfind('.') {
            Some(idx) => base_name[idx..].to_string(),
            None => String::new(),
        };
        let name = base_name[..base_name.len() - ext.len()].to_string();

        let relative_path = path
            .strip_prefix(root)
            .or_else(|_| path.strip_prefix(working_root))
            .map(Path::to_path_buf)
            .map_err(|_| {
                AppError::DiscoveryError(format!(
                    "{} is outside of {} and {}",
                    path.display(),
                    root.display(),
                    working_root.display()
                ))
            })?;
        let relative_dir = match relative_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            path: path.to_path_buf(),
            base_name,
            ext,
            name,
            relative_path,
            relative_dir,
        })
    }

    /// Why this file cannot be a capture, if it cannot
    pub fn suffix_problem(&self) -> Option<String> {
        if self.base_name.starts_with('.') {
            return Some("hidden file".to_string());
        }
        if self.ext.is_empty() {
            return Some("no suffix".to_string());
        }
        if !CAPTURE_SUFFIXES.contains(&self.ext.as_str()) {
            return Some(format!("invalid suffix {}", self.ext));
        }
        None
    }

    /// Relative path with `/` separators, as matched by name patterns
    pub fn relative_str(&self) -> String {
        self.relative_path.to_string_lossy().into_owned()
    }

    pub fn is_pcapng(&self) -> bool {
        self.ext == ".pcapng"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_names() {
        let rec = CaptureRecord::parse(
            Path::new("/data/pcaps/http/get.v1.pcapng"),
            Path::new("/data/pcaps"),
            Path::new("/tmp/wd/finder-default"),
        )
        .unwrap();
        assert_eq!(rec.base_name, "get.v1.pcapng");
        assert_eq!(rec.ext, ".pcapng");
        assert_eq!(rec.name, "get.v1");
        assert_eq!(rec.relative_path, PathBuf::from("http/get.v1.pcapng"));
        assert_eq!(rec.relative_dir, PathBuf::from("http"));
        assert!(rec.suffix_problem().is_none());
        assert!(rec.is_pcapng());
    }

    #[test]
    fn root_level_and_working_copy() {
        let rec = CaptureRecord::parse(
            Path::new("/tmp/wd/finder-default/sample.pcap"),
            Path::new("/data/pcaps"),
            Path::new("/tmp/wd/finder-default"),
        )
        .unwrap();
        assert_eq!(rec.relative_path, PathBuf::from("sample.pcap"));
        assert_eq!(rec.relative_dir, PathBuf::from("."));

        assert!(CaptureRecord::parse(
            Path::new("/elsewhere/a.pcap"),
            Path::new("/data/pcaps"),
            Path::new("/tmp/wd"),
        )
        .is_err());
    }

    #[test]
    fn rejects_bad_suffixes() {
        let root = Path::new("/r");
        let problem = |p: &str| {
            CaptureRecord::parse(Path::new(p), root, root)
                .unwrap()
                .suffix_problem()
        };
        assert_eq!(problem("/r/.hidden.pcap").as_deref(), Some("hidden file"));
        assert_eq!(problem("/r/README").as_deref(), Some("no suffix"));
        assert_eq!(problem("/r/notes.txt").as_deref(), Some("invalid suffix .txt"));
        assert!(problem("/r/x.cap").is_none());
    }
}
