use log::debug;
use std::path::{Path, PathBuf};

use crate::utils::error::{AppError, AppResult};

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> AppResult<PathBuf> {
    if path == "~" || path.starts_with("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| AppError::ConfigError("cannot resolve home directory".to_string()))?;
        let rest = path.trim_start_matches('~').trim_start_matches('/');
        return Ok(if rest.is_empty() { home } else { home.join(rest) });
    }
    Ok(PathBuf::from(path))
}

/// Expand `~` and make the path absolute against the current directory
pub fn absolute(path: &str) -> AppResult<PathBuf> {
    let expanded = expand_home(path)?;
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

/// Best-effort removal of a file, ignoring "not found"
pub fn remove_file_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("failed to remove {}: {}", path.display(), e);
        }
    }
}

/// A file that is deleted when dropped, unless retention is requested
#[derive(Debug)]
pub struct Scratch {
    path: PathBuf,
    keep: bool,
}

impl Scratch {
    pub fn new(path: PathBuf, keep: bool) -> Self {
        Self { path, keep }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop tracking the file and hand its path back
    pub fn persist(mut self) -> PathBuf {
        self.keep = true;
        self.path.clone()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.keep {
            remove_file_quietly(&self.path);
        }
    }
}

/// `dir/stem.step.ext`, the naming used for intermediate files
pub fn sibling_with_step(dir: &Path, stem: &str, step: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}{}", stem, step, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept");
        let gone = dir.path().join("gone");
        std::fs::write(&kept, b"x").unwrap();
        std::fs::write(&gone, b"x").unwrap();

        drop(Scratch::new(gone.clone(), false));
        let path = Scratch::new(kept.clone(), false).persist();

        assert!(!gone.exists());
        assert!(path.exists());
        drop(Scratch::new(dir.path().join("never-existed"), false));
    }

    #[test]
    fn home_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/pcaps").unwrap(), home.join("pcaps"));
            assert_eq!(expand_home("~").unwrap(), home);
        }
        assert_eq!(expand_home("/data/x").unwrap(), PathBuf::from("/data/x"));
        assert_eq!(
            sibling_with_step(Path::new("/w"), "a_000001", "shuffle", ".pcap"),
            PathBuf::from("/w/a_000001.shuffle.pcap")
        );
    }
}
