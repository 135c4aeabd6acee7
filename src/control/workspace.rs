use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::utils::error::AppResult;

/// Wait before removing the tree after a cancelled run
pub const CLEANUP_GRACE: Duration = Duration::from_secs(3);

/// The per-run working directory, exclusive to this process
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    keep: bool,
    cleaned: AtomicBool,
}

impl Workspace {
    pub fn create(path: PathBuf, keep: bool) -> AppResult<Self> {
        std::fs::create_dir_all(&path)?;
        info!("working directory is {}", path.display());
        Ok(Self {
            path,
            keep,
            cleaned: AtomicBool::new(false),
        })
    }

    /// Remove the tree, or point at it when data is kept. Runs once.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.keep {
            warn!(
                "keeping data in {}, remove it manually when done",
                self.path.display()
            );
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => info!("removed {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove {}: {}", self.path.display(), e),
        }
    }

    /// Clean up after the scheduler drained; a cancelled run gets a short
    /// grace period first so killed tools let go of their files.
    pub async fn cleanup_after_drain(&self, cancelled: bool) {
        if cancelled && !self.keep {
            info!("waiting {:?} before cleanup", CLEANUP_GRACE);
            tokio::time::sleep(CLEANUP_GRACE).await;
        }
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run");
        let ws = Workspace::create(path.clone(), false).unwrap();
        std::fs::write(path.join("a.pcap"), b"x").unwrap();
        ws.cleanup();
        assert!(!path.exists());
        std::fs::create_dir(&path).unwrap();
        ws.cleanup();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn keep_data_leaves_the_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run");
        let ws = Workspace::create(path.clone(), true).unwrap();
        ws.cleanup_after_drain(true).await;
        assert!(path.is_dir());
    }
}
