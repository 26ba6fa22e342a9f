// src/daemon/pidfile.rs

//! PID-file maintenance. The file is written on startup and removed when
//! the daemon exits; a stale file left by a crashed daemon is overwritten
//! with a notice.

use crate::core::errors::Result;
use std::path::PathBuf;
use tracing::{info, warn};

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process id to `path`. Returns `None` when no
    /// path is configured.
    pub fn create(path: &str) -> Result<Option<PidFile>> {
        if path.is_empty() {
            return Ok(None);
        }
        let path = PathBuf::from(path);
        if path.exists() {
            warn!("overwriting existing PID file {:?}", path);
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        info!("PID file {:?} written", path);
        Ok(Some(PidFile { path }))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("unable to remove PID file {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_lifecycle() {
        let dir = std::env::temp_dir().join(format!("replguard-pid-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("replguard.pid");
        let path_str = path.to_str().unwrap().to_string();

        let pidfile = PidFile::create(&path_str).unwrap().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        drop(pidfile);
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn empty_path_is_skipped() {
        assert!(PidFile::create("").unwrap().is_none());
    }
}
