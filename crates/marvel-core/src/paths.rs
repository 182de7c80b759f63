//! Project and daemon filesystem locations.
//!
//! The daemon is bound to one project root, identified by a stable short
//! hash of the root path. Sockets and session files live in a per-user
//! directory under the system temp dir; everything durable lives under
//! `{project}/marvel/`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Portable lower bound for `sun_path` across target platforms.
pub const SUN_PATH_MAX: usize = 103;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("socket path {0} exceeds sun_path limit of {SUN_PATH_MAX} bytes")]
    SocketPathTooLong(String),
}

/// First 12 hex chars of SHA-256 of the project directory.
pub fn project_hash(project_root: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_root.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

fn current_uid() -> u32 {
    // Safety: getuid has no failure modes.
    unsafe { libc::getuid() }
}

/// All filesystem locations derived from one project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub project_root: PathBuf,
    pub hash: String,
    runtime_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let hash = project_hash(&project_root);
        let tmp = std::env::var("TMPDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let runtime_dir = tmp.join(format!("mhd-{}", current_uid()));
        Self {
            project_root,
            hash,
            runtime_dir,
        }
    }

    /// Per-user runtime directory, `$TMPDIR/mhd-{uid}` (mode 0o700).
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir
            .join(format!("p-project-{}.sock", self.hash))
    }

    pub fn pid_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("p-project-{}.pid", self.hash))
    }

    pub fn session_state_path(&self, session_id: &str) -> PathBuf {
        self.runtime_dir.join(format!("session-{session_id}.json"))
    }

    /// Per-session agent registry handoff written before compaction.
    pub fn compaction_handoff_path(&self, session_id: &str) -> PathBuf {
        self.runtime_dir
            .join(format!("agents-{}-{session_id}.json", self.hash))
    }

    pub fn marvel_dir(&self) -> PathBuf {
        self.project_root.join("marvel")
    }

    pub fn packs_dir(&self) -> PathBuf {
        self.marvel_dir().join("packs")
    }

    pub fn security_dir(&self) -> PathBuf {
        self.marvel_dir().join("security")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.marvel_dir().join("runs")
    }

    pub fn guidance_archive_path(&self) -> PathBuf {
        self.marvel_dir().join("guidance-archive.jsonl")
    }

    pub fn run_dir(&self, started_at: DateTime<Utc>) -> PathBuf {
        self.runs_dir()
            .join(format!("run_{}", started_at.format("%Y%m%d_%H%M%S")))
    }

    /// The socket path must fit `sun_path`; checked once at boot, fatal.
    pub fn check_socket_path(&self) -> Result<PathBuf, PathError> {
        let socket = self.socket_path();
        let bytes = socket.as_os_str().len();
        if bytes > SUN_PATH_MAX {
            return Err(PathError::SocketPathTooLong(
                socket.to_string_lossy().to_string(),
            ));
        }
        Ok(socket)
    }
}
