//! Best-effort file I/O with logging.
//!
//! All daemon writes are crash-safe (temp -> fsync -> rename) or append-only.
//! Failures are logged and reported to callers, who continue with a
//! degraded result; the daemon never dies on a failed append.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Write content atomically: temp file in the same directory, fsync, rename.
pub fn atomic_write(path: &Path, content: &[u8], mode: Option<u32>) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    fs::create_dir_all(parent)?;

    let temp_path = path.with_file_name(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            opts.mode(mode.unwrap_or(0o644));
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
        }

        let mut file = opts.open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Serialize a value and write it atomically as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T, mode: Option<u32>) -> io::Result<()> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    atomic_write(path, &content, mode)
}

/// Best-effort variant of [`write_json`]; logs and swallows the error.
pub fn write_json_best_effort<T: Serialize>(path: &Path, value: &T, mode: Option<u32>) {
    if let Err(e) = write_json(path, value, mode) {
        warn!(path = %path.display(), error = %e, "failed to write json file");
    }
}

/// Read and deserialize a JSON file. `None` when absent or malformed.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read json file");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed json file");
            None
        }
    }
}

/// Append one JSON line to a JSONL file (created 0o600 if absent).
pub fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut line = serde_json::to_string(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push('\n');

    let mut opts = OpenOptions::new();
    opts.append(true).create(true);
    #[cfg(unix)]
    {
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(line.as_bytes())
}

/// Best-effort variant of [`append_jsonl`]; logs and swallows the error.
pub fn append_jsonl_best_effort<T: Serialize>(path: &Path, value: &T) {
    if let Err(e) = append_jsonl(path, value) {
        warn!(path = %path.display(), error = %e, "failed to append jsonl record");
    }
}

/// Read a JSONL file leniently: malformed lines are skipped with a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read jsonl file");
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping malformed jsonl line"
                );
            }
        }
    }
    records
}

/// Create a directory owner-only (0o700). Existing directories are re-moded.
pub fn ensure_private_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        name: String,
    }

    #[test]
    fn atomic_write_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/state.json");

        atomic_write(&path, b"{\"ok\":true}", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"ok\":true}");

        atomic_write(&path, b"{\"ok\":false}", None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"ok\":false}");
    }

    #[cfg(unix)]
    #[test]
    fn write_json_applies_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret.json");
        write_json(&path, &Record { id: 1, name: "a".into() }, Some(0o600)).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn read_json_absent_and_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(read_json::<Record>(&path).is_none());

        fs::write(&path, "not json").unwrap();
        assert!(read_json::<Record>(&path).is_none());
    }

    #[test]
    fn jsonl_append_skips_malformed_on_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");

        append_jsonl(&path, &Record { id: 1, name: "first".into() }).unwrap();
        append_jsonl(&path, &Record { id: 2, name: "second".into() }).unwrap();

        // Corrupt the middle of the file by hand.
        let mut content = fs::read_to_string(&path).unwrap();
        content.push_str("{broken\n");
        fs::write(&path, content).unwrap();
        append_jsonl(&path, &Record { id: 3, name: "third".into() }).unwrap();

        let records: Vec<Record> = read_jsonl(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].id, 3);
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime");
        ensure_private_dir(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
