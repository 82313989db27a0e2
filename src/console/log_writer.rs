//! Per-server append-only console logs.
//!
//! Layout on disk:
//!
//! ```text
//! {base}/{server}/2026-08-01_14-03-55.log
//! {base}/{server}/current.log  ->  2026-08-01_14-03-55.log
//! ```
//!
//! Every received chunk runs through the [`CleanState`] pipeline first;
//! whatever survives is appended to the server's current file. Cleaning or
//! I/O failures are logged at warn level and never propagate to the
//! producer — losing a log line must not stall console capture.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::console::clean::CleanState;
use crate::constants::ROTATION_COOLDOWN;

/// Per-server writer state, all mutated under the writer's single mutex.
struct LogState {
    file: Option<File>,
    current_path: Option<PathBuf>,
    last_rotation: Option<Instant>,
    clean: CleanState,
}

impl LogState {
    fn new() -> Self {
        Self {
            file: None,
            current_path: None,
            last_rotation: None,
            clean: CleanState::new(),
        }
    }
}

/// Append-only log store for every server's console stream.
pub struct LogWriter {
    base_dir: PathBuf,
    retention_days: u32,
    states: Mutex<HashMap<String, LogState>>,
}

impl LogWriter {
    pub fn new(base_dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn server_dir(&self, server: &str) -> PathBuf {
        self.base_dir.join(server)
    }

    /// Clean `chunk`, append the result to the server's current file and
    /// return the cleaned bytes (the analytics feed). Failures are
    /// swallowed after a warn — capture liveness over log durability.
    pub fn write(&self, server: &str, chunk: &[u8]) -> Vec<u8> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(server.to_string())
            .or_insert_with(LogState::new);

        let cleaned = state.clean.process(chunk);
        if cleaned.is_empty() {
            return cleaned;
        }
        if let Err(e) = append(&self.server_dir(server), state, &cleaned) {
            warn!("[{server}] log append failed: {e:#}");
        }
        cleaned
    }

    /// True once the rotation cooldown for `server` has passed.
    pub fn can_rotate(&self, server: &str) -> bool {
        let states = self.states.lock().unwrap();
        match states.get(server).and_then(|s| s.last_rotation) {
            Some(at) => at.elapsed() >= ROTATION_COOLDOWN,
            None => true,
        }
    }

    /// Close the current file and start a new one (named `explicit` or a
    /// local timestamp), repointing the `current.log` symlink. Subject to
    /// the 120 s cooldown.
    pub fn rotate(&self, server: &str, explicit: Option<&str>) -> Result<PathBuf> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry(server.to_string())
            .or_insert_with(LogState::new);

        if let Some(at) = state.last_rotation {
            if at.elapsed() < ROTATION_COOLDOWN {
                anyhow::bail!(
                    "rotation for {server} still cooling down ({}s left)",
                    (ROTATION_COOLDOWN - at.elapsed()).as_secs()
                );
            }
        }

        state.file = None;
        state.clean.reset();
        state.last_rotation = Some(Instant::now());

        let dir = self.server_dir(server);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        let name = match explicit {
            Some(name) => name.to_string(),
            None => default_log_name(),
        };
        let path = open_new_file(&dir, &name, state)?;
        info!("[{server}] rotated log to {}", path.display());
        Ok(path)
    }

    /// Log files for `server`, newest first by mtime. The `current.log`
    /// symlink itself is excluded.
    pub fn list(&self, server: &str) -> Vec<PathBuf> {
        let dir = self.server_dir(server);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<(PathBuf, SystemTime)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "current.log")
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                let mtime = meta.modified().ok()?;
                Some((e.path(), mtime))
            })
            .collect();
        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.into_iter().map(|(p, _)| p).collect()
    }

    /// Remove log files whose mtime is older than the retention window.
    /// No-op when retention is disabled (0 days).
    pub fn sweep_expired(&self) {
        if self.retention_days == 0 {
            return;
        }
        let cutoff = SystemTime::now()
            - Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60);
        let Ok(servers) = fs::read_dir(&self.base_dir) else {
            return;
        };
        let mut removed = 0usize;
        for server in servers.filter_map(|e| e.ok()) {
            let Ok(entries) = fs::read_dir(server.path()) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                let Ok(mtime) = meta.modified() else { continue };
                if mtime < cutoff && fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                    debug!("retention removed {}", entry.path().display());
                }
            }
        }
        if removed > 0 {
            info!("retention sweep removed {removed} expired log file(s)");
        }
    }
}

fn default_log_name() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S.log").to_string()
}

/// Append to the server's current file, opening or creating it first.
fn append(dir: &Path, state: &mut LogState, bytes: &[u8]) -> Result<()> {
    if state.file.is_none() {
        open_current(dir, state)?;
    }
    let file = state.file.as_mut().expect("opened above");
    file.write_all(bytes).context("appending to log")?;
    Ok(())
}

/// Open whatever `current.log` points at, or start a fresh file when the
/// symlink is absent or dangling.
fn open_current(dir: &Path, state: &mut LogState) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let link = dir.join("current.log");
    if let Ok(target) = fs::read_link(&link) {
        let path = if target.is_absolute() { target } else { dir.join(target) };
        if path.is_file() {
            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            state.file = Some(file);
            state.current_path = Some(path);
            return Ok(());
        }
    }
    open_new_file(dir, &default_log_name(), state)?;
    Ok(())
}

/// Create `{dir}/{name}` for appending and atomically repoint the
/// `current.log` symlink at it (symlink to a temp name, then rename over).
fn open_new_file(dir: &Path, name: &str, state: &mut LogState) -> Result<PathBuf> {
    let path = dir.join(name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("creating {}", path.display()))?;

    let link = dir.join("current.log");
    let staging = dir.join(".current.log.tmp");
    let _ = fs::remove_file(&staging);
    #[cfg(unix)]
    std::os::unix::fs::symlink(name, &staging).context("staging current.log symlink")?;
    #[cfg(not(unix))]
    fs::write(&staging, name.as_bytes()).context("staging current.log pointer")?;
    fs::rename(&staging, &link).context("publishing current.log symlink")?;

    state.file = Some(file);
    state.current_path = Some(path.clone());
    Ok(path)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_current(dir: &Path, server: &str) -> String {
        fs::read_to_string(dir.join(server).join("current.log")).unwrap()
    }

    #[test]
    fn test_write_creates_file_and_symlink() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"Hello\r\n");

        let link = tmp.path().join("srvA/current.log");
        let target = fs::read_link(&link).unwrap();
        assert!(target.to_string_lossy().ends_with(".log"));
        assert_eq!(read_current(tmp.path(), "srvA"), "Hello\n");
    }

    #[test]
    fn test_pure_ansi_chunk_creates_no_file() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"\x1b[2J\x1b[0m");
        assert!(!tmp.path().join("srvA").exists());
    }

    #[test]
    fn test_appends_accumulate() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"one\n");
        writer.write("srvA", b"two\n");
        assert_eq!(read_current(tmp.path(), "srvA"), "one\ntwo\n");
    }

    #[test]
    fn test_servers_are_isolated() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"from A\n");
        writer.write("srvB", b"from B\n");
        assert_eq!(read_current(tmp.path(), "srvA"), "from A\n");
        assert_eq!(read_current(tmp.path(), "srvB"), "from B\n");
    }

    #[test]
    fn test_rotate_starts_new_file_and_repoints_symlink() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"before rotation\n");
        let new_path = writer.rotate("srvA", Some("after.log")).unwrap();
        writer.write("srvA", b"after rotation\n");

        assert_eq!(read_current(tmp.path(), "srvA"), "after rotation\n");
        assert_eq!(new_path.file_name().unwrap(), "after.log");
        // The pre-rotation file still holds its bytes.
        let files = writer.list("srvA");
        assert_eq!(files.len(), 2);
        let old = files.iter().find(|p| p.file_name().unwrap() != "after.log").unwrap();
        assert_eq!(fs::read_to_string(old).unwrap(), "before rotation\n");
    }

    #[test]
    fn test_rotation_cooldown_leaves_files_unchanged() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"x\n");
        writer.rotate("srvA", Some("first.log")).unwrap();
        let before: Vec<_> = writer.list("srvA");

        assert!(!writer.can_rotate("srvA"));
        assert!(writer.rotate("srvA", Some("second.log")).is_err());
        assert_eq!(writer.list("srvA"), before);
    }

    #[test]
    fn test_rotate_resets_dedup_state() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"repeated line\n");
        writer.write("srvA", b"repeated line\n"); // suppressed
        writer.rotate("srvA", Some("next.log")).unwrap();
        writer.write("srvA", b"repeated line\n"); // fresh file, fresh state

        assert_eq!(read_current(tmp.path(), "srvA"), "repeated line\n");
    }

    #[test]
    fn test_reopens_current_symlink_target_on_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let writer = LogWriter::new(tmp.path(), 0);
            writer.write("srvA", b"first run\n");
        }
        // A fresh writer (process restart) appends to the same file.
        let writer = LogWriter::new(tmp.path(), 0);
        writer.write("srvA", b"second run\n");
        assert_eq!(read_current(tmp.path(), "srvA"), "first run\nsecond run\n");
        assert_eq!(writer.list("srvA").len(), 1);
    }

    #[test]
    fn test_list_excludes_symlink_and_sorts_newest_first() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"a\n");
        writer.rotate("srvA", Some("newer.log")).unwrap();
        writer.write("srvA", b"b\n");

        // Age the first file well behind the second.
        let files = writer.list("srvA");
        assert_eq!(files.len(), 2);
        let older = files.iter().find(|p| p.file_name().unwrap() != "newer.log").unwrap();
        let f = OpenOptions::new().write(true).open(older).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();

        let files = writer.list("srvA");
        assert_eq!(files[0].file_name().unwrap(), "newer.log");
        assert!(files.iter().all(|p| p.file_name().unwrap() != "current.log"));
    }

    #[test]
    fn test_retention_sweeps_only_expired_files() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 7);

        writer.write("srvA", b"old\n");
        writer.rotate("srvA", Some("fresh.log")).unwrap();
        writer.write("srvA", b"new\n");

        let files = writer.list("srvA");
        let old = files.iter().find(|p| p.file_name().unwrap() != "fresh.log").unwrap();
        let f = OpenOptions::new().write(true).open(old).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(8 * 24 * 3600)).unwrap();

        writer.sweep_expired();

        let left = writer.list("srvA");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].file_name().unwrap(), "fresh.log");
    }

    #[test]
    fn test_retention_disabled_keeps_everything() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"ancient\n");
        let files = writer.list("srvA");
        let f = OpenOptions::new().write(true).open(&files[0]).unwrap();
        f.set_modified(SystemTime::now() - Duration::from_secs(365 * 24 * 3600)).unwrap();

        writer.sweep_expired();
        assert_eq!(writer.list("srvA").len(), 1);
    }

    #[test]
    fn test_spinner_and_duplicate_pipeline_through_writer() {
        let tmp = TempDir::new().unwrap();
        let writer = LogWriter::new(tmp.path(), 0);

        writer.write("srvA", b"DHCP..../\rDHCP....-\rDHCP....\\\rDHCP....|\rDHCP....OK\n");
        for _ in 0..9 {
            writer.write("srvA", b"PXE-E53: No boot filename received\n");
        }
        writer.write("srvA", b"PXE-E53: No boot filename received\n");
        writer.write("srvA", b"Retrying...\n");

        assert_eq!(
            read_current(tmp.path(), "srvA"),
            "DHCP....OK\nPXE-E53: No boot filename received\n(Duplicated 9 lines)\nRetrying...\n"
        );
    }
}
