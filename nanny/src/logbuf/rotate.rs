//! Rotating on-disk spillover for log buffers.
//!
//! Each buffer with a configured base path appends every write to a
//! "current" file named `base.YYYY-MM-DDTHH.MM.SS[.uuuuuu]`, with the base
//! path itself maintained as a symlink to the newest file. A file is retired
//! when a wall-clock top-of-hour boundary passes or when the size threshold
//! is crossed.

// Layer 1: Standard library imports
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

// Layer 2: Third-party crate imports
use chrono::{TimeZone, Utc};
use tracing::warn;

/// On-disk rotation state for one log buffer.
#[derive(Debug)]
pub struct RotatingFile {
    base: PathBuf,
    current: Option<(PathBuf, File)>,
    rotate_bytes: u64,
    last_rotate: i64,
    last_rotate_bytes: u64,
    last_rotate_check: i64,
}

impl RotatingFile {
    /// Creates rotation state for the symlink path `base`. No file is opened
    /// until the first write.
    pub fn new(base: PathBuf, rotate_bytes: u64) -> Self {
        Self {
            base,
            current: None,
            rotate_bytes,
            last_rotate: 0,
            last_rotate_bytes: 0,
            last_rotate_check: 0,
        }
    }

    /// The symlink path.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the open file, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(path, _)| path.as_path())
    }

    /// Buffer total at the moment the current file was opened.
    pub fn last_rotate_bytes(&self) -> u64 {
        self.last_rotate_bytes
    }

    /// Appends `data`, rotating around the write as needed. `total_before`
    /// is the buffer's byte total prior to this write; the size threshold is
    /// measured against it.
    pub fn write(&mut self, data: &[u8], now: i64, total_before: u64) {
        let total_after = total_before + data.len() as u64;

        // Retire a file whose open interval crossed the top of an hour.
        if self.current.is_some() {
            let last_hour = now - now % 3600;
            if self.last_rotate > 0 && self.last_rotate < last_hour {
                self.current = None;
            }
        }

        self.ensure_open(now, total_before);
        if let Some((path, file)) = &mut self.current {
            if let Err(err) = file.write_all(data) {
                warn!(path = %path.display(), error = %err, "log file write failed");
            }
        }

        // Retire on size immediately, so a single oversized write still
        // leaves a fresh file behind the symlink.
        if self.current.is_some() && total_after - self.last_rotate_bytes > self.rotate_bytes {
            self.current = None;
            self.ensure_open(now, total_after);
        }

        self.last_rotate_check = now;
    }

    /// Opens a new timestamped file and repoints the symlink, if no file is
    /// currently open.
    fn ensure_open(&mut self, now: i64, total: u64) {
        if self.current.is_some() {
            return;
        }

        // Choose the timestamp for the new name. If an hour (or minute)
        // boundary fell between the last rotation check and now, round down
        // to it so the filenames line up with the boundary that forced the
        // rotation.
        let mut creation = now;
        if self.last_rotate_check > 0 {
            if creation - creation % 3600 > self.last_rotate_check {
                creation -= creation % 3600;
            } else if creation - creation % 60 > self.last_rotate_check {
                creation -= creation % 60;
            }
        }

        let stamp = match Utc.timestamp_opt(creation, 0).single() {
            Some(dt) => dt.format("%Y-%m-%dT%H.%M.%S").to_string(),
            None => return,
        };
        let mut path = PathBuf::from(format!("{}.{stamp}", self.base.display()));

        let mut file = Self::open_exclusive(&path);
        if file.is_none() {
            // Rotated twice within one second; disambiguate with microseconds.
            let micros = Utc::now().timestamp_subsec_micros();
            path = PathBuf::from(format!("{}.{micros:06}", path.display()));
            file = Self::open_exclusive(&path);
        }

        let Some(file) = file else {
            warn!(base = %self.base.display(), "unable to open rotated log file");
            return;
        };

        let _ = fs::remove_file(&self.base);
        if let Some(name) = path.file_name() {
            if let Err(err) = symlink(name, &self.base) {
                warn!(base = %self.base.display(), error = %err, "log symlink update failed");
            }
        }

        self.last_rotate = now;
        self.last_rotate_bytes = total;
        self.current = Some((path, file));
    }

    fn open_exclusive(path: &Path) -> Option<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .append(true)
            .open(path)
        {
            Ok(file) => Some(file),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "log file open failed");
                None
            }
        }
    }
}
