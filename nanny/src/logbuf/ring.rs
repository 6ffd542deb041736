//! The circular byte buffer and its statistics.

// Layer 1: Standard library imports
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

// Layer 3: Internal module imports
use super::rotate::RotatingFile;
use crate::util::isotime;

/// Shared handle to a log buffer.
///
/// Writers (pipe drains, the event logger) and readers (status pages) hold
/// clones; the ring and any open file are torn down when the last clone
/// drops. All access is from the supervisor thread, so `Rc<RefCell<_>>` is
/// the whole ownership story.
pub type SharedLog = Rc<RefCell<LogBuffer>>;

/// Throughput and error counters for one buffer.
#[derive(Debug, Default, Clone)]
pub struct LogStats {
    /// Total bytes ever written, regardless of ring wrap.
    pub total_bytes: u64,
    /// Number of reads/copies that fed the buffer.
    pub read_count: u64,
    /// Failed reads on the feeding pipe.
    pub error_count: u64,
    /// Recent ingest rate, recomputed at most once per second.
    pub bytes_per_second: f64,
    bps_last_time: i64,
    bps_last_bytes: u64,
}

impl LogStats {
    fn update_bps(&mut self, now: i64) {
        if self.bps_last_time == now {
            return;
        }
        if self.bps_last_time == 0 {
            self.bytes_per_second = 0.0;
        } else {
            self.bytes_per_second = (self.total_bytes - self.bps_last_bytes) as f64
                / (now - self.bps_last_time) as f64;
        }
        self.bps_last_time = now;
        self.bps_last_bytes = self.total_bytes;
    }
}

/// A circular byte window over a child's output stream.
///
/// There is no framing: the ring is a window on a byte stream, and bytes
/// past the end silently overwrite the oldest data. The logical content
/// spans `[head, end)` then `[start, head)`.
#[derive(Debug)]
pub struct LogBuffer {
    ring: Vec<u8>,
    head: usize,
    /// Ingest statistics.
    pub stats: LogStats,
    file: Option<RotatingFile>,
}

impl LogBuffer {
    /// Creates a buffer with the given ring capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: vec![0u8; capacity.max(1)],
            head: 0,
            stats: LogStats::default(),
            file: None,
        }
    }

    /// Creates a buffer behind a shared handle.
    pub fn shared(capacity: usize) -> SharedLog {
        Rc::new(RefCell::new(Self::new(capacity)))
    }

    /// Ring capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.ring.len()
    }

    /// Configures on-disk spillover under `base` (the symlink path).
    pub fn set_base_path(&mut self, base: PathBuf, rotate_bytes: u64) {
        self.file = Some(RotatingFile::new(base, rotate_bytes));
    }

    /// On-disk state, if spillover is configured.
    pub fn file(&self) -> Option<&RotatingFile> {
        self.file.as_ref()
    }

    /// Appends bytes: tees to the rotating file when configured, then copies
    /// into the ring, wrapping as needed.
    pub fn append(&mut self, bytes: &[u8], now: i64) {
        if let Some(file) = &mut self.file {
            file.write(bytes, now, self.stats.total_bytes);
        }

        let mut rest = bytes;
        while !rest.is_empty() {
            let space = self.ring.len() - self.head;
            let take = rest.len().min(space);
            self.ring[self.head..self.head + take].copy_from_slice(&rest[..take]);
            self.head += take;
            rest = &rest[take..];
            self.stats.total_bytes += take as u64;
            self.stats.read_count += 1;
            if self.head >= self.ring.len() {
                self.head = 0;
            }
        }
        self.stats.update_bps(now);
    }

    /// Appends a timestamped event line, `"<isotime>: <line>\n"`.
    pub fn note(&mut self, now: i64, line: &str) {
        let msg = format!("{}: {}\n", isotime(now), line);
        self.append(msg.as_bytes(), now);
    }

    /// The linear region a pipe read may fill next. Wrap-around is handled
    /// by the following read, so one read never spans the seam.
    pub(super) fn fill_region(&mut self) -> &mut [u8] {
        let head = self.head;
        &mut self.ring[head..]
    }

    /// Accounts for `n` bytes just read into [`Self::fill_region`].
    pub(super) fn commit_fill(&mut self, n: usize, now: i64) {
        if let Some(file) = &mut self.file {
            let written = self.ring[self.head..self.head + n].to_vec();
            file.write(&written, now, self.stats.total_bytes);
        }
        self.head += n;
        self.stats.total_bytes += n as u64;
        self.stats.read_count += 1;
        if self.head >= self.ring.len() {
            self.head = 0;
        }
        self.stats.update_bps(now);
    }

    /// Records a failed read on the feeding pipe.
    pub(super) fn record_error(&mut self) {
        self.stats.error_count += 1;
    }

    /// Serializes the ring oldest-first — `[head, end)` then `[start, head)`
    /// — dropping embedded NULs (unwritten or overwritten slack).
    pub fn dump_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ring.len());
        out.extend(self.ring[self.head..].iter().filter(|&&b| b != 0));
        out.extend(self.ring[..self.head].iter().filter(|&&b| b != 0));
        out
    }

    /// The ring content re-synthesized as text lines, for JSON status pages.
    /// Control characters survive into the strings; JSON encoding escapes
    /// them on output.
    pub fn dump_lines(&self) -> Vec<String> {
        let raw = self.dump_raw();
        let mut lines: Vec<String> = raw
            .split(|&b| b == b'\n')
            .map(|seg| String::from_utf8_lossy(seg).into_owned())
            .collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }
}
