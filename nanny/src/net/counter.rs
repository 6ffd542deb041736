//! FIFO word-counter service.
//!
//! A named pipe anyone on the host can write whitespace-delimited tokens
//! into; the supervisor tallies them in a tiny fixed table and reports
//! counts through its own diagnostics. Handy for scraping quick event
//! counts out of shell scripts (`echo restart >> $FIFO`).

// Layer 1: Standard library imports
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

// Layer 2: Third-party crate imports
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, read, unlink};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

// Layer 3: Internal module imports
use crate::error::{NannyError, NannyResult};

/// Longest token worth counting.
const WORD_MAX: usize = 63;

/// Table slots; tokens beyond this variety are dropped with a warning.
const SLOTS: usize = 8;

#[derive(Debug, Default, Clone)]
struct WordSlot {
    text: String,
    count: u64,
}

/// The FIFO and its counting table.
#[derive(Debug)]
pub struct CounterServer {
    fd: OwnedFd,
    path: PathBuf,
    /// Partial token carried between reads.
    pending: Vec<u8>,
    words: [WordSlot; SLOTS],
}

impl CounterServer {
    /// Creates the FIFO (a random `/tmp/nanny_socket_*` name by default) and
    /// opens it for counting.
    ///
    /// The descriptor is opened read-write so an idle pipe never reports
    /// end-of-file storms between writers.
    pub fn open(path: Option<PathBuf>) -> NannyResult<Self> {
        let path = match path {
            Some(path) => path,
            None => {
                let tag: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(8)
                    .map(char::from)
                    .collect();
                PathBuf::from(format!("/tmp/nanny_socket_{tag}"))
            }
        };

        mkfifo(&path, Mode::from_bits_truncate(0o755))
            .map_err(|e| NannyError::io("mkfifo", e))?;
        let fd = open(&path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty()).map_err(|e| {
            let _ = unlink(&path);
            NannyError::io("open fifo", e)
        })?;

        info!(path = %path.display(), "counter FIFO ready");
        Ok(Self {
            fd,
            path,
            pending: Vec::new(),
            words: Default::default(),
        })
    }

    /// Descriptor for reactor registration.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The FIFO's path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Reads whatever is available and counts completed tokens.
    pub fn pump(&mut self) {
        let mut buf = [0u8; 2048];
        loop {
            match read(&self.fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => self.ingest(&buf[..n]),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                Err(err) => {
                    warn!(error = %err, "counter read failed");
                    break;
                }
            }
        }
    }

    /// Count of one token, if it is being tracked.
    pub fn count_of(&self, word: &str) -> Option<u64> {
        self.words
            .iter()
            .find(|slot| slot.text == word)
            .map(|slot| slot.count)
    }

    fn ingest(&mut self, bytes: &[u8]) {
        // Control characters count as whitespace, like the tokenizer
        // this replaces.
        for &byte in bytes {
            if byte <= b' ' {
                if !self.pending.is_empty() {
                    let word = std::mem::take(&mut self.pending);
                    self.count_word(&word);
                }
            } else if self.pending.len() <= WORD_MAX {
                self.pending.push(byte);
            }
        }
    }

    fn count_word(&mut self, word: &[u8]) {
        if word.is_empty() || word.len() > WORD_MAX {
            return;
        }
        let word = String::from_utf8_lossy(word).into_owned();

        if let Some(slot) = self.words.iter_mut().find(|s| s.text == word) {
            slot.count += 1;
            info!(word = slot.text.as_str(), count = slot.count, "counter");
            return;
        }
        if let Some(slot) = self.words.iter_mut().find(|s| s.text.is_empty()) {
            slot.text = word;
            slot.count = 1;
            info!(word = slot.text.as_str(), count = slot.count, "counter");
            return;
        }
        warn!(word = word.as_str(), "no space for word");
    }
}

impl Drop for CounterServer {
    fn drop(&mut self) {
        if let Err(err) = unlink(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove FIFO");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nix::unistd::write;

    fn counter_in_tempdir() -> (tempfile::TempDir, CounterServer) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter_fifo");
        let counter = CounterServer::open(Some(path)).unwrap();
        (dir, counter)
    }

    #[test]
    fn test_counts_whitespace_separated_tokens() {
        let (_dir, mut counter) = counter_in_tempdir();
        write(&counter.fd, b"alpha beta alpha\n").unwrap();
        counter.pump();

        assert_eq!(counter.count_of("alpha"), Some(2));
        assert_eq!(counter.count_of("beta"), Some(1));
        assert_eq!(counter.count_of("gamma"), None);
    }

    #[test]
    fn test_partial_token_survives_between_reads() {
        let (_dir, mut counter) = counter_in_tempdir();
        write(&counter.fd, b"hel").unwrap();
        counter.pump();
        assert_eq!(counter.count_of("hel"), None);

        write(&counter.fd, b"lo world ").unwrap();
        counter.pump();
        assert_eq!(counter.count_of("hello"), Some(1));
        assert_eq!(counter.count_of("world"), Some(1));
    }

    #[test]
    fn test_table_overflow_drops_new_words() {
        let (_dir, mut counter) = counter_in_tempdir();
        let mut input = String::new();
        for i in 0..10 {
            input.push_str(&format!("word{i} "));
        }
        write(&counter.fd, input.as_bytes()).unwrap();
        counter.pump();

        assert_eq!(counter.count_of("word0"), Some(1));
        assert_eq!(counter.count_of("word7"), Some(1));
        assert_eq!(counter.count_of("word8"), None);
        assert_eq!(counter.count_of("word9"), None);
    }

    #[test]
    fn test_fifo_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter_fifo");
        let counter = CounterServer::open(Some(path.clone())).unwrap();
        assert!(path.exists());
        drop(counter);
        assert!(!path.exists());
    }
}
