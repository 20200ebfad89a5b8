// src/core/log_follower.rs

//! Tails a service's run log on a background thread, sending complete lines over a channel.

use crate::constants::POLL_INTERVAL;
use crate::models::LogLine;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

/// Where following starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    Beginning,
    End,
    Offset(u64),
}

/// A running tail. Dropping it stops the thread and waits for it.
#[derive(Debug)]
pub struct LogFollower {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogFollower {
    /// Starts following `path`. A file that does not exist yet is waited for.
    pub fn spawn(
        service: &str,
        path: &Path,
        start: StartAt,
        sender: Sender<LogLine>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut tail = Tail {
            service: service.to_string(),
            path: path.to_path_buf(),
            start,
            stop: Arc::clone(&stop),
            sender,
        };
        let handle = std::thread::Builder::new()
            .name(format!("muster-log-{}", service))
            .spawn(move || {
                if let Err(e) = tail.run() {
                    log::warn!("Stopped following '{}': {}", tail.path.display(), e);
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Log follower thread panicked.");
            }
        }
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Current size of `path`, or 0 if it does not exist.
pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map_or(0, |m| m.len())
}

struct Tail {
    service: String,
    path: PathBuf,
    start: StartAt,
    stop: Arc<AtomicBool>,
    sender: Sender<LogLine>,
}

impl Tail {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Opens the file, waiting for it to appear. Returns the reader, its position and the
    /// inode it was opened on.
    fn open(&self, start: StartAt) -> io::Result<Option<(BufReader<File>, u64, u64)>> {
        loop {
            if self.stopped() {
                return Ok(None);
            }
            match File::open(&self.path) {
                Ok(mut file) => {
                    let meta = file.metadata()?;
                    let position = match start {
                        StartAt::Beginning => 0,
                        StartAt::End => file.seek(SeekFrom::End(0))?,
                        StartAt::Offset(offset) => file.seek(SeekFrom::Start(offset.min(meta.len())))?,
                    };
                    return Ok(Some((BufReader::new(file), position, meta.ino())));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(e),
            }
        }
    }

    fn run(&mut self) -> io::Result<()> {
        let Some((mut reader, mut position, mut inode)) = self.open(self.start)? else {
            return Ok(());
        };
        let mut pending: Vec<u8> = Vec::new();

        while !self.stopped() {
            let read = reader.read_until(b'\n', &mut pending)?;
            if read == 0 {
                match std::fs::metadata(&self.path) {
                    // Removed and recreated: the old handle still points at the unlinked file.
                    Ok(meta) if meta.ino() != inode => {
                        log::debug!("'{}' was replaced, reopening.", self.path.display());
                        let Some(reopened) = self.open(StartAt::Beginning)? else {
                            return Ok(());
                        };
                        (reader, position, inode) = reopened;
                        pending.clear();
                    }
                    Ok(meta) if meta.len() < position => {
                        log::debug!("'{}' was truncated, rewinding.", self.path.display());
                        reader.seek(SeekFrom::Start(0))?;
                        position = 0;
                        pending.clear();
                    }
                    _ => std::thread::sleep(POLL_INTERVAL),
                }
                continue;
            }
            position += read as u64;
            if pending.last() != Some(&b'\n') {
                continue;
            }
            let message = String::from_utf8_lossy(&pending)
                .trim_end_matches(['\n', '\r'])
                .to_string();
            pending.clear();
            let line = LogLine {
                service: self.service.clone(),
                message,
            };
            if self.sender.send(line).is_err() {
                // Receiver is gone.
                return Ok(());
            }
        }
        Ok(())
    }
}
