//! Append-only log file for the supervised process output

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

struct LogFileState {
    file: File,
    written: u64,
}

/// Rolling log file shared by the stdout and stderr drains.
///
/// Lines are appended; once the file grows past `max_bytes` it is renamed to
/// `<name>.1` (replacing any previous roll) and a fresh file is started.
pub struct LogSink {
    path: PathBuf,
    max_bytes: u64,
    state: Mutex<LogFileState>,
}

impl LogSink {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let file = open_append(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            max_bytes,
            state: Mutex::new(LogFileState { file, written }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Write failures are logged and otherwise ignored so a
    /// full disk never stalls the process output pipes.
    pub fn append(&self, stream: LogStream, line: &str) {
        let mut state = self.state.lock();

        if self.max_bytes > 0 && state.written >= self.max_bytes {
            if let Err(e) = self.roll(&mut state) {
                warn!(path = %self.path.display(), error = %e, "Failed to roll log file");
            }
        }

        let entry = format!(
            "{} [{}] {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            stream.as_str(),
            line
        );
        match state.file.write_all(entry.as_bytes()) {
            Ok(()) => state.written += entry.len() as u64,
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to write log line"),
        }
    }

    /// Write a line from the supervisor itself (lifecycle markers)
    pub fn note(&self, message: &str) {
        let mut state = self.state.lock();
        let entry = format!(
            "{} [supervisor] {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            message
        );
        if state.file.write_all(entry.as_bytes()).is_ok() {
            state.written += entry.len() as u64;
        }
    }

    fn roll(&self, state: &mut LogFileState) -> Result<()> {
        state.file.flush()?;
        let rolled = rolled_path(&self.path);
        std::fs::rename(&self.path, &rolled)?;
        state.file = open_append(&self.path)?;
        state.written = 0;
        Ok(())
    }

    /// Last `lines` lines of the current log file
    pub fn tail(&self, lines: usize) -> Result<Vec<String>> {
        // Hold the lock so a roll cannot swap the file mid-read
        let _state = self.state.lock();
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut window = VecDeque::with_capacity(lines);
        for line in BufReader::new(file).lines() {
            let line = line?;
            if lines == 0 {
                continue;
            }
            if window.len() == lines {
                window.pop_front();
            }
            window.push_back(line);
        }
        Ok(window.into_iter().collect())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

fn rolled_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = LogSink::open(tmp.path().join("logs/server.log"), 0).unwrap();

        for i in 0..10 {
            sink.append(LogStream::Stdout, &format!("line {}", i));
        }
        sink.append(LogStream::Stderr, "oops");

        let tail = sink.tail(3).unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].ends_with("[stdout] line 8"));
        assert!(tail[1].ends_with("[stdout] line 9"));
        assert!(tail[2].ends_with("[stderr] oops"));
    }

    #[test]
    fn test_appends_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.log");

        LogSink::open(&path, 0).unwrap().append(LogStream::Stdout, "first run");
        LogSink::open(&path, 0).unwrap().append(LogStream::Stdout, "second run");

        let tail = LogSink::open(&path, 0).unwrap().tail(10).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("first run"));
    }

    #[test]
    fn test_rolls_when_full() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.log");
        let sink = LogSink::open(&path, 64).unwrap();

        for i in 0..10 {
            sink.append(LogStream::Stdout, &format!("a fairly long log line number {}", i));
        }

        assert!(rolled_path(&path).exists());
        assert!(std::fs::metadata(&path).unwrap().len() < 200);
        let tail = sink.tail(1).unwrap();
        assert!(tail[0].ends_with("number 9"));
    }

    #[test]
    fn test_tail_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.log");
        let sink = LogSink::open(&path, 0).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(sink.tail(5).unwrap().is_empty());
    }
}
