//! Log file with size-based rotation.
//!
//! `RotatingFile` plugs into `tracing_subscriber::fmt` as a [`MakeWriter`].
//! Each event is written in one piece; when it would push the file past
//! `max_bytes`, the file is shifted to `<name>.1` (older backups move up one
//! slot, the last one is dropped) and a fresh file is opened.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LoggingConfig;

pub struct RotatingFile {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    /// Opens (or creates) the log file in append mode, creating its directory.
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = open_append(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            inner: Mutex::new(Inner {
                path: path.to_path_buf(),
                max_bytes: max_bytes.max(1),
                backups,
                file,
                written,
            }),
        })
    }

    pub fn from_config(config: &LoggingConfig) -> Result<Self> {
        Self::open(
            &config.dir.join(&config.file_name),
            config.max_bytes,
            config.backups,
        )
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriter(&self.inner)
    }
}

/// Handle for one formatted event.
pub struct RotatingWriter<'a>(&'a Mutex<Inner>);

impl Write for RotatingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(self.0).write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(self.0).file.flush()
    }
}

impl Inner {
    fn write_record(&mut self, buf: &[u8]) -> io::Result<()> {
        let len = buf.len() as u64;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(buf)?;
        self.written += len;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.backups == 0 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }
        for n in (1..self.backups).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(&self.path, n + 1))?;
            }
        }
        std::fs::rename(&self.path, backup_path(&self.path, 1))?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_line(log: &RotatingFile, line: &str) {
        let mut writer = log.make_writer();
        writer.write_all(line.as_bytes()).unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn creates_directory_and_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("observatory.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "earlier\n").unwrap();

        let log = RotatingFile::open(&path, 1024, 2).unwrap();
        write_line(&log, "later\n");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nlater\n");
    }

    #[test]
    fn rotates_when_the_file_would_grow_past_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observatory.log");
        let log = RotatingFile::open(&path, 10, 3).unwrap();

        write_line(&log, "aaaaaaa\n");
        write_line(&log, "bbbbbbb\n");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "bbbbbbb\n");
        assert_eq!(
            std::fs::read_to_string(backup_path(&path, 1)).unwrap(),
            "aaaaaaa\n"
        );
    }

    #[test]
    fn keeps_only_the_configured_number_of_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observatory.log");
        let log = RotatingFile::open(&path, 4, 2).unwrap();

        for line in ["one\n", "two\n", "six\n", "ten\n"] {
            write_line(&log, line);
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ten\n");
        assert_eq!(std::fs::read_to_string(backup_path(&path, 1)).unwrap(), "six\n");
        assert_eq!(std::fs::read_to_string(backup_path(&path, 2)).unwrap(), "two\n");
        assert!(!backup_path(&path, 3).exists());
    }

    #[test]
    fn zero_backups_truncates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observatory.log");
        let log = RotatingFile::open(&path, 4, 0).unwrap();

        write_line(&log, "one\n");
        write_line(&log, "two\n");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two\n");
        assert!(!backup_path(&path, 1).exists());
    }

    #[test]
    fn oversized_record_still_lands_in_a_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observatory.log");
        let log = RotatingFile::open(&path, 4, 1).unwrap();

        write_line(&log, "ab\n");
        write_line(&log, "a much longer line\n");

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a much longer line\n");
        assert_eq!(std::fs::read_to_string(backup_path(&path, 1)).unwrap(), "ab\n");
    }

    #[test]
    fn from_config_joins_dir_and_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            dir: dir.path().join("logs"),
            ..LoggingConfig::default()
        };
        let log = RotatingFile::from_config(&config).unwrap();
        write_line(&log, "hello\n");

        let path = dir.path().join("logs").join("observatory.log");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello\n");
    }
}
