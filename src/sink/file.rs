use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Sink;
use crate::{error::DeliveryError, Batch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// `0` disables size-based rotation.
    pub max_size_bytes: u64,
    pub max_age: Option<Duration>,
    pub max_backups: usize,
}

#[derive(Debug)]
struct OpenFile {
    file: File,
    size: u64,
    opened_at: SystemTime,
}

trait Truncate {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}
impl Truncate for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Writes all of `line` or rolls `out` back to `size` bytes.
fn append_line<W: Write + Truncate>(out: &mut W, size: u64, line: &[u8]) -> io::Result<()> {
    let Err(e) = out.write_all(line).and_then(|()| out.flush()) else {
        return Ok(());
    };
    if let Err(undo) = out.truncate_to(size) {
        tracing::warn!(error = %undo, "failed to roll back partial line");
    }
    Err(e)
}

/// `<path>.n`; `.1` is the newest backup.
pub fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

#[derive(Debug)]
struct Rotator {
    path: PathBuf,
    policy: RotationPolicy,
    current: Mutex<Option<OpenFile>>,
}
impl Rotator {
    fn open(&self) -> io::Result<OpenFile> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let meta = file.metadata()?;
        let opened_at = meta
            .created()
            .or_else(|_| meta.modified())
            .unwrap_or_else(|_| SystemTime::now());
        Ok(OpenFile {
            file,
            size: meta.len(),
            opened_at,
        })
    }

    fn needs_rotation(&self, current: &OpenFile, incoming: u64) -> bool {
        if current.size == 0 {
            return false;
        }
        let too_big = self.policy.max_size_bytes > 0
            && current.size + incoming > self.policy.max_size_bytes;
        let too_old = match self.policy.max_age {
            Some(max_age) => current.opened_at.elapsed().unwrap_or_default() >= max_age,
            None => false,
        };
        too_big || too_old
    }

    fn rotate(&self) -> io::Result<()> {
        if self.policy.max_backups == 0 {
            return remove_if_exists(&self.path);
        }
        remove_if_exists(&backup_path(&self.path, self.policy.max_backups))?;
        for n in (1..self.policy.max_backups).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, n + 1))?;
            }
        }
        fs::rename(&self.path, backup_path(&self.path, 1))
    }

    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        let mut current = self.current.lock();
        if current.is_none() {
            *current = Some(self.open()?);
        }
        if let Some(open) = current.as_ref() {
            if self.needs_rotation(open, line.len() as u64) {
                *current = None;
                self.rotate()?;
                *current = Some(self.open()?);
            }
        }
        let Some(open) = current.as_mut() else {
            return Err(io::Error::other("file sink not open"));
        };
        if let Err(e) = append_line(&mut open.file, open.size, line) {
            // Reopen next time so the size is re-read from disk.
            *current = None;
            return Err(e);
        }
        open.size += line.len() as u64;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Appends each batch as one JSON line, rotating by size and age.
#[derive(Debug)]
pub struct FileSink {
    name: String,
    rotator: Arc<Rotator>,
}
impl FileSink {
    pub fn new(name: impl Into<String>, path: PathBuf, policy: RotationPolicy) -> Self {
        Self {
            name: name.into(),
            rotator: Arc::new(Rotator {
                path,
                policy,
                current: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let mut line = serde_json::to_vec(batch)
            .map_err(|e| DeliveryError::Permanent(format!("serialize batch: {e}")))?;
        line.push(b'\n');
        let rotator = Arc::clone(&self.rotator);
        // Blocking I/O
        tokio::task::spawn_blocking(move || {
            rotator
                .write_line(&line)
                .map_err(|e| format!("{}: {e}", rotator.path.display()))
        })
        .await
        .map_err(|e| DeliveryError::Transient(format!("write task: {e}")))?
        .map_err(DeliveryError::Transient)
    }
}
