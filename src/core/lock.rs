//! Exclusive ownership of a data directory. `run` and `rotate-key` both need
//! it: a running bot caches the encryption key, so a rotation underneath it
//! would get stale envelopes written back into the database.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::error::LockError;
use crate::platform::{NativePlatform, Platform};

pub const LOCK_FILE: &str = "grassbot.lock";

/// Released when dropped.
#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Take the lock without waiting. `purpose` is recorded in the file so a
    /// refused caller can say who holds it.
    pub fn acquire(data_dir: &Path, purpose: &str) -> Result<Self, LockError> {
        let path = data_dir.join(LOCK_FILE);
        let io = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io)?;
        NativePlatform::restrict_file_permissions(&path);

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            return Err(LockError::Held {
                path: path.display().to_string(),
                holder: holder.trim().to_string(),
            });
        }

        file.set_len(0).map_err(io)?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        writeln!(file, "{} (pid {})", purpose, std::process::id()).map_err(io)?;
        file.flush().map_err(io)?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
