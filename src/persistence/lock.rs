// =============================================================================
// Instance Lock — one engine per database file
// =============================================================================
//
// Advisory POSIX flock on a well-known path, holding this process's PID.
// A second engine pointed at the same data directory fails fast with a
// message naming the holder instead of corrupting the single-writer ledger.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::info;

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // Held for the lifetime of the lock; flock releases on close.
    _file: File,
}

impl InstanceLock {
    /// Acquire the lock or fail with the holder's PID.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let mut holder = String::new();
            file.read_to_string(&mut holder).ok();
            let holder = holder.trim();
            bail!(
                "another engine instance holds {} (pid {})",
                path.display(),
                if holder.is_empty() { "unknown" } else { holder }
            );
        }

        // Record our PID for the next contender's error message.
        file.set_len(0).context("failed to truncate lock file")?;
        file.seek(SeekFrom::Start(0)).context("failed to seek lock file")?;
        write!(file, "{}", std::process::id()).context("failed to write pid to lock file")?;
        file.flush().ok();

        info!(path = %path.display(), pid = std::process::id(), "instance lock acquired");
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
