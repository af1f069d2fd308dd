//! Advisory lock files guarding shared on-disk roots.
//!
//! At most one process may hold the lock for any given path system-wide. On
//! contention the file is parsed to report who holds it, which makes the
//! resulting diagnostic actionable instead of a bare EWOULDBLOCK.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::{Error, Result};

/// An exclusive lock over a single path, held for the lifetime of a session
/// operation.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
    owner_pid: i32,
    owner_process: String,
}

impl LockFile {
    /// Prepare a lock for the given path. No lock is taken yet.
    pub fn new(path: &Path) -> Result<LockFile> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(LockFile {
            path: path.to_path_buf(),
            file: None,
            owner_pid: -1,
            owner_process: String::new(),
        })
    }

    /// Attempt to take the exclusive lock, without blocking. On contention
    /// the current owner is read back out of the file and reported in the
    /// error.
    pub fn lock(&mut self) -> Result<()> {
        // Never unlink a "stale" lock file here: a second process could
        // recreate the path and acquire a separate exclusive lock on a new
        // inode, defeating mutual exclusion.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)?;

        if file.try_lock_exclusive().is_err() {
            let (pid, process) = read_owner(&mut file);
            self.owner_pid = pid;
            self.owner_process = process.clone();

            return Err(Error::OwnedLock {
                owner_pid: pid,
                owner_process: process,
            });
        }

        // Record who we are for the next contender's diagnostics.
        let pid = std::process::id() as i32;
        let process = current_process_name();

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{pid}\n{process}")?;
        file.sync_all()?;

        debug!(path = %self.path.display(), pid, "acquired lockfile");

        self.owner_pid = pid;
        self.owner_process = process;
        self.file = Some(file);

        Ok(())
    }

    /// Release the lock if held.
    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file)?;
            debug!(path = %self.path.display(), "released lockfile");
        }

        Ok(())
    }

    /// Remove the lock file from disk. Only safe once unlocked; refuses to
    /// remove a file this instance still has locked.
    pub fn clean(&mut self) -> Result<()> {
        if self.file.is_some() {
            self.unlock()?;
        }

        if crate::path_exists(&self.path) {
            fs::remove_file(&self.path)?;
        }

        Ok(())
    }

    /// PID of the last known owner (ours after a successful lock, theirs
    /// after contention).
    pub fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    /// Short executable name of the last known owner.
    pub fn owner_process(&self) -> &str {
        &self.owner_process
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

fn read_owner(file: &mut File) -> (i32, String) {
    let mut contents = String::new();
    if file.read_to_string(&mut contents).is_err() {
        return (-1, String::new());
    }

    let mut lines = contents.lines();
    let pid = lines
        .next()
        .and_then(|l| l.trim().parse::<i32>().ok())
        .unwrap_or(-1);
    let process = lines.next().unwrap_or("").trim().to_string();

    (pid, process)
}

fn current_process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "solbuild".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_writes_owner_details() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("root.lock");

        let mut lock = LockFile::new(&path).unwrap();
        lock.lock().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap().parse::<u32>().unwrap(),
            std::process::id()
        );
        assert!(!lines.next().unwrap().is_empty());

        lock.unlock().unwrap();
    }

    #[test]
    fn second_lock_in_process_reports_owner() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("root.lock");

        let mut first = LockFile::new(&path).unwrap();
        first.lock().unwrap();

        // flock(2) locks are per open file description, so a second handle
        // within the same process still contends.
        let mut second = LockFile::new(&path).unwrap();
        match second.lock() {
            Err(Error::OwnedLock {
                owner_pid,
                owner_process,
            }) => {
                assert_eq!(owner_pid, std::process::id() as i32);
                assert!(!owner_process.is_empty());
            }
            other => panic!("expected OwnedLock, got {other:?}"),
        }
    }

    #[test]
    fn unlock_then_relock_succeeds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("root.lock");

        let mut lock = LockFile::new(&path).unwrap();
        lock.lock().unwrap();
        lock.unlock().unwrap();

        let mut again = LockFile::new(&path).unwrap();
        again.lock().unwrap();
        again.unlock().unwrap();
    }

    #[test]
    fn clean_removes_the_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("root.lock");

        let mut lock = LockFile::new(&path).unwrap();
        lock.lock().unwrap();
        lock.clean().unwrap();

        assert!(!path.exists());
    }
}
