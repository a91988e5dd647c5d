//! Process-exclusive advisory lock on the cache root (spec §6 directory
//! layout, §9 "Global state").

use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::error::{CacheError, CacheResult};

pub struct LockFile {
    _file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquire the `.lock` file under `cache_root`, failing immediately
    /// (rather than blocking) if another process already holds it.
    pub fn acquire(cache_root: impl AsRef<Path>) -> CacheResult<Self> {
        let cache_root = cache_root.as_ref();
        std::fs::create_dir_all(cache_root)?;
        let path = cache_root.join(".lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| {
            CacheError::Io(std::io::Error::other(format!(
                "cache root already locked by another process: {}",
                path.display()
            )))
        })?;

        Ok(Self { _file: file, path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._file);
        let _ = &self.path;
    }
}
