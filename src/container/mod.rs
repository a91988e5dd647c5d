//! Per-object sparse files with atomic staged commits (spec §4.2).
//!
//! Grounded on the teacher's blocking-I/O-inside-`spawn_blocking` style
//! (`fs/writeback_cache/wal.rs`) for the shape of the API, and on the
//! staging-file + rename + parent-dir-fsync commit pattern used by
//! `pbs-datastore::chunk_store::ChunkStore::insert_chunk` (`proxmox_sys::fs::replace_file`)
//! for `Container::close`.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{CacheError, CacheResult};
use crate::task::spawn_blocking_named;

/// Join `path` under `root`, rejecting any path that would escape it.
///
/// Shared with `ChunkProvider`, which has the same containment
/// requirement (spec §4.4: "must reject paths that... escape the root").
pub(crate) fn safe_join(root: &Path, path: &str) -> CacheResult<PathBuf> {
    if path.is_empty() {
        return Err(CacheError::Io(std::io::Error::other("empty path")));
    }
    let normalized = path.replace('\\', "/");
    let mut joined = root.to_path_buf();
    for component in normalized.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(CacheError::Io(std::io::Error::other(format!(
                    "path escapes cache root: {path}"
                ))));
            }
            part => joined.push(part),
        }
    }
    Ok(joined)
}

/// Owns the sparse files backing all `Container`s opened from it.
#[derive(Clone)]
pub struct ContainerStore {
    root: PathBuf,
}

impl ContainerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn committed_path(&self, path: &str) -> CacheResult<PathBuf> {
        let objects = self.root.join("objects");
        safe_join(&objects, path)
    }

    /// Open (creating if needed) the container for `path`. The staging file
    /// starts as a byte-identical copy of any existing committed file.
    pub async fn open(&self, path: &str) -> CacheResult<Container> {
        let committed_path = self.committed_path(path)?;
        let staging_path = staging_path_for(&committed_path);

        spawn_blocking_named("container-open", move || -> CacheResult<Container> {
            if let Some(parent) = committed_path.parent() {
                fs::create_dir_all(parent)?;
            }

            if committed_path.exists() {
                fs::copy(&committed_path, &staging_path)?;
            } else {
                // Truncate in case a prior staging file was left behind by a
                // crash before close() renamed it away.
                File::create(&staging_path)?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&staging_path)?;

            Ok(Container {
                committed_path,
                staging_path,
                file,
            })
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }
}

fn staging_path_for(committed_path: &Path) -> PathBuf {
    let file_name = committed_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    committed_path.with_file_name(format!("{file_name}.tmp-{}", std::process::id()))
}

/// A single object's sparse local file, mid-write. `close` commits it
/// atomically to its logical path.
pub struct Container {
    committed_path: PathBuf,
    staging_path: PathBuf,
    file: File,
}

impl Container {
    /// Positional write; grows the file sparsely. `FileExt::write_at`
    /// is a single `pwrite`, so concurrent calls on cloned handles would be
    /// safe, but callers are still expected to serialize writes to a given
    /// path via the manager's per-path lock (spec §5).
    pub async fn write_at(&self, buf: Vec<u8>, offset: u64) -> CacheResult<usize> {
        let file = self.file.try_clone()?;
        spawn_blocking_named("container-write-at", move || -> CacheResult<usize> {
            file.write_at(&buf, offset)?;
            Ok(buf.len())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    /// Positional read. Returns fewer bytes than requested at EOF, matching
    /// `Read::read`'s short-read semantics rather than erroring.
    pub async fn read_at(&self, mut buf: Vec<u8>, offset: u64) -> CacheResult<Vec<u8>> {
        let file = self.file.try_clone()?;
        spawn_blocking_named("container-read-at", move || -> CacheResult<Vec<u8>> {
            let mut total = 0;
            loop {
                match file.read_at(&mut buf[total..], offset + total as u64) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(CacheError::Io(e)),
                }
                if total == buf.len() {
                    break;
                }
            }
            buf.truncate(total);
            Ok(buf)
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    pub async fn truncate(&self, size: u64) -> CacheResult<()> {
        let file = self.file.try_clone()?;
        spawn_blocking_named("container-truncate", move || -> CacheResult<()> {
            file.set_len(size)?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    pub async fn fsync(&self) -> CacheResult<()> {
        let file = self.file.try_clone()?;
        spawn_blocking_named("container-fsync", move || -> CacheResult<()> {
            file.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }

    /// Fsync, then atomically rename the staging file onto the committed
    /// path, replacing any prior version, then fsync the parent directory so
    /// the rename itself is durable. Idempotent: calling twice is a no-op
    /// the second time since the staging file is already gone.
    pub async fn close(self) -> CacheResult<()> {
        let Container {
            committed_path,
            staging_path,
            file,
        } = self;
        spawn_blocking_named("container-close", move || -> CacheResult<()> {
            file.sync_all()?;
            if !staging_path.exists() {
                return Ok(());
            }
            fs::rename(&staging_path, &committed_path)?;
            if let Some(parent) = committed_path.parent() {
                let dir = File::open(parent)?;
                dir.sync_all()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_close_reopen_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::new(dir.path());

        let container = store.open("a/b.txt").await.unwrap();
        container
            .write_at(b"hello world".to_vec(), 0)
            .await
            .unwrap();
        container.fsync().await.unwrap();
        container.close().await.unwrap();

        let reopened = store.open("a/b.txt").await.unwrap();
        let bytes = reopened.read_at(vec![0u8; 5], 6).await.unwrap();
        assert_eq!(bytes, b"world");
    }

    #[tokio::test]
    async fn read_past_eof_is_short_not_error() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::new(dir.path());
        let container = store.open("x").await.unwrap();
        container.write_at(b"abc".to_vec(), 0).await.unwrap();

        let bytes = container.read_at(vec![0u8; 10], 0).await.unwrap();
        assert_eq!(bytes, b"abc");
    }

    #[tokio::test]
    async fn close_is_idempotent_across_reopen() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::new(dir.path());
        let container = store.open("x").await.unwrap();
        container.write_at(b"abc".to_vec(), 0).await.unwrap();
        container.close().await.unwrap();

        // Nothing left to rename; reopening and closing again must not error.
        let container = store.open("x").await.unwrap();
        container.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_escaping_root() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::new(dir.path());
        let err = store.open("../escape").await.unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
    }

    #[tokio::test]
    async fn uncommitted_write_does_not_touch_prior_version() {
        let dir = TempDir::new().unwrap();
        let store = ContainerStore::new(dir.path());

        let first = store.open("x").await.unwrap();
        first.write_at(b"version-1".to_vec(), 0).await.unwrap();
        first.close().await.unwrap();

        let second = store.open("x").await.unwrap();
        second.write_at(b"Y".to_vec(), 0).await.unwrap();
        // Drop without calling close(): committed content must be untouched.
        drop(second);

        let committed = fs::read(store.committed_path("x").unwrap()).unwrap();
        assert_eq!(committed, b"version-1");
    }
}
