//! Durable data model for the cache index: `FileMeta`, `ChunkMeta`,
//! `UploadRecord` and the process-wide `Stats` counters (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A contiguous byte range backed on local disk.
///
/// Invariant (enforced by `FileMeta::merge_chunk`, never by this type
/// alone): within a `FileMeta`, chunks are disjoint and offset-sorted, and a
/// chunk is either entirely dirty or entirely clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub offset: u64,
    pub length: u64,
    pub dirty: bool,
}

impl ChunkMeta {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// One per cached object path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: String,
    pub etag: String,
    pub size: u64,
    pub chunks: Vec<ChunkMeta>,
    pub mtime_remote: DateTime<Utc>,
    pub atime_local: DateTime<Utc>,
}

impl FileMeta {
    pub fn new(path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            path: path.into(),
            etag: String::new(),
            size: 0,
            chunks: Vec::new(),
            mtime_remote: now,
            atime_local: now,
        }
    }

    /// Merge a freshly written range into the chunk list, coalescing
    /// adjacent/overlapping chunks into one (spec §9, "Merging of
    /// overlapping ChunkMetas on write").
    ///
    /// A dirty write absorbs any chunk it touches, clean or dirty alike —
    /// the new bytes are now the authoritative content for that span. A
    /// clean write (a read-miss fill) must never clobber bytes that are
    /// still dirty, so it is first clipped to the sub-ranges not already
    /// covered by a dirty chunk, and only those sub-ranges are merged.
    pub fn merge_chunk(&mut self, offset: u64, length: u64, dirty: bool) {
        if length == 0 {
            return;
        }
        self.size = self.size.max(offset + length);

        if dirty {
            self.merge_run(offset, length, true, true);
            return;
        }

        let end = offset + length;
        let mut dirty_ranges: Vec<(u64, u64)> = self
            .chunks
            .iter()
            .filter(|c| c.dirty && c.offset < end && c.end() > offset)
            .map(|c| (c.offset.max(offset), c.end().min(end)))
            .collect();
        dirty_ranges.sort_unstable();

        let mut cursor = offset;
        for (d_start, d_end) in dirty_ranges {
            if cursor < d_start {
                self.merge_run(cursor, d_start - cursor, false, false);
            }
            cursor = cursor.max(d_end);
        }
        if cursor < end {
            self.merge_run(cursor, end - cursor, false, false);
        }
    }

    /// Insert `[offset, offset+length)` with the given `dirty` flag,
    /// absorbing any touching chunk (any chunk at all when `absorb_any`,
    /// otherwise only chunks with a matching dirty flag).
    fn merge_run(&mut self, offset: u64, length: u64, dirty: bool, absorb_any: bool) {
        if length == 0 {
            return;
        }
        let mut merged_offset = offset;
        let mut merged_end = offset + length;

        let mut kept = Vec::with_capacity(self.chunks.len() + 1);
        for chunk in self.chunks.drain(..) {
            let touches = chunk.offset <= merged_end && merged_offset <= chunk.end();
            if touches && (absorb_any || chunk.dirty == dirty) {
                merged_offset = merged_offset.min(chunk.offset);
                merged_end = merged_end.max(chunk.end());
            } else {
                kept.push(chunk);
            }
        }

        kept.push(ChunkMeta {
            offset: merged_offset,
            length: merged_end - merged_offset,
            dirty,
        });
        kept.sort_by_key(|c| c.offset);
        self.chunks = kept;
    }

    pub fn has_dirty_chunk(&self) -> bool {
        self.chunks.iter().any(|c| c.dirty)
    }

    /// Clear the dirty flag on the chunk exactly covering `[offset, offset+length)`.
    /// No-op if no such chunk exists (it may already have been merged away).
    pub fn clear_dirty(&mut self, offset: u64, length: u64) {
        for chunk in self.chunks.iter_mut() {
            if chunk.offset == offset && chunk.length == length {
                chunk.dirty = false;
            }
        }
    }

    /// Mark every chunk overlapping `[offset, offset+length)` as failed/terminal
    /// dirty state cleared (used by `invalidate`).
    pub fn drop_range(&mut self, offset: u64, length: u64) {
        let end = offset + length;
        self.chunks
            .retain(|c| c.end() <= offset || c.offset >= end);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
}

/// One per queued/in-progress chunk upload (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: u64,
    pub path: String,
    pub offset: u64,
    pub length: u64,
    pub status: UploadStatus,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(path: impl Into<String>, offset: u64, length: u64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            path: path.into(),
            offset,
            length,
            status: UploadStatus::Queued,
            attempts: 0,
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Observed retry count per spec §4.3: every status transition increments
    /// `attempts`, so the retry count is `attempts / 2`.
    pub fn observed_retries(&self) -> u32 {
        self.attempts / 2
    }
}

/// Process-wide persistent counters (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub schema_version: u32,
    pub upload_seq: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            schema_version: crate::index::CURRENT_SCHEMA_VERSION,
            upload_seq: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adjacent_dirty_chunks() {
        let mut meta = FileMeta::new("a");
        meta.merge_chunk(0, 4, true);
        meta.merge_chunk(4, 4, true);
        assert_eq!(meta.chunks.len(), 1);
        assert_eq!(meta.chunks[0].offset, 0);
        assert_eq!(meta.chunks[0].length, 8);
        assert!(meta.chunks[0].dirty);
    }

    #[test]
    fn dirty_write_absorbs_clean_neighbor() {
        let mut meta = FileMeta::new("a");
        meta.merge_chunk(0, 4, false);
        meta.merge_chunk(2, 4, true);
        assert_eq!(meta.chunks.len(), 1);
        assert!(meta.chunks[0].dirty);
        assert_eq!(meta.chunks[0].offset, 0);
        assert_eq!(meta.chunks[0].length, 6);
    }

    #[test]
    fn disjoint_chunks_stay_separate() {
        let mut meta = FileMeta::new("a");
        meta.merge_chunk(0, 4, true);
        meta.merge_chunk(100, 4, true);
        assert_eq!(meta.chunks.len(), 2);
    }

    #[test]
    fn observed_retries_halves_attempts() {
        let mut rec = UploadRecord::new("a", 0, 4);
        rec.attempts = 3;
        assert_eq!(rec.observed_retries(), 1);
        rec.attempts = 4;
        assert_eq!(rec.observed_retries(), 2);
    }
}
