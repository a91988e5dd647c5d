//! Schema read/initialize/migrate for the `stats` bucket (spec §4.1,
//! "Schema and migration").
//!
//! There is only one schema version today; `run_migrations` exists so a
//! future version bump has somewhere to live without touching the open
//! path's control flow. Each migration step must be idempotent and create
//! any bucket it depends on, per the spec.

use crate::error::{CacheError, CacheResult};
use crate::model::Stats;

const STATS_KEY: &[u8] = b"stats";

pub fn read_schema_version(stats: &sled::Tree) -> CacheResult<Option<u32>> {
    Ok(read_stats(stats)?.map(|s| s.schema_version))
}

pub fn read_stats(stats: &sled::Tree) -> CacheResult<Option<Stats>> {
    match stats
        .get(STATS_KEY)
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?
    {
        Some(bytes) => {
            let stats: Stats =
                bincode::deserialize(&bytes).map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
            Ok(Some(stats))
        }
        None => Ok(None),
    }
}

pub fn write_stats(stats: &sled::Tree, value: &Stats) -> CacheResult<()> {
    let encoded = bincode::serialize(value).map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
    stats
        .insert(STATS_KEY, encoded)
        .map_err(|e| CacheError::Io(std::io::Error::other(e)))?;
    Ok(())
}

/// Run every migration step from `found` up to (and including) `target`,
/// in order. Returns the `Stats` record left behind by the final step.
pub fn run_migrations(stats: &sled::Tree, found: u32, target: u32) -> CacheResult<Stats> {
    let mut version = found;
    while version < target {
        match version {
            // No prior schema versions exist yet; this arm is reserved for
            // the first future migration (e.g. `0 => migrate_v0_to_v1`).
            _ => {
                return Err(CacheError::UnknownSchema {
                    found: version,
                    expected: target,
                });
            }
        }
    }
    read_stats(stats)?.ok_or_else(|| {
        CacheError::Io(std::io::Error::other("migration left stats bucket empty"))
    })
}
