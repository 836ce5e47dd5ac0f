//! Flush-side persistence: segment, dimension, and metadata files
//!
//! Files become visible in two steps: segment and dimension files are
//! written and fsynced first, then the metadata file is written to a
//! temporary name, fsynced, and renamed over the old one. A crash before the
//! rename leaves the previous metadata (and the previous generation's files)
//! intact; superseded files are unlinked only after the new snapshot is
//! installed.

use super::{
    segment_counts_file, segment_data_file, Interval, Metadata, Segment, METADATA_FILE,
    METADATA_TMP_FILE,
};
use crate::dimension::DimensionSnapshot;
use crate::error::Result;
use crate::schema::RowLayout;
use crate::types::Timestamp;
use memmap2::MmapOptions;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::warn;

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn map_readonly(path: &Path) -> Result<memmap2::Mmap> {
    let file = File::open(path)?;
    // Read-only map; the file is never written through the mapping.
    Ok(unsafe { MmapOptions::new().map(&file)? })
}

/// Write a heap-built interval's segments to their generation files, fsync
/// them, and return the interval re-backed by read-only mappings
pub fn write_interval(dir: &Path, interval: Interval) -> Result<Interval> {
    let mut mapped = Vec::with_capacity(interval.segments.len());
    for (idx, segment) in interval.segments.iter().enumerate() {
        let data_path = dir.join(segment_data_file(interval.start, interval.generation, idx));
        let counts_path = dir.join(segment_counts_file(interval.start, interval.generation, idx));
        write_synced(&data_path, segment.data())?;
        write_synced(&counts_path, segment.counts_bytes())?;
        mapped.push(Segment::mapped(
            map_readonly(&data_path)?,
            map_readonly(&counts_path)?,
            segment.rows(),
        ));
    }
    Ok(Interval {
        start: interval.start,
        generation: interval.generation,
        segments: mapped,
        rows: interval.rows,
    })
}

/// Write one file per string-backed dimension column (atomically, via a
/// temporary name) and return the column → file name map for the metadata
pub fn write_dimensions(
    dir: &Path,
    layout: &RowLayout,
    dimensions: &DimensionSnapshot,
) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for (i, dim) in layout.dims.iter().enumerate() {
        if !dim.string_backed {
            continue;
        }
        let name = super::dimension_file(&dim.name);
        let encoded = match dimensions.table(i) {
            Some(table) => table.encode(),
            None => Vec::new(),
        };
        let tmp = dir.join(format!("{}.tmp", name));
        write_synced(&tmp, &encoded)?;
        fs::rename(&tmp, dir.join(&name))?;
        files.insert(dim.name.clone(), name);
    }
    Ok(files)
}

/// Write the metadata file: temporary name, fsync, rename, directory fsync
pub fn write_metadata(dir: &Path, metadata: &Metadata) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(metadata)
        .map_err(|e| crate::EmberError::Corruption(format!("metadata serialization: {}", e)))?;
    let tmp = dir.join(METADATA_TMP_FILE);
    write_synced(&tmp, &encoded)?;
    fs::rename(&tmp, dir.join(METADATA_FILE))?;
    sync_dir(dir)?;
    Ok(())
}

/// Fsync a directory so renames and unlinks inside it are durable
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Unlink one generation's segment files. Best effort: a file that cannot be
/// removed is logged and left behind for the next open to ignore.
pub fn remove_generation(dir: &Path, t0: Timestamp, generation: u64, segments: usize) {
    for idx in 0..segments {
        for name in [
            segment_data_file(t0, generation, idx),
            segment_counts_file(t0, generation, idx),
        ] {
            let path = dir.join(&name);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove superseded segment file {:?}: {}", path, e);
                }
            }
        }
    }
}
