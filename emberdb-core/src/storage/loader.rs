//! Open-side persistence: metadata parsing, validation, and segment mapping

use super::{
    parse_segment_file, segment_counts_file, segment_data_file, Interval, Metadata, Segment,
    METADATA_FILE,
};
use crate::dimension::{DimensionSet, DimensionTable};
use crate::error::{EmberError, Result};
use crate::schema::RowLayout;
use crate::types::Timestamp;
use memmap2::MmapOptions;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything reconstructed from a database directory
pub struct LoadedDatabase {
    pub intervals: BTreeMap<Timestamp, Arc<Interval>>,
    pub dimensions: DimensionSet,
}

/// Load a disk-backed database. Returns `Ok(None)` when the directory holds
/// no metadata file (a fresh database). Validation failures are fatal
/// `Corruption` errors, except segment files whose generation does not match
/// the metadata, which are ignored with a warning.
pub fn load_database(dir: &Path, layout: &RowLayout) -> Result<Option<LoadedDatabase>> {
    let metadata_path = dir.join(METADATA_FILE);
    if !metadata_path.exists() {
        return Ok(None);
    }
    let raw = fs::read(&metadata_path)?;
    let metadata: Metadata = serde_json::from_slice(&raw)
        .map_err(|e| EmberError::Corruption(format!("invalid metadata file: {}", e)))?;

    if metadata.schema != layout.schema {
        return Err(EmberError::SchemaMismatch(
            "stored schema does not match the schema the database was opened with".into(),
        ));
    }

    let mut dimensions = DimensionSet::new(&layout.schema.dimension_columns);
    for (i, col) in layout.schema.dimension_columns.iter().enumerate() {
        if !col.string_backed {
            continue;
        }
        let file = metadata.dimension_files.get(&col.name).ok_or_else(|| {
            EmberError::Corruption(format!(
                "metadata lists no dimension file for column {:?}",
                col.name
            ))
        })?;
        let data = fs::read(dir.join(file)).map_err(|e| {
            EmberError::Corruption(format!("cannot read dimension file {:?}: {}", file, e))
        })?;
        dimensions.restore(i, DimensionTable::decode(col.name.clone(), col.ty, &data)?);
    }

    let rows_per_segment = layout.rows_per_segment();
    let mut intervals = BTreeMap::new();
    for im in &metadata.intervals {
        let expected_segments = (im.rows + rows_per_segment - 1) / rows_per_segment;
        if im.segments != expected_segments || im.rows == 0 {
            return Err(EmberError::Corruption(format!(
                "interval {} claims {} segments for {} rows",
                im.start, im.segments, im.rows
            )));
        }
        let mut segments = Vec::with_capacity(im.segments);
        for idx in 0..im.segments {
            let rows = (im.rows - idx * rows_per_segment).min(rows_per_segment);
            let data = map_validated(
                &dir.join(segment_data_file(im.start, im.generation, idx)),
                rows * layout.row_width,
            )?;
            let counts = map_validated(
                &dir.join(segment_counts_file(im.start, im.generation, idx)),
                rows * 4,
            )?;
            segments.push(Segment::mapped(data, counts, rows));
        }
        intervals.insert(
            im.start,
            Arc::new(Interval {
                start: im.start,
                generation: im.generation,
                segments,
                rows: im.rows,
            }),
        );
    }

    warn_about_stale_files(dir, &intervals);

    let total_rows: usize = intervals.values().map(|i| i.rows).sum();
    info!(
        intervals = intervals.len(),
        rows = total_rows,
        "loaded database from {:?}",
        dir
    );
    Ok(Some(LoadedDatabase {
        intervals,
        dimensions,
    }))
}

fn map_validated(path: &Path, expected_len: usize) -> Result<memmap2::Mmap> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EmberError::Corruption(format!("missing segment file {:?}", path))
        } else {
            EmberError::Io(e)
        }
    })?;
    let len = file.metadata()?.len();
    if len != expected_len as u64 {
        return Err(EmberError::Corruption(format!(
            "segment file {:?} is {} bytes, expected {}",
            path, len, expected_len
        )));
    }
    Ok(unsafe { MmapOptions::new().map(&file)? })
}

/// Segment files whose generation does not match the metadata are leftovers
/// from an interrupted flush; they are ignored, not treated as corruption.
fn warn_about_stale_files(dir: &Path, intervals: &BTreeMap<Timestamp, Arc<Interval>>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(parsed) = parse_segment_file(&name.to_string_lossy()) else {
            continue;
        };
        let current = intervals.get(&parsed.t0).map(|i| i.generation);
        if current != Some(parsed.generation) {
            warn!(
                "ignoring segment file {:?} from generation {} (current: {:?})",
                name, parsed.generation, current
            );
        }
    }
}
