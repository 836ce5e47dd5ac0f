//! Intervals: time-bucketed row storage with generations

use super::Segment;
use crate::memtable::StagedRow;
use crate::types::Timestamp;

/// All rows whose timestamps fall in `[start, start + interval_duration)`,
/// stored in collation order across fixed-size segments. The generation
/// number identifies the current on-disk fileset and increases by one each
/// time the interval's segments are rewritten.
#[derive(Debug)]
pub struct Interval {
    pub start: Timestamp,
    pub generation: u64,
    pub segments: Vec<Segment>,
    pub rows: usize,
}

impl Interval {
    /// Build an interval from sorted rows, chunking into heap-backed
    /// segments of `rows_per_segment`
    pub fn build(
        start: Timestamp,
        generation: u64,
        rows: Vec<StagedRow>,
        row_width: usize,
        rows_per_segment: usize,
    ) -> Self {
        let total = rows.len();
        let mut segments = Vec::with_capacity((total + rows_per_segment - 1) / rows_per_segment);
        for chunk in rows.chunks(rows_per_segment) {
            let mut data = Vec::with_capacity(chunk.len() * row_width);
            let mut counts = Vec::with_capacity(chunk.len() * 4);
            for staged in chunk {
                data.extend_from_slice(&staged.row);
                counts.extend_from_slice(&staged.count.to_le_bytes());
            }
            segments.push(Segment::in_memory(data, counts, chunk.len()));
        }
        Self {
            start,
            generation,
            segments,
            rows: total,
        }
    }

    /// End of the interval's half-open time window
    pub fn end(&self, interval_duration: u32) -> u64 {
        self.start as u64 + interval_duration as u64
    }

    /// Iterate stored rows in collation order as (packed bytes, count)
    pub fn iter_rows(&self, row_width: usize) -> impl Iterator<Item = (&[u8], u32)> + '_ {
        self.segments.iter().flat_map(move |segment| {
            segment
                .data()
                .chunks_exact(row_width)
                .enumerate()
                .map(move |(i, row)| (row, segment.count(i)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(byte: u8, width: usize, count: u32) -> StagedRow {
        StagedRow {
            row: vec![byte; width],
            count,
        }
    }

    #[test]
    fn test_build_chunks_rows_into_segments() {
        let rows = (0..5).map(|i| staged(i, 8, i as u32 + 1)).collect();
        let interval = Interval::build(3600, 2, rows, 8, 2);
        assert_eq!(interval.rows, 5);
        assert_eq!(interval.segments.len(), 3);
        assert_eq!(interval.segments[0].rows(), 2);
        assert_eq!(interval.segments[2].rows(), 1);

        let collected: Vec<(u8, u32)> = interval
            .iter_rows(8)
            .map(|(row, count)| (row[0], count))
            .collect();
        assert_eq!(collected, vec![(0, 1), (1, 2), (2, 3), (3, 4), (4, 5)]);
    }

    #[test]
    fn test_end() {
        let interval = Interval::build(7200, 0, Vec::new(), 8, 2);
        assert_eq!(interval.end(3600), 10800);
    }
}
