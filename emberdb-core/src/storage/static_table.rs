//! StaticTable: the immutable snapshot visible to queries

use super::Interval;
use crate::dimension::DimensionSnapshot;
use crate::schema::RowLayout;
use crate::types::{TimeRange, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The published snapshot of the whole database: a sorted map from bucket
/// start to interval, the dimension tables frozen at flush time, and the
/// compiled schema. Produced by flush, never mutated in place. Readers hold
/// an `Arc` to it; flush waits for the previous snapshot's readers to drain
/// before unlinking superseded files.
#[derive(Debug)]
pub struct StaticTable {
    pub layout: Arc<RowLayout>,
    pub intervals: BTreeMap<Timestamp, Arc<Interval>>,
    pub dimensions: DimensionSnapshot,
}

impl StaticTable {
    /// An empty snapshot for a freshly opened database
    pub fn empty(layout: Arc<RowLayout>) -> Self {
        let dimensions = DimensionSnapshot::empty(&layout.schema.dimension_columns);
        Self {
            layout,
            intervals: BTreeMap::new(),
            dimensions,
        }
    }

    /// Total stored (collapsed) rows
    pub fn row_count(&self) -> usize {
        self.intervals.values().map(|i| i.rows).sum()
    }

    /// Bucket start of the oldest interval
    pub fn oldest_interval(&self) -> Option<Timestamp> {
        self.intervals.keys().next().copied()
    }

    /// Intervals whose time window overlaps the given range, oldest first
    pub fn intervals_in_range(&self, range: Option<TimeRange>) -> Vec<Arc<Interval>> {
        let duration = self.layout.interval_duration();
        self.intervals
            .values()
            .filter(|interval| match range {
                Some(range) => range.overlaps_interval(interval.start, duration),
                None => true,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ColumnType;
    use crate::memtable::StagedRow;
    use crate::schema::{MetricColumn, Schema};

    fn table_with_intervals(starts: &[Timestamp]) -> StaticTable {
        let schema = Schema::new("at", 3600).metric(MetricColumn::new("m", ColumnType::U32));
        let layout = Arc::new(RowLayout::new(schema).unwrap());
        let row_width = layout.row_width;
        let mut table = StaticTable::empty(layout);
        for &start in starts {
            let rows = vec![StagedRow {
                row: vec![0; row_width],
                count: 1,
            }];
            table.intervals.insert(
                start,
                Arc::new(Interval::build(start, 0, rows, row_width, 16)),
            );
        }
        table
    }

    #[test]
    fn test_intervals_in_range() {
        let table = table_with_intervals(&[0, 3600, 7200]);
        assert_eq!(table.intervals_in_range(None).len(), 3);

        let hit: Vec<Timestamp> = table
            .intervals_in_range(Some(TimeRange::new(3600, 3700)))
            .iter()
            .map(|i| i.start)
            .collect();
        assert_eq!(hit, vec![3600]);

        // A range ending just inside the first interval still selects it.
        let hit = table.intervals_in_range(Some(TimeRange::new(0, 10)));
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].start, 0);
    }

    #[test]
    fn test_oldest_interval_and_row_count() {
        let table = table_with_intervals(&[7200, 0]);
        assert_eq!(table.oldest_interval(), Some(0));
        assert_eq!(table.row_count(), 2);
    }
}
