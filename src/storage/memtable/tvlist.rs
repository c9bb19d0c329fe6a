use crate::storage::data::{DataType, TimeValuePair, Value};

/// Append-only buffer of one series' points, kept in write order.
///
/// Reads go through a sorted index that is built on first use and dropped on
/// the next mutation. The index orders entries by timestamp with a stable
/// sort and keeps only the last-appended entry for each timestamp, so a later
/// write always shadows an earlier one at the same time.
#[derive(Debug, Clone)]
pub struct TvList {
    data_type: DataType,
    timestamps: Vec<i64>,
    values: Vec<Value>,
    /// Point-level deletion marks, parallel to `timestamps`
    deleted: Vec<bool>,
    /// Positions of live entries in ascending timestamp order
    sorted: Option<Vec<usize>>,
    /// Bytes held by text payloads
    text_bytes: usize,
}

impl TvList {
    pub fn new(data_type: DataType) -> Self {
        Self::with_capacity(data_type, 0)
    }

    pub fn with_capacity(data_type: DataType, capacity: usize) -> Self {
        Self {
            data_type,
            timestamps: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            deleted: Vec::with_capacity(capacity),
            sorted: None,
            text_bytes: 0,
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Appends a point. Call order does not need to follow timestamp order.
    /// A value of a different kind is handed back untouched.
    pub fn append(&mut self, timestamp: i64, value: Value) -> Result<(), Value> {
        if value.data_type() != self.data_type {
            return Err(value);
        }
        if let Value::Text(text) = &value {
            self.text_bytes += text.len();
        }
        self.timestamps.push(timestamp);
        self.values.push(value);
        self.deleted.push(false);
        self.sorted = None;
        Ok(())
    }

    /// Number of appended entries, including shadowed and deleted ones
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Marks every entry currently stored at `timestamp` as deleted.
    /// Entries appended afterwards at the same timestamp stay visible.
    pub fn delete(&mut self, timestamp: i64) -> usize {
        let mut marked = 0;
        for (ts, deleted) in self.timestamps.iter().zip(self.deleted.iter_mut()) {
            if *ts == timestamp && !*deleted {
                *deleted = true;
                marked += 1;
            }
        }
        if marked > 0 {
            self.sorted = None;
        }
        marked
    }

    /// Builds the sorted index if a mutation invalidated it
    pub fn sort(&mut self) {
        if self.sorted.is_some() {
            return;
        }
        let mut order: Vec<usize> = (0..self.timestamps.len()).collect();
        order.sort_by_key(|&i| self.timestamps[i]);

        let mut live = Vec::with_capacity(order.len());
        for (rank, &index) in order.iter().enumerate() {
            let shadowed = order
                .get(rank + 1)
                .is_some_and(|&next| self.timestamps[next] == self.timestamps[index]);
            if !shadowed && !self.deleted[index] {
                live.push(index);
            }
        }
        self.sorted = Some(live);
    }

    /// Iterates live points in ascending timestamp order. The iterator can be
    /// recreated at will; the sort is only recomputed after a mutation.
    pub fn sorted_iter(&mut self) -> SortedIter<'_> {
        self.sort();
        SortedIter { list: self, rank: 0 }
    }

    /// Number of live points, or `None` before [`TvList::sort`]
    pub fn sorted_len(&self) -> Option<usize> {
        self.sorted.as_ref().map(Vec::len)
    }

    /// The live point at `rank` in timestamp order. Requires a prior sort.
    pub fn sorted_point(&self, rank: usize) -> Option<TimeValuePair> {
        let index = *self.sorted.as_ref()?.get(rank)?;
        Some(TimeValuePair::new(
            self.timestamps[index],
            self.values[index].clone(),
        ))
    }

    /// Timestamp of the live point at `rank`. Requires a prior sort.
    pub fn sorted_timestamp(&self, rank: usize) -> Option<i64> {
        let index = *self.sorted.as_ref()?.get(rank)?;
        Some(self.timestamps[index])
    }

    /// Estimated heap footprint, measured by capacity rather than length
    pub fn byte_size(&self) -> usize {
        let per_entry = std::mem::size_of::<i64>() + self.data_type.element_size() + 1;
        self.timestamps.capacity().max(self.values.capacity()) * per_entry + self.text_bytes
    }

    /// Drops all points but keeps the allocated capacity for reuse
    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.values.clear();
        self.deleted.clear();
        self.sorted = None;
        self.text_bytes = 0;
    }
}

pub struct SortedIter<'a> {
    list: &'a TvList,
    rank: usize,
}

impl Iterator for SortedIter<'_> {
    type Item = TimeValuePair;

    fn next(&mut self) -> Option<Self::Item> {
        let point = self.list.sorted_point(self.rank)?;
        self.rank += 1;
        Some(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(list: &mut TvList) -> Vec<(i64, Value)> {
        list.sorted_iter()
            .map(|p| (p.timestamp(), p.value().clone()))
            .collect()
    }

    #[test]
    fn test_out_of_order_appends_are_sorted() {
        let mut list = TvList::new(DataType::Int64);
        for ts in [5, 1, 3, 2, 4] {
            list.append(ts, Value::Int64(ts * 10)).unwrap();
        }
        let timestamps: Vec<i64> = list.sorted_iter().map(|p| p.timestamp()).collect();
        assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_last_write_wins() {
        let mut list = TvList::new(DataType::Int32);
        list.append(1, Value::Int32(10)).unwrap();
        list.append(2, Value::Int32(20)).unwrap();
        list.append(1, Value::Int32(99)).unwrap();
        list.append(1, Value::Int32(7)).unwrap();

        assert_eq!(
            points(&mut list),
            vec![(1, Value::Int32(7)), (2, Value::Int32(20))]
        );
        assert_eq!(list.sorted_len(), Some(2));
    }

    #[test]
    fn test_sort_cache_invalidated_by_append() {
        let mut list = TvList::new(DataType::Int32);
        list.append(2, Value::Int32(2)).unwrap();
        assert_eq!(points(&mut list).len(), 1);
        // restartable
        assert_eq!(points(&mut list).len(), 1);

        list.append(1, Value::Int32(1)).unwrap();
        assert_eq!(list.sorted_len(), None);
        assert_eq!(
            points(&mut list),
            vec![(1, Value::Int32(1)), (2, Value::Int32(2))]
        );
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let mut list = TvList::new(DataType::Double);
        let rejected = list.append(1, Value::Int32(3));
        assert_eq!(rejected, Err(Value::Int32(3)));
        assert!(list.is_empty());
    }

    #[test]
    fn test_point_delete() {
        let mut list = TvList::new(DataType::Int32);
        list.append(1, Value::Int32(1)).unwrap();
        list.append(2, Value::Int32(2)).unwrap();
        list.append(2, Value::Int32(3)).unwrap();

        assert_eq!(list.delete(2), 2);
        assert_eq!(points(&mut list), vec![(1, Value::Int32(1))]);

        // a later write at a deleted timestamp is live again
        list.append(2, Value::Int32(4)).unwrap();
        assert_eq!(
            points(&mut list),
            vec![(1, Value::Int32(1)), (2, Value::Int32(4))]
        );
        assert_eq!(list.delete(42), 0);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut list = TvList::new(DataType::Int32);
        list.append(1, Value::Int32(1)).unwrap();
        let mut copy = list.clone();
        list.append(2, Value::Int32(2)).unwrap();

        assert_eq!(points(&mut copy).len(), 1);
        assert_eq!(points(&mut list).len(), 2);
    }

    #[test]
    fn test_byte_size_tracks_capacity() {
        let mut list = TvList::with_capacity(DataType::Int64, 16);
        let empty = list.byte_size();
        assert_eq!(empty, 16 * (8 + 8 + 1));
        list.append(1, Value::Int64(1)).unwrap();
        assert_eq!(list.byte_size(), empty);

        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.byte_size(), empty);
    }
}
