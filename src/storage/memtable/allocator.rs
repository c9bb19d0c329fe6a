use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use super::tvlist::TvList;
use super::MemTableError;
use crate::metrics;
use crate::storage::data::DataType;

#[derive(Debug, Default)]
struct AllocatorState {
    /// Cleared lists waiting for reuse, per value kind
    free: HashMap<DataType, Vec<TvList>>,
    /// Lists handed out and not yet released
    outstanding: usize,
}

/// Pool of [`TvList`] buffers shared by every memtable of one engine.
///
/// The pool bounds how many lists may be live at once; once the bound is
/// reached allocation fails instead of falling back to unpooled buffers.
#[derive(Debug)]
pub struct TvListAllocator {
    initial_capacity: usize,
    max_outstanding: usize,
    state: Mutex<AllocatorState>,
}

impl TvListAllocator {
    pub fn new(initial_capacity: usize, max_outstanding: usize) -> Self {
        Self {
            initial_capacity,
            max_outstanding,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Hands out an empty list for `data_type`, reusing a released one when possible
    pub fn allocate(&self, data_type: DataType) -> Result<TvList, MemTableError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.outstanding >= self.max_outstanding {
            return Err(MemTableError::ResourceExhausted {
                data_type,
                limit: self.max_outstanding,
            });
        }
        let list = state
            .free
            .get_mut(&data_type)
            .and_then(Vec::pop)
            .unwrap_or_else(|| TvList::with_capacity(data_type, self.initial_capacity));
        state.outstanding += 1;
        metrics::update_outstanding_tvlists(state.outstanding);
        Ok(list)
    }

    /// Takes a list back. Its contents are discarded; its capacity is kept.
    pub fn release(&self, mut list: TvList) {
        list.clear();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.outstanding = state.outstanding.saturating_sub(1);
        metrics::update_outstanding_tvlists(state.outstanding);
        debug!(
            "Released TVList: type={}, outstanding={}",
            list.data_type(),
            state.outstanding
        );
        state.free.entry(list.data_type()).or_default().push(list);
    }

    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outstanding
    }

    /// Number of released lists ready for reuse
    pub fn pooled(&self, data_type: DataType) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free
            .get(&data_type)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data::Value;

    #[test]
    fn test_allocate_and_reuse() {
        let allocator = TvListAllocator::new(32, 4);
        let mut list = allocator.allocate(DataType::Int64).unwrap();
        assert_eq!(allocator.outstanding(), 1);
        list.append(1, Value::Int64(1)).unwrap();
        let capacity_bytes = list.byte_size();

        allocator.release(list);
        assert_eq!(allocator.outstanding(), 0);
        assert_eq!(allocator.pooled(DataType::Int64), 1);

        let reused = allocator.allocate(DataType::Int64).unwrap();
        assert!(reused.is_empty());
        assert_eq!(reused.byte_size(), capacity_bytes);
        assert_eq!(allocator.pooled(DataType::Int64), 0);
    }

    #[test]
    fn test_pools_are_per_kind() {
        let allocator = TvListAllocator::new(8, 4);
        let list = allocator.allocate(DataType::Boolean).unwrap();
        allocator.release(list);

        let other = allocator.allocate(DataType::Text).unwrap();
        assert_eq!(other.data_type(), DataType::Text);
        assert_eq!(allocator.pooled(DataType::Boolean), 1);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let allocator = TvListAllocator::new(8, 2);
        let _a = allocator.allocate(DataType::Int32).unwrap();
        let b = allocator.allocate(DataType::Int32).unwrap();
        assert!(matches!(
            allocator.allocate(DataType::Int32),
            Err(MemTableError::ResourceExhausted { limit: 2, .. })
        ));

        allocator.release(b);
        assert!(allocator.allocate(DataType::Int32).is_ok());
    }
}
