//! Restores source order over an out-of-order result stream.

use std::collections::BTreeMap;

/// Buffer that re-sequences `(index, value)` records into index order.
///
/// Workers finish items in whatever order the transforms complete; when
/// ordered output is requested, the consumer pushes each record through this
/// buffer and only emits what is next in line. Records arriving early are
/// deferred; the deferred map is bounded by the worker fan-out, since a
/// worker cannot run ahead of the slowest outstanding item by more than the
/// pool size.
#[derive(Debug)]
pub(crate) struct ReorderBuffer<V> {
    next_to_emit: u64,
    deferred: BTreeMap<u64, V>,
}

impl<V> ReorderBuffer<V> {
    pub(crate) fn new() -> Self {
        Self {
            next_to_emit: 0,
            deferred: BTreeMap::new(),
        }
    }

    /// Accepts one record and returns every record that is now ready, in
    /// index order.
    ///
    /// Indices are unique by construction; a duplicate means a worker bug.
    pub(crate) fn push(&mut self, index: u64, value: V) -> Vec<V> {
        debug_assert!(
            index >= self.next_to_emit && !self.deferred.contains_key(&index),
            "duplicate index {index} pushed into reorder buffer"
        );
        if index != self.next_to_emit {
            self.deferred.insert(index, value);
            return Vec::new();
        }

        let mut ready = vec![value];
        self.next_to_emit += 1;
        while let Some(value) = self.deferred.remove(&self.next_to_emit) {
            ready.push(value);
            self.next_to_emit += 1;
        }
        ready
    }

    /// Drains everything still deferred, in index order.
    ///
    /// Called when the upstream closes. Gaps at this point belong to items
    /// that failed or were dropped, so they are skipped rather than waited
    /// on.
    pub(crate) fn finish(self) -> Vec<V> {
        self.deferred.into_values().collect()
    }

    #[cfg(test)]
    fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}
