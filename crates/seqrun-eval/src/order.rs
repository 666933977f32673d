//! Reconstruct input order from records completed out of order.

use std::collections::BTreeMap;

use seqrun_core::{Result, RunnerError};

/// Destination of released records.
pub trait RecordSink<T> {
    fn write(&mut self, record: T) -> Result<()>;
}

impl<T> RecordSink<T> for Vec<T> {
    fn write(&mut self, record: T) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

impl<T, S: RecordSink<T> + ?Sized> RecordSink<T> for &mut S {
    fn write(&mut self, record: T) -> Result<()> {
        (**self).write(record)
    }
}

/// Buffers indexed records and releases the contiguous prefix to a sink.
///
/// Indices start at 0 unless built with [`OrderRestorer::starting_at`].
/// Pending records are unbounded: a record far ahead of the next expected
/// index stays buffered until the gap is filled.
pub struct OrderRestorer<T, S> {
    next_expected: usize,
    pending: BTreeMap<usize, T>,
    sink: S,
}

impl<T, S: RecordSink<T>> OrderRestorer<T, S> {
    pub fn new(sink: S) -> Self {
        Self::starting_at(0, sink)
    }

    pub fn starting_at(first_index: usize, sink: S) -> Self {
        Self {
            next_expected: first_index,
            pending: BTreeMap::new(),
            sink,
        }
    }

    /// Push `record` at `index` and release whatever became contiguous.
    /// Returns the number of records written to the sink.
    pub fn push(&mut self, index: usize, record: T) -> Result<usize> {
        if index < self.next_expected || self.pending.contains_key(&index) {
            return Err(RunnerError::DuplicateIndex {
                index,
                next_expected: self.next_expected,
            });
        }
        if index > self.next_expected {
            self.pending.insert(index, record);
            return Ok(0);
        }

        self.sink.write(record)?;
        self.next_expected += 1;
        let mut released = 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            self.sink.write(next)?;
            self.next_expected += 1;
            released += 1;
        }
        Ok(released)
    }

    pub fn next_expected(&self) -> usize {
        self.next_expected
    }

    /// Records waiting for an earlier index.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consume the restorer. Records still pending are dropped with a warning.
    pub fn into_sink(self) -> S {
        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                next_expected = self.next_expected,
                "Dropping records that never became contiguous"
            );
        }
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restores_order() -> Result<()> {
        let mut restorer = OrderRestorer::new(Vec::new());
        assert_eq!(restorer.push(2, "c")?, 0);
        assert_eq!(restorer.push(0, "a")?, 1);
        assert_eq!(restorer.pending_len(), 1);
        assert_eq!(restorer.push(1, "b")?, 2);
        assert_eq!(restorer.pending_len(), 0);
        assert_eq!(restorer.into_sink(), vec!["a", "b", "c"]);
        Ok(())
    }

    #[test]
    fn test_every_permutation_of_four() -> Result<()> {
        let mut order: Vec<usize> = (0..4).collect();
        let mut permutations = Vec::new();
        permute(&mut order, 0, &mut permutations);
        assert_eq!(permutations.len(), 24);
        for permutation in permutations {
            let mut restorer = OrderRestorer::new(Vec::new());
            for &index in &permutation {
                restorer.push(index, index)?;
            }
            assert_eq!(restorer.into_sink(), vec![0, 1, 2, 3], "order {:?}", permutation);
        }
        Ok(())
    }

    fn permute(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
        if k == items.len() {
            out.push(items.clone());
            return;
        }
        for i in k..items.len() {
            items.swap(k, i);
            permute(items, k + 1, out);
            items.swap(k, i);
        }
    }

    #[test]
    fn test_duplicate_indices() -> Result<()> {
        let mut restorer = OrderRestorer::new(Vec::new());
        restorer.push(0, 'a')?;
        let err = restorer.push(0, 'x').unwrap_err();
        assert!(matches!(
            err,
            RunnerError::DuplicateIndex { index: 0, next_expected: 1 }
        ));

        restorer.push(3, 'd')?;
        let err = restorer.push(3, 'y').unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateIndex { index: 3, .. }));
        assert_eq!(restorer.sink_mut().as_slice(), &['a']);
        Ok(())
    }

    #[test]
    fn test_starting_offset() -> Result<()> {
        let mut out = Vec::new();
        {
            let mut restorer = OrderRestorer::starting_at(10, &mut out);
            restorer.push(11, 11)?;
            assert!(restorer.push(9, 9).is_err());
            restorer.push(10, 10)?;
            assert_eq!(restorer.next_expected(), 12);
        }
        assert_eq!(out, vec![10, 11]);
        Ok(())
    }
}
