//! Contiguous staging for nested descriptor arrays.
//!
//! Native create calls take structures pointing into variable-length arrays
//! (attachment references per subpass, specialization entries per stage,
//! buffer infos per descriptor write). Those arrays are copied into a single
//! store sized up front, with a running cursor handing out one range per run.
//! The store never grows past its declared total, so slices taken from the
//! frozen [`Flattened`] stay valid for the whole native call.

use std::ops::Range;

use crate::error::{RhiError, Result};

/// Pre-sized builder for a flattened array.
#[derive(Debug)]
pub struct FlatArena<T> {
    kind: &'static str,
    declared: usize,
    items: Vec<T>,
}

impl<T> FlatArena<T> {
    /// Create an arena that must receive exactly `declared` elements.
    pub fn with_declared_total(kind: &'static str, declared: usize) -> Self {
        Self {
            kind,
            declared,
            items: Vec::with_capacity(declared),
        }
    }

    /// Copy one run into the arena and return its range.
    pub fn push_run<I>(&mut self, run: I) -> Result<Range<usize>>
    where
        I: IntoIterator<Item = T>,
    {
        let start = self.items.len();
        for item in run {
            if self.items.len() == self.declared {
                return Err(RhiError::invalid(
                    self.kind,
                    format!(
                        "flattened array overflows its declared total of {}",
                        self.declared
                    ),
                ));
            }
            self.items.push(item);
        }
        Ok(start..self.items.len())
    }

    /// Copy a single element and return its index.
    pub fn push_one(&mut self, item: T) -> Result<usize> {
        self.push_run(std::iter::once(item)).map(|range| range.start)
    }

    /// Number of elements copied so far.
    pub fn cursor(&self) -> usize {
        self.items.len()
    }

    /// The total this arena was sized for.
    pub const fn declared_total(&self) -> usize {
        self.declared
    }

    /// Freeze the arena. Fails unless the cursor landed exactly on the
    /// declared total.
    pub fn finish(self) -> Result<Flattened<T>> {
        if self.items.len() != self.declared {
            return Err(RhiError::invalid(
                self.kind,
                format!(
                    "flattened {} elements but {} were declared",
                    self.items.len(),
                    self.declared
                ),
            ));
        }
        Ok(Flattened {
            items: self.items.into_boxed_slice(),
        })
    }
}

/// Frozen flattened array.
#[derive(Debug)]
pub struct Flattened<T> {
    items: Box<[T]>,
}

impl<T> Flattened<T> {
    /// Sub-slice previously returned by [`FlatArena::push_run`].
    pub fn slice(&self, range: Range<usize>) -> &[T] {
        &self.items[range]
    }

    /// Optional sub-slice; empty ranges map to `None`.
    pub fn slice_opt(&self, range: Range<usize>) -> Option<&[T]> {
        if range.is_empty() {
            None
        } else {
            Some(&self.items[range])
        }
    }

    /// Single element previously returned by [`FlatArena::push_one`].
    pub fn get(&self, index: usize) -> &T {
        &self.items[index]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_ends_at_sum_of_run_lengths() {
        let runs: [&[u32]; 3] = [&[1, 2], &[], &[3, 4, 5]];
        let total = runs.iter().map(|r| r.len()).sum();
        let mut arena = FlatArena::with_declared_total("test", total);

        let ranges: Vec<_> = runs
            .iter()
            .map(|run| arena.push_run(run.iter().copied()).unwrap())
            .collect();
        assert_eq!(arena.cursor(), 5);

        let flat = arena.finish().unwrap();
        assert_eq!(flat.slice(ranges[0].clone()), &[1, 2]);
        assert!(flat.slice_opt(ranges[1].clone()).is_none());
        assert_eq!(flat.slice(ranges[2].clone()), &[3, 4, 5]);
        assert_eq!(flat.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn declared_total_above_sum_fails_on_finish() {
        let mut arena = FlatArena::with_declared_total("test", 4);
        arena.push_run([1u8, 2, 3]).unwrap();
        let err = arena.finish().unwrap_err();
        assert!(matches!(err, RhiError::InvalidDescriptor { kind: "test", .. }));
    }

    #[test]
    fn pushing_past_declared_total_fails() {
        let mut arena = FlatArena::with_declared_total("test", 2);
        arena.push_one(1u8).unwrap();
        assert!(arena.push_run([2u8, 3]).is_err());
    }

    #[test]
    fn storage_never_reallocates() {
        let mut arena = FlatArena::with_declared_total("test", 64);
        arena.push_one(0u64).unwrap();
        let base = arena.items.as_ptr();
        for i in 1..64 {
            arena.push_one(i).unwrap();
        }
        assert_eq!(arena.items.as_ptr(), base);
        assert_eq!(arena.finish().unwrap().len(), 64);
    }
}
