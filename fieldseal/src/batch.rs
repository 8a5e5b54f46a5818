//! Per-item outcomes of bulk operations.

use crate::error::Error;

/// Ordered results of a bulk operation, one per input item.
///
/// A failed item never hides the others: an empty `BatchResult` only ever
/// means the input was empty.
#[derive(Debug)]
pub struct BatchResult<T> {
    items: Vec<Result<T, Error>>,
}

impl<T> BatchResult<T> {
    /// Wraps per-item results.
    #[must_use]
    pub const fn new(items: Vec<Result<T, Error>>) -> Self {
        Self { items }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if there are no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns `true` if every item succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.items.iter().all(Result::is_ok)
    }

    /// Per-item results in input order.
    #[must_use]
    pub fn items(&self) -> &[Result<T, Error>] {
        &self.items
    }

    /// Successful values, in input order.
    pub fn successes(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|r| r.as_ref().ok())
    }

    /// Failed items with their input positions.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &Error)> {
        self.items.iter().enumerate().filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }

    /// Number of failed items.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.items.iter().filter(|r| r.is_err()).count()
    }

    /// Unwraps into the per-item results.
    #[must_use]
    pub fn into_items(self) -> Vec<Result<T, Error>> {
        self.items
    }

    /// Collapses into all values, or the first error.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failed item.
    pub fn into_result(self) -> Result<Vec<T>, Error> {
        self.items.into_iter().collect()
    }

    /// Applies a fallible conversion to every successful item.
    #[must_use]
    pub fn and_then<U>(self, mut f: impl FnMut(T) -> Result<U, Error>) -> BatchResult<U> {
        BatchResult::new(self.items.into_iter().map(|r| r.and_then(&mut f)).collect())
    }
}

impl<T> IntoIterator for BatchResult<T> {
    type Item = Result<T, Error>;
    type IntoIter = std::vec::IntoIter<Result<T, Error>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<T> FromIterator<Result<T, Error>> for BatchResult<T> {
    fn from_iter<I: IntoIterator<Item = Result<T, Error>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
