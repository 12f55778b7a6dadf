//! Module containing traits shared by every bounded type in this crate.

/// Provides common introspection methods across the limiter,
/// the ordered queue and both group flavors.
pub trait Bounded {
    /// The maximum number of operations that may be in flight at once.
    fn limit(&self) -> usize;

    /// The number of operations currently admitted.
    ///
    /// This is a snapshot: by the time it is returned, workers may
    /// already have been admitted or released.
    fn in_flight(&self) -> usize;

    /// How many more operations could be admitted right now.
    fn available(&self) -> usize {
        self.limit().saturating_sub(self.in_flight())
    }
}
