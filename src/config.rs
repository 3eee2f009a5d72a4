/// Hard ceiling on table capacity. Needing to grow past this means the
/// keys are not spreading across buckets and growing further would only
/// hide a broken hash.
pub const MAX_CAPACITY: usize = 1 << 25;

/// Tuning knobs for a cuckoo set, fixed at construction.
///
/// The defaults are the ones the set was designed around; they are safe
/// for any workload. `threshold` is the soft per-cell cap below which an
/// insert lands directly, `probe_size` the hard cap beyond which a cell
/// never grows, and `relocation_limit` bounds the displacement rounds a
/// single insert may spend before falling back to a resize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Starting table size; rounded up to the next power of two.
    pub initial_capacity: usize,
    /// Direct-insert cap per cell.
    pub threshold: usize,
    /// Hard cap per cell.
    pub probe_size: usize,
    /// Displacement rounds per insert before forcing a resize.
    pub relocation_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_capacity: 16,
            threshold: 2,
            probe_size: 4,
            relocation_limit: 10,
        }
    }
}

impl Config {
    /// Rounded-up initial capacity.
    pub(crate) fn capacity(&self) -> usize {
        self.initial_capacity.next_power_of_two()
    }

    /// # Panics
    /// If the knobs are inconsistent: a zero capacity, a zero threshold,
    /// a `probe_size` below `threshold`, or an initial capacity beyond
    /// [`MAX_CAPACITY`].
    pub(crate) fn validate(&self) {
        assert!(self.initial_capacity >= 1, "initial capacity must be at least 1");
        assert!(self.threshold >= 1, "threshold must be at least 1");
        assert!(
            self.probe_size >= self.threshold,
            "probe size must be at least the threshold"
        );
        assert!(
            self.capacity() <= MAX_CAPACITY,
            "initial capacity exceeds the maximum table size"
        );
    }
}
