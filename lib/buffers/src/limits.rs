use snafu::{ensure, Snafu};

/// A pure function from an item to the amount it contributes to one batch
/// dimension, e.g. `|_| 1` for record counts or a serialized-size estimate
/// for byte counts.
pub type Counter<T> = Box<dyn Fn(&T) -> u64 + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum LimitsError {
    #[snafu(display(
        "number of limits ({limits}) does not match number of counters ({counters})"
    ))]
    LengthMismatch { limits: usize, counters: usize },

    #[snafu(display("at least one limit dimension is required"))]
    NoDimensions,

    #[snafu(display("limit for dimension {index} must be greater than zero"))]
    ZeroLimit { index: usize },
}

/// Accumulated counts for a batch under construction, tracked across N
/// parallel dimensions.
///
/// The contract mirrors how the batch collector and the batch queue fill
/// batches: callers ask `would_overflow` before adding, flush when it says
/// so, and `add` afterwards. A single item whose own counts exceed a limit
/// is still accepted into an empty batch, so after any `add` the bound
/// `counts[i] <= limits[i] + counters[i](item)` holds.
pub struct BatchLimits<T> {
    limits: Vec<u64>,
    counters: Vec<Counter<T>>,
    counts: Vec<u64>,
}

impl<T> BatchLimits<T> {
    pub fn new(limits: Vec<u64>, counters: Vec<Counter<T>>) -> Result<Self, LimitsError> {
        ensure!(!limits.is_empty(), NoDimensionsSnafu);
        ensure!(
            limits.len() == counters.len(),
            LengthMismatchSnafu {
                limits: limits.len(),
                counters: counters.len(),
            }
        );
        for (index, limit) in limits.iter().enumerate() {
            ensure!(*limit > 0, ZeroLimitSnafu { index });
        }

        let counts = vec![0; limits.len()];
        Ok(Self {
            limits,
            counters,
            counts,
        })
    }

    /// A single-dimension record-count limit, the common case.
    pub fn count_only(limit: u64) -> Self {
        Self::new(vec![limit], vec![Box::new(|_| 1)])
            .expect("single dimension limits are always valid")
    }

    /// Whether adding `item` would push any dimension past its limit.
    pub fn would_overflow(&self, item: &T) -> bool {
        self.counters
            .iter()
            .zip(self.counts.iter().zip(self.limits.iter()))
            .any(|(counter, (count, limit))| count + counter(item) > *limit)
    }

    /// Account for `item` in the running counts.
    pub fn add(&mut self, item: &T) {
        for (counter, count) in self.counters.iter().zip(self.counts.iter_mut()) {
            *count += counter(item);
        }
    }

    /// Whether any dimension has reached its limit.
    pub fn at_capacity(&self) -> bool {
        self.counts
            .iter()
            .zip(self.limits.iter())
            .any(|(count, limit)| count >= limit)
    }

    pub fn reset(&mut self) {
        for count in &mut self.counts {
            *count = 0;
        }
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts
    }
}

impl<T> std::fmt::Debug for BatchLimits<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLimits")
            .field("limits", &self.limits)
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}
