// This implementation is based on the Java version
// https://github.com/dynatrace-oss/hash4j/
// See the paper "UltraLogLog: A Practical and More Space-Efficient Alternative to HyperLogLog for Approximate Distinct Counting"

//! Approximate distinct counting with [`HyperLogLog`] and [`UltraLogLog`] sketches.
//!
//! Both sketches consume 64-bit hash values, can be merged and downsized, and expose their state
//! as a plain byte array. Estimates are computed on demand by one of several estimators, or
//! incrementally by a [`MartingaleEstimator`] observing the insertions.
//!
//! ```
//! use distinct_count::{DistinctCounter, UltraLogLog};
//!
//! let mut sketch = UltraLogLog::new(12)?;
//! for word in ["apple", "banana", "apple", "cherry"] {
//!     sketch.add_value(word);
//! }
//! assert!((sketch.distinct_count_estimate() - 3.0).abs() < 0.1);
//! # Ok::<(), distinct_count::Error>(())
//! ```

mod error;
mod hyperloglog;
mod martingale;
mod packed_array;
mod ultraloglog;
pub mod util;

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

pub use error::{Error, Result};
pub use hyperloglog::{HyperLogLog, HyperLogLogEstimator};
pub use martingale::{MartingaleEstimator, StateChangeObserver};
pub use packed_array::PackedRegisterArray;
pub use ultraloglog::{UltraLogLog, UltraLogLogEstimator};
pub use util::{compute_token, reconstruct_hash};

/// Observer for insertions that are not tracked.
pub(crate) struct NoopObserver;

impl StateChangeObserver for NoopObserver {
    fn state_changed(&mut self, _: u64) {}
}

/// A distinct count estimation algorithm for sketches of type `S`.
pub trait Estimator<S>: Copy + fmt::Debug + 'static {
    /// Every estimator available for `S`.
    const ALL: &'static [Self];

    fn estimate(&self, sketch: &S) -> f64;

    /// Asymptotic relative standard error for precision parameter `p`.
    fn relative_standard_error(&self, p: u32) -> f64;
}

/// Operations shared by [`HyperLogLog`] and [`UltraLogLog`].
///
/// The sketches implement the core operations as inherent methods as well. The value hashing,
/// token and merge conveniences are provided here, so this trait has to be in scope to use them.
pub trait DistinctCounter: Clone + Sized {
    type Estimator: Estimator<Self> + Default;

    const MIN_P: u32;
    const MAX_P: u32;

    /// Creates an empty sketch with precision parameter `p`.
    fn new(p: u32) -> Result<Self>;

    /// Adopts a serialized state without copying it.
    fn wrap(state: Vec<u8>) -> Result<Self>;

    /// Number of state bytes for precision parameter `p`.
    fn state_length(p: u32) -> usize;

    fn p(&self) -> u32;

    fn state(&self) -> &[u8];

    fn into_state(self) -> Vec<u8>;

    fn is_empty(&self) -> bool;

    fn reset(&mut self) -> &mut Self;

    fn add_with_observer<O: StateChangeObserver>(
        &mut self,
        hash_value: u64,
        observer: Option<&mut O>,
    ) -> &mut Self;

    /// Merges `other` into this sketch. Fails if `other` has a smaller precision parameter.
    fn add_sketch(&mut self, other: &Self) -> Result<&mut Self>;

    fn state_change_probability(&self) -> f64;

    fn martingale_relative_standard_error(p: u32) -> f64;

    /// Adds an element represented by a 64-bit hash value.
    fn add(&mut self, hash_value: u64) -> &mut Self {
        self.add_with_observer::<NoopObserver>(hash_value, None)
    }

    fn add_with_martingale(
        &mut self,
        hash_value: u64,
        martingale: &mut MartingaleEstimator,
    ) -> &mut Self {
        self.add_with_observer(hash_value, Some(martingale))
    }

    /// Adds an element represented by a token from [`compute_token`].
    fn add_token(&mut self, token: u32) -> &mut Self {
        self.add(reconstruct_hash(token))
    }

    fn add_token_with_observer<O: StateChangeObserver>(
        &mut self,
        token: u32,
        observer: Option<&mut O>,
    ) -> &mut Self {
        self.add_with_observer(reconstruct_hash(token), observer)
    }

    fn add_token_with_martingale(
        &mut self,
        token: u32,
        martingale: &mut MartingaleEstimator,
    ) -> &mut Self {
        self.add_with_observer(reconstruct_hash(token), Some(martingale))
    }

    /// Hashes `value` with xxh3-64 and adds it.
    fn add_value<T: Hash>(&mut self, value: T) -> &mut Self {
        self.add(xxh3_hash(value))
    }

    /// Hashes `value` with a hasher built by `build_hasher` and adds it.
    fn add_value_with_build_hasher<T, S>(&mut self, value: T, build_hasher: &S) -> &mut Self
    where
        T: Hash,
        S: BuildHasher + ?Sized,
    {
        // one fresh hasher per call
        let mut hasher = build_hasher.build_hasher();
        value.hash(&mut hasher);
        self.add(hasher.finish())
    }

    /// If `build_hasher` is `None` the value is hashed with xxh3-64.
    fn add_value_with<T, S>(&mut self, value: T, build_hasher: Option<&S>) -> &mut Self
    where
        T: Hash,
        S: BuildHasher + ?Sized,
    {
        match build_hasher {
            Some(build_hasher) => self.add_value_with_build_hasher(value, build_hasher),
            None => self.add_value(value),
        }
    }

    /// Same as [`Self::add_value`] but notifies a [`StateChangeObserver`].
    fn add_value_with_observer<T, O>(&mut self, value: T, observer: Option<&mut O>) -> &mut Self
    where
        T: Hash,
        O: StateChangeObserver,
    {
        self.add_with_observer(xxh3_hash(value), observer)
    }

    /// Merges two sketches into a new one with the smaller of both precision parameters.
    fn merge(sketch1: &Self, sketch2: &Self) -> Result<Self> {
        let (smaller, larger) = if sketch1.p() <= sketch2.p() {
            (sketch1, sketch2)
        } else {
            (sketch2, sketch1)
        };
        let mut result = smaller.copy();
        result.add_sketch(larger)?;
        Ok(result)
    }

    /// Returns a copy with precision parameter `min(p, self.p())`.
    ///
    /// The result equals the sketch obtained by adding the same elements to an empty sketch with
    /// that precision parameter.
    fn downsize(&self, p: u32) -> Result<Self> {
        util::check_precision_parameter(p, Self::MIN_P, Self::MAX_P)?;
        if p >= self.p() {
            Ok(self.copy())
        } else {
            let mut downsized = Self::new(p)?;
            downsized.add_sketch(self)?;
            Ok(downsized)
        }
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    /// Estimate of the default estimator.
    fn distinct_count_estimate(&self) -> f64 {
        Self::Estimator::default().estimate(self)
    }

    fn distinct_count_estimate_with(&self, estimator: Self::Estimator) -> f64 {
        estimator.estimate(self)
    }
}

fn xxh3_hash<T: Hash>(value: T) -> u64 {
    let mut hasher = Xxh3::default();
    value.hash(&mut hasher);
    hasher.finish()
}
