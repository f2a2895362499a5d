//! Martingale (historic inverse probability) estimation.
//!
//! A [`MartingaleEstimator`] that observes every insertion into a sketch yields slightly more
//! accurate estimates than the estimators working on the final sketch state. It only works for
//! non-distributed streams: merging sketches with
//! [`add_sketch`](crate::DistinctCounter::add_sketch) invalidates it. A new martingale can be
//! started from the merged sketch using [`MartingaleEstimator::with_values`] with its current
//! estimate and state change probability.
//!
//! References:
//! - Ting, Daniel. "Streamed approximate counting of distinct elements: Beating optimal batch
//!   methods." KDD 2014.
//! - Cohen, Edith. "All-distances sketches, revisited: HIP estimators for massive graphs
//!   analysis." PODS 2014.
//! - Pettie, Seth, Dingyu Wang, and Longhui Yin. "Non-mergeable sketching for cardinality
//!   estimation." arXiv:2008.08739 (2020).

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::scaled_to_probability;

/// Probability one, scaled by `2^64`.
const SCALED_ONE: u128 = 1 << 64;

/// Receives notifications from a sketch whenever an insertion changed its state.
pub trait StateChangeObserver {
    /// Called after a state change with the decrease of the sketch's state change probability,
    /// scaled by `2^64`.
    fn state_changed(&mut self, scaled_probability_decrement: u64);
}

/// Online distinct count estimator driven by the state changes of a sketch.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MartingaleEstimator {
    distinct_count_estimate: f64,
    // probability times 2^64, 2^64 being certainty
    scaled_state_change_probability: u128,
}

impl Default for MartingaleEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl MartingaleEstimator {
    /// Creates an estimator for an empty sketch.
    pub fn new() -> Self {
        Self {
            distinct_count_estimate: 0.0,
            scaled_state_change_probability: SCALED_ONE,
        }
    }

    /// Creates an estimator that continues from the given estimate and state change probability,
    /// usually taken from a sketch that was built by merging.
    pub fn with_values(
        distinct_count_estimate: f64,
        state_change_probability: f64,
    ) -> Result<Self> {
        if !(distinct_count_estimate >= 0.0) {
            return Err(Error::InvalidEstimate);
        }
        Ok(Self {
            distinct_count_estimate,
            scaled_state_change_probability: Self::scale(state_change_probability)?,
        })
    }

    fn scale(probability: f64) -> Result<u128> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(Error::invalid_probability(probability));
        }
        // truncates below 2^-64
        Ok((probability * 2f64.powi(64)) as u128)
    }

    /// Resets to the state of an estimator for an empty sketch.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Returns the distinct count estimate.
    ///
    /// Once the state change probability has dropped to zero the observed sketch is saturated and
    /// the estimate is infinite.
    pub fn distinct_count_estimate(&self) -> f64 {
        if self.scaled_state_change_probability == 0 {
            f64::INFINITY
        } else {
            self.distinct_count_estimate
        }
    }

    /// Returns the probability that the next insertion of a new element changes the sketch.
    pub fn state_change_probability(&self) -> f64 {
        scaled_to_probability(self.scaled_state_change_probability)
    }

    fn increment_estimate(&mut self) {
        self.distinct_count_estimate += 1.0 / self.state_change_probability();
    }

    /// Records a state change after which the state change probability is `new_probability`.
    pub fn record_state_change(&mut self, new_probability: f64) -> Result<()> {
        let scaled = Self::scale(new_probability)?;
        self.increment_estimate();
        self.scaled_state_change_probability = scaled;
        Ok(())
    }
}

impl StateChangeObserver for MartingaleEstimator {
    fn state_changed(&mut self, scaled_probability_decrement: u64) {
        self.increment_estimate();
        self.scaled_state_change_probability = self
            .scaled_state_change_probability
            .saturating_sub(scaled_probability_decrement as u128);
    }
}

impl fmt::Display for MartingaleEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MartingaleEstimator{{distinctCountEstimate={}, stateChangeProbability={}}}",
            self.distinct_count_estimate,
            self.state_change_probability()
        )
    }
}
