//! HyperLogLog with 6-bit registers.
//!
//! Register `i` holds `1 + nlz` where `nlz` is the largest number of leading zeros seen in the
//! hash bits below the `p` index bits among all hashes with index `i`, or zero if no such hash
//! was added. The registers are packed into `6 * 2^p / 8` bytes.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::martingale::StateChangeObserver;
use crate::packed_array::PackedRegisterArray;
use crate::util::{
    check_precision_parameter, is_unsigned_power_of_two, pow2_neg, scaled_to_probability,
    solve_maximum_likelihood_equation,
};
use crate::{DistinctCounter, Estimator, NoopObserver};

pub const MIN_P: u32 = 2;
pub const MAX_P: u32 = 26;

const REGISTER_BIT_SIZE: u32 = 6;
const MIN_STATE_SIZE: usize = PackedRegisterArray::length_in_bytes(1 << MIN_P, REGISTER_BIT_SIZE);
const MAX_STATE_SIZE: usize = PackedRegisterArray::length_in_bytes(1 << MAX_P, REGISTER_BIT_SIZE);

const VARIANCE_FACTOR: f64 = 1.0794415416798357;
const MARTINGALE_VARIANCE_FACTOR: f64 = std::f64::consts::LN_2;

// sqrt(ln(2) / (pi^2 / 6 - 1))
const ML_INV_SQRT_FISHER_INFORMATION: f64 = 1.0367047097785012;
const ML_EQUATION_SOLVER_EPS: f64 = 0.001 * ML_INV_SQRT_FISHER_INFORMATION;
const ML_BIAS_CORRECTION_CONSTANT: f64 = 1.0101590804141418;

/// A HyperLogLog sketch for approximate distinct counting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HyperLogLog {
    registers: PackedRegisterArray,
}

impl HyperLogLog {
    /// Creates an empty sketch with `2^p` registers.
    ///
    /// The precision parameter `p` must be in the range `2..=26`.
    pub fn new(p: u32) -> Result<Self> {
        check_precision_parameter(p, MIN_P, MAX_P)?;
        Ok(Self {
            registers: PackedRegisterArray::new(REGISTER_BIT_SIZE, 1 << p),
        })
    }

    /// Number of state bytes of a sketch with precision parameter `p`.
    pub const fn state_length(p: u32) -> usize {
        PackedRegisterArray::length_in_bytes(1 << p, REGISTER_BIT_SIZE)
    }

    /// Adopts a state previously returned by [`Self::state`].
    ///
    /// Fails if the length is not `3 * 2^(p-2)` for some valid `p`. Register values are not
    /// checked; estimates of a corrupted state are meaningless but never NaN.
    pub fn wrap(state: Vec<u8>) -> Result<Self> {
        let len = state.len();
        if !(MIN_STATE_SIZE..=MAX_STATE_SIZE).contains(&len)
            || len % 3 != 0
            || !is_unsigned_power_of_two((len / 3) as u64)
        {
            return Err(Error::InvalidStateLength(len));
        }
        let registers = PackedRegisterArray::from_bytes(REGISTER_BIT_SIZE, (len / 3) << 2, state)?;
        Ok(Self { registers })
    }

    pub fn p(&self) -> u32 {
        self.registers.len().trailing_zeros()
    }

    pub fn state(&self) -> &[u8] {
        self.registers.as_bytes()
    }

    pub fn into_state(self) -> Vec<u8> {
        self.registers.into_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.state().iter().all(|&x| x == 0)
    }

    /// Resets this sketch to the empty state.
    pub fn reset(&mut self) -> &mut Self {
        self.registers.clear();
        self
    }

    /// Adds an element represented by a 64-bit hash value.
    pub fn add(&mut self, hash_value: u64) -> &mut Self {
        self.add_with_observer::<NoopObserver>(hash_value, None)
    }

    /// Adds an element and notifies `observer` if the state changed.
    pub fn add_with_observer<O: StateChangeObserver>(
        &mut self,
        hash_value: u64,
        observer: Option<&mut O>,
    ) -> &mut Self {
        let p = self.p();
        let idx = (hash_value >> (64 - p)) as usize;
        let nlz = (!((!hash_value) << p)).leading_zeros(); // in 0..=64-p
        let r = nlz as u64 + 1;
        let old = self.registers.update_max(idx, r);
        if let Some(observer) = observer {
            if r > old {
                observer.state_changed(
                    scaled_register_change_probability(old, p)
                        - scaled_register_change_probability(r, p),
                );
            }
        }
        self
    }

    /// Merges `other` into this sketch.
    ///
    /// `other` must not have a smaller precision parameter than this sketch.
    pub fn add_sketch(&mut self, other: &HyperLogLog) -> Result<&mut Self> {
        let p = self.p();
        let other_p = other.p();
        if other_p < p {
            return Err(Error::SmallerPrecision { p, other_p });
        }
        let delta_p = other_p - p;
        let mut j = 0;
        for i in 0..self.registers.len() {
            let old_r = self.registers.get(i);
            let mut r = old_r;
            let other_r = other.registers.get(j);
            if other_r != 0 {
                r = r.max(other_r + delta_p as u64);
            }
            j += 1;
            for k in 1u64..(1 << delta_p) {
                // leading zeros contributed by the index bits dropped from other
                let nlz = (k.leading_zeros() + delta_p - 64) as u64;
                if nlz >= r && other.registers.get(j) != 0 {
                    r = nlz + 1;
                }
                j += 1;
            }
            if old_r < r {
                self.registers.set(i, r);
            }
        }
        Ok(self)
    }

    /// Returns the estimate of the default estimator.
    pub fn distinct_count_estimate(&self) -> f64 {
        HyperLogLogEstimator::default().estimate(self)
    }

    pub fn distinct_count_estimate_with(&self, estimator: HyperLogLogEstimator) -> f64 {
        estimator.estimate(self)
    }

    /// Probability that adding a new distinct element changes the state.
    pub fn state_change_probability(&self) -> f64 {
        let p = self.p();
        scaled_to_probability(
            self.registers
                .iter()
                .map(|r| scaled_register_change_probability(r, p) as u128)
                .sum(),
        )
    }

    /// Asymptotic relative standard error of a martingale estimator driven by this sketch.
    pub fn martingale_relative_standard_error(p: u32) -> f64 {
        (MARTINGALE_VARIANCE_FACTOR / (1u64 << p) as f64).sqrt()
    }

    /// Register counts indexed by register value, values above `65 - p` counted as `65 - p`.
    fn register_histogram(&self) -> Vec<u32> {
        let saturated = (65 - self.p()) as usize;
        let mut histogram = vec![0u32; saturated + 1];
        for r in self.registers.iter() {
            histogram[(r as usize).min(saturated)] += 1;
        }
        histogram
    }

    #[cfg(feature = "serde")]
    /// Serializes the sketch with bincode.
    pub fn save<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        bincode::serialize_into(&mut writer, &self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    #[cfg(feature = "serde")]
    /// Loads a sketch written by [`Self::save`], validating its state length.
    pub fn load<R: std::io::Read>(mut reader: R) -> std::io::Result<Self> {
        let sketch: HyperLogLog = bincode::deserialize_from(&mut reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Self::wrap(sketch.into_state())?)
    }
}

/// Probability that a register with value `r` changes on the next insertion, scaled by `2^64`.
fn scaled_register_change_probability(r: u64, p: u32) -> u64 {
    let q = (64 - p) as u64;
    if r <= q {
        1 << (q - r)
    } else {
        0
    }
}

impl DistinctCounter for HyperLogLog {
    type Estimator = HyperLogLogEstimator;

    const MIN_P: u32 = MIN_P;
    const MAX_P: u32 = MAX_P;

    fn new(p: u32) -> Result<Self> {
        HyperLogLog::new(p)
    }

    fn wrap(state: Vec<u8>) -> Result<Self> {
        HyperLogLog::wrap(state)
    }

    fn state_length(p: u32) -> usize {
        HyperLogLog::state_length(p)
    }

    fn p(&self) -> u32 {
        HyperLogLog::p(self)
    }

    fn state(&self) -> &[u8] {
        HyperLogLog::state(self)
    }

    fn into_state(self) -> Vec<u8> {
        HyperLogLog::into_state(self)
    }

    fn is_empty(&self) -> bool {
        HyperLogLog::is_empty(self)
    }

    fn reset(&mut self) -> &mut Self {
        HyperLogLog::reset(self)
    }

    fn add_with_observer<O: StateChangeObserver>(
        &mut self,
        hash_value: u64,
        observer: Option<&mut O>,
    ) -> &mut Self {
        HyperLogLog::add_with_observer(self, hash_value, observer)
    }

    fn add_sketch(&mut self, other: &Self) -> Result<&mut Self> {
        HyperLogLog::add_sketch(self, other)
    }

    fn state_change_probability(&self) -> f64 {
        HyperLogLog::state_change_probability(self)
    }

    fn martingale_relative_standard_error(p: u32) -> f64 {
        HyperLogLog::martingale_relative_standard_error(p)
    }
}

/// Estimators for [`HyperLogLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HyperLogLogEstimator {
    /// Raw estimator with the small and large range corrections of Ertl, Otmar. "New cardinality
    /// estimation algorithms for HyperLogLog sketches." arXiv:1702.01284 (2017).
    #[default]
    CorrectedRaw,
    /// Raw estimator with small range correction only. Infinite once every register is
    /// saturated.
    SmallRangeCorrectedRaw,
    /// Maximum-likelihood estimator with first-order bias correction.
    MaximumLikelihood,
}

impl Estimator<HyperLogLog> for HyperLogLogEstimator {
    const ALL: &'static [Self] = &[
        HyperLogLogEstimator::CorrectedRaw,
        HyperLogLogEstimator::SmallRangeCorrectedRaw,
        HyperLogLogEstimator::MaximumLikelihood,
    ];

    fn estimate(&self, sketch: &HyperLogLog) -> f64 {
        let histogram = sketch.register_histogram();
        let p = sketch.p();
        match self {
            HyperLogLogEstimator::CorrectedRaw => corrected_raw_estimate(&histogram, p),
            HyperLogLogEstimator::SmallRangeCorrectedRaw => {
                small_range_corrected_raw_estimate(&histogram, p)
            }
            HyperLogLogEstimator::MaximumLikelihood => maximum_likelihood_estimate(&histogram, p),
        }
    }

    fn relative_standard_error(&self, p: u32) -> f64 {
        let m = (1u64 << p) as f64;
        match self {
            HyperLogLogEstimator::CorrectedRaw | HyperLogLogEstimator::SmallRangeCorrectedRaw => {
                (VARIANCE_FACTOR / m).sqrt()
            }
            HyperLogLogEstimator::MaximumLikelihood => ML_INV_SQRT_FISHER_INFORMATION / m.sqrt(),
        }
    }
}

fn corrected_raw_estimate(histogram: &[u32], p: u32) -> f64 {
    let m = (1u64 << p) as f64;
    let q = (64 - p) as usize;
    let mut sum = m * sigma(histogram[0] as f64 / m);
    for (k, &c) in histogram.iter().enumerate().take(q + 1).skip(1) {
        sum += c as f64 * pow2_neg(k as u32);
    }
    sum += m * tau(1.0 - histogram[q + 1] as f64 / m) * pow2_neg(q as u32);
    ESTIMATION_FACTORS[p as usize] / sum
}

fn small_range_corrected_raw_estimate(histogram: &[u32], p: u32) -> f64 {
    let m = 1u32 << p;
    let saturated = histogram.len() - 1;
    if histogram[saturated] == m {
        return f64::INFINITY;
    }
    let mut sum = 0.0;
    for (r, &c) in histogram.iter().enumerate().skip(1) {
        sum += c as f64 * pow2_neg(r as u32);
    }
    let c0 = histogram[0];
    if c0 > 0 {
        let m = m as f64;
        sum += m * sigma(c0 as f64 / m);
    }
    ESTIMATION_FACTORS[p as usize] / sum
}

fn maximum_likelihood_estimate(histogram: &[u32], p: u32) -> f64 {
    let m = (1u64 << p) as f64;
    let q = (64 - p) as usize;
    let mut a = histogram[0] as f64;
    let mut b = vec![0u32; q + 1];
    for r in 1..=q {
        a += histogram[r] as f64 * pow2_neg(r as u32);
        b[r] = histogram[r];
    }
    b[q] += histogram[q + 1];
    let x = solve_maximum_likelihood_equation(a, &b, ML_EQUATION_SOLVER_EPS / m.sqrt());
    m * x / (1.0 + ML_BIAS_CORRECTION_CONSTANT / m)
}

/// `x + sum_{k >= 1} x^(2^k) * 2^(k-1)`
fn sigma(mut x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return f64::INFINITY;
    }
    let mut z = 1.0;
    let mut sum = x;
    loop {
        x *= x;
        let old_sum = sum;
        sum += x * z;
        z += z;
        if !(old_sum < sum) {
            return sum;
        }
    }
}

/// `(1 - x - sum_{k >= 1} (1 - x^(2^-k))^2 * 2^-k) / 3`
fn tau(mut x: f64) -> f64 {
    if x <= 0.0 || x >= 1.0 {
        return 0.0;
    }
    let mut y = 1.0;
    let mut z = 1.0 - x;
    loop {
        x = x.sqrt();
        let old_z = z;
        y *= 0.5;
        let d = 1.0 - x;
        z -= d * d * y;
        if old_z == z {
            return z / 3.0;
        }
    }
}

const ESTIMATION_FACTORS: [f64; 27] = [
    0.0,
    0.0,
    9.08884193855277,
    40.67760431873907,
    172.99391414703106,
    714.5560640781132,
    2905.6322537477818,
    11719.723738552972,
    47075.733045730056,
    188699.0930713932,
    755591.1970832772,
    3023956.9501793,
    1.2099014641293615e7,
    4.8402434765532516e7,
    1.9362249398321322e8,
    7.745154882959671e8,
    3.098112980431337e9,
    1.2392553978741665e10,
    4.9570420031520744e10,
    1.982820883617127e11,
    7.931291699206317e11,
    3.1725183126326094e12,
    1.2690076516433127e13,
    5.076031259754041e13,
    2.0304126345377997e14,
    8.12165079942359e14,
    3.248660372023916e15,
];
