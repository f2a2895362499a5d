//! UltraLogLog with 8-bit registers.
//!
//! Each register keeps the largest update value seen for its index together with two bits telling
//! whether the two next smaller values were seen as well. See Ertl, Otmar. "UltraLogLog: A
//! Practical and More Space-Efficient Alternative to HyperLogLog for Approximate Distinct
//! Counting." Proceedings of the VLDB Endowment 17.7 (2024).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::martingale::StateChangeObserver;
use crate::util::{
    check_precision_parameter, is_unsigned_power_of_two, scaled_to_probability,
    solve_maximum_likelihood_equation,
};
use crate::{DistinctCounter, Estimator, NoopObserver};

pub const MIN_P: u32 = 3;
pub const MAX_P: u32 = 26; // 32 - 6, leaves room for the update value in a token
const MIN_STATE_SIZE: usize = 1 << MIN_P;
const MAX_STATE_SIZE: usize = 1 << MAX_P;

const MARTINGALE_VARIANCE_FACTOR: f64 = 5.0 * std::f64::consts::LN_2 / 8.0;

// Optimal FGRA estimator
const FGRA_VARIANCE_FACTOR: f64 = 0.6118931496978437;
const ETA_0: f64 = 4.663135422063788;
const ETA_1: f64 = 2.1378502137958524;
const ETA_2: f64 = 2.781144650979996;
const ETA_3: f64 = 0.9824082545153715;
const TAU: f64 = 0.8194911375910897;
const POW_2_TAU: f64 = 1.7631258657688563; // 2^TAU
const POW_2_MINUS_TAU: f64 = 0.5670918786435586; // 2^-TAU
const POW_4_MINUS_TAU: f64 = 0.3216030842364037; // 4^-TAU
const MINUS_INV_TAU: f64 = -1.0 / TAU;
const ETA_X: f64 = ETA_0 - ETA_1 - ETA_2 + ETA_3;
const ETA23X: f64 = (ETA_2 - ETA_3) / ETA_X;
const ETA13X: f64 = (ETA_1 - ETA_3) / ETA_X;
const ETA3012XX: f64 = (ETA_3 * ETA_0 - ETA_1 * ETA_2) / (ETA_X * ETA_X);
const POW_4_MINUS_TAU_ETA_23: f64 = POW_4_MINUS_TAU * (ETA_2 - ETA_3);
const POW_4_MINUS_TAU_ETA_01: f64 = POW_4_MINUS_TAU * (ETA_0 - ETA_1);
const POW_4_MINUS_TAU_ETA_3: f64 = POW_4_MINUS_TAU * ETA_3;
const POW_4_MINUS_TAU_ETA_1: f64 = POW_4_MINUS_TAU * ETA_1;
const POW_2_MINUS_TAU_ETA_X: f64 = POW_2_MINUS_TAU * ETA_X;
const PHI_1: f64 = ETA_0 / (POW_2_TAU * (2.0 * POW_2_TAU - 1.0));
const P_INITIAL: f64 = ETA_X * (POW_4_MINUS_TAU / (2.0 - POW_2_MINUS_TAU));

// Small range corrected GRA estimators
const GRA_VARIANCE_FACTOR: f64 = 0.6169896446766368;
const GRA_TAU: f64 = 0.7550966382001302;
const GRA_MINUS_INV_TAU: f64 = -1.0 / GRA_TAU;
const GRA_KAPPA_1: f64 = 1.6877446411978212; // 2^GRA_TAU
const GRA_KAPPA_2: f64 = 0.5104571712222887; // 1 / (8^GRA_TAU - 4^GRA_TAU)
const GRA_KAPPA_3: f64 = GRA_KAPPA_2 + 1.0 / GRA_KAPPA_1;

// Maximum likelihood estimator
const ML_INV_SQRT_FISHER_INFORMATION: f64 = 0.7608621002725182;
const ML_EQUATION_SOLVER_EPS: f64 = 0.001 * ML_INV_SQRT_FISHER_INFORMATION;
const ML_BIAS_CORRECTION_CONSTANT: f64 = 0.48147376527720065;

/// UltraLogLog is a sketch for approximate distinct counting that is more space efficient than
/// HyperLogLog.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UltraLogLog {
    state: Vec<u8>,
}

impl UltraLogLog {
    /// Creates a new UltraLogLog sketch with the given precision parameter.
    ///
    /// The precision parameter `p` must be in the range `3..=26`.
    /// It defines the size of the internal state, which is a byte array of length 2^p.
    pub fn new(p: u32) -> Result<Self> {
        check_precision_parameter(p, MIN_P, MAX_P)?;
        Ok(Self {
            state: vec![0; 1 << p],
        })
    }

    pub const fn state_length(p: u32) -> usize {
        1 << p
    }

    /// Returns a sketch whose state is kept in the given byte array.
    ///
    /// The length must be `2^p` for a valid precision parameter `p`. Register values are not
    /// checked.
    pub fn wrap(state: Vec<u8>) -> Result<Self> {
        let len = state.len();
        if !(MIN_STATE_SIZE..=MAX_STATE_SIZE).contains(&len)
            || !is_unsigned_power_of_two(len as u64)
        {
            return Err(Error::InvalidStateLength(len));
        }
        Ok(Self { state })
    }

    /// Returns the precision parameter of this sketch.
    pub fn p(&self) -> u32 {
        self.state.len().trailing_zeros()
    }

    pub fn state(&self) -> &[u8] {
        &self.state
    }

    pub fn into_state(self) -> Vec<u8> {
        self.state
    }

    /// Returns true if the sketch is empty (initial state).
    pub fn is_empty(&self) -> bool {
        self.state.iter().all(|&x| x == 0)
    }

    /// Resets this sketch to its initial state representing an empty set.
    pub fn reset(&mut self) -> &mut Self {
        self.state.fill(0);
        self
    }

    /// Bit set of the update values seen by a register. Bit `p - 1 + nlz` is set for update value
    /// `nlz`.
    fn register_to_hash_prefix(register: u8) -> u64 {
        if register == 0 {
            return 0;
        }
        // shift amounts wrap modulo 64 for illegal register values
        (4 | (register & 3) as u64).wrapping_shl(((register >> 2) as u32).wrapping_sub(2))
    }

    fn hash_prefix_to_register(hash_prefix: u64) -> u8 {
        debug_assert!(hash_prefix != 0);
        let nlz = hash_prefix.leading_zeros() + 1;
        let low = (hash_prefix.wrapping_shl(nlz) >> 62) as u8;
        (nlz.wrapping_neg() << 2) as u8 | low
    }

    /// Probability that the register changes on the next insertion, scaled by `2^64` and rounded
    /// down. Only the registers 252 to 254 carry a fraction below `2^-64`, which is dropped.
    fn scaled_register_change_probability(reg: u8, p: u32) -> u64 {
        if reg == 0 {
            return 1 << (64 - p);
        }
        let k = 1 - p as i32 + (reg >> 2) as i32;
        let shift = (!k) as u32 & 63;
        let head = (((reg & 2) | ((reg & 1) << 2)) ^ 7) as u64;
        (head << shift) >> p
    }

    /// Adds a new element represented by a 64-bit hash value to this sketch.
    ///
    /// In order to get good estimates, it is important that the hash value is calculated using a
    /// high-quality hash algorithm.
    pub fn add(&mut self, hash_value: u64) -> &mut Self {
        self.add_with_observer::<NoopObserver>(hash_value, None)
    }

    /// Adds a new element and notifies `observer` if the state changed.
    pub fn add_with_observer<O: StateChangeObserver>(
        &mut self,
        hash_value: u64,
        observer: Option<&mut O>,
    ) -> &mut Self {
        let p = self.p();
        let idx = (hash_value >> (64 - p)) as usize;
        let nlz = (!((!hash_value) << p)).leading_zeros(); // in 0..=64-p
        let old = self.state[idx];
        let hash_prefix = Self::register_to_hash_prefix(old) | 1 << (nlz + p - 1);
        let new = Self::hash_prefix_to_register(hash_prefix);
        self.state[idx] = new;
        if let Some(observer) = observer {
            if new != old {
                observer.state_changed(
                    Self::scaled_register_change_probability(old, p)
                        .saturating_sub(Self::scaled_register_change_probability(new, p)),
                );
            }
        }
        self
    }

    /// Adds another sketch.
    ///
    /// The precision parameter of the added sketch must not be smaller than the precision parameter
    /// of this sketch.
    pub fn add_sketch(&mut self, other: &UltraLogLog) -> Result<&mut Self> {
        let p = self.p();
        let other_p = other.p();
        if other_p < p {
            return Err(Error::SmallerPrecision { p, other_p });
        }
        let group_size = 1usize << (other_p - p);
        for (register, group) in self.state.iter_mut().zip(other.state.chunks_exact(group_size)) {
            let mut other_prefix = Self::register_to_hash_prefix(group[0]);
            for (k, &other_register) in group.iter().enumerate().skip(1) {
                if other_register != 0 {
                    // update value of the finer register's first hash as seen at precision p
                    other_prefix |= 1u64.wrapping_shl((k as u64).leading_zeros() + other_p - 1);
                }
            }
            if other_prefix != 0 {
                *register = Self::hash_prefix_to_register(
                    Self::register_to_hash_prefix(*register) | other_prefix,
                );
            }
        }
        Ok(self)
    }

    /// Returns an estimate of the number of distinct elements added to this sketch.
    pub fn distinct_count_estimate(&self) -> f64 {
        UltraLogLogEstimator::default().estimate(self)
    }

    pub fn distinct_count_estimate_with(&self, estimator: UltraLogLogEstimator) -> f64 {
        estimator.estimate(self)
    }

    /// Probability that adding a new distinct element changes the state.
    ///
    /// Sums the register probabilities in units of `2^-64`, so the result may fall short of the
    /// exact value by less than `2^-64` per register in the states 252 to 254. It is `0` only when
    /// every register is saturated.
    pub fn state_change_probability(&self) -> f64 {
        let p = self.p();
        scaled_to_probability(
            self.state
                .iter()
                .map(|&r| Self::scaled_register_change_probability(r, p) as u128)
                .sum(),
        )
    }

    /// Asymptotic relative standard error of a martingale estimator driven by this sketch.
    pub fn martingale_relative_standard_error(p: u32) -> f64 {
        (MARTINGALE_VARIANCE_FACTOR / (1u64 << p) as f64).sqrt()
    }

    #[cfg(feature = "serde")]
    /// Serializes UltraLogLog to a writer using bincode
    pub fn save<W: std::io::Write>(&self, mut writer: W) -> std::io::Result<()> {
        bincode::serialize_into(&mut writer, &self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    #[cfg(feature = "serde")]
    /// Loads an UltraLogLog written by [`Self::save`], validating its state length.
    pub fn load<R: std::io::Read>(mut reader: R) -> std::io::Result<Self> {
        let sketch: UltraLogLog = bincode::deserialize_from(&mut reader)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Self::wrap(sketch.state)?)
    }
}

impl DistinctCounter for UltraLogLog {
    type Estimator = UltraLogLogEstimator;

    const MIN_P: u32 = MIN_P;
    const MAX_P: u32 = MAX_P;

    fn new(p: u32) -> Result<Self> {
        UltraLogLog::new(p)
    }

    fn wrap(state: Vec<u8>) -> Result<Self> {
        UltraLogLog::wrap(state)
    }

    fn state_length(p: u32) -> usize {
        UltraLogLog::state_length(p)
    }

    fn p(&self) -> u32 {
        UltraLogLog::p(self)
    }

    fn state(&self) -> &[u8] {
        UltraLogLog::state(self)
    }

    fn into_state(self) -> Vec<u8> {
        UltraLogLog::into_state(self)
    }

    fn is_empty(&self) -> bool {
        UltraLogLog::is_empty(self)
    }

    fn reset(&mut self) -> &mut Self {
        UltraLogLog::reset(self)
    }

    fn add_with_observer<O: StateChangeObserver>(
        &mut self,
        hash_value: u64,
        observer: Option<&mut O>,
    ) -> &mut Self {
        UltraLogLog::add_with_observer(self, hash_value, observer)
    }

    fn add_sketch(&mut self, other: &Self) -> Result<&mut Self> {
        UltraLogLog::add_sketch(self, other)
    }

    fn state_change_probability(&self) -> f64 {
        UltraLogLog::state_change_probability(self)
    }

    fn martingale_relative_standard_error(p: u32) -> f64 {
        UltraLogLog::martingale_relative_standard_error(p)
    }
}

/// Estimators for [`UltraLogLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UltraLogLogEstimator {
    /// The optimal further generalized remaining area estimator with small and large range
    /// corrections.
    #[default]
    OptimalFgra,
    /// Generalized remaining area estimator with a small range correction based on the registers
    /// that have not yet reached `4 * (p + 1)`.
    SmallRangeCorrected4Gra,
    /// Like [`Self::SmallRangeCorrected4Gra`], but the small range correction only uses the
    /// fraction of empty registers.
    SmallRangeCorrected1Gra,
    /// Maximum-likelihood estimator with first-order bias correction.
    MaximumLikelihood,
}

impl Estimator<UltraLogLog> for UltraLogLogEstimator {
    const ALL: &'static [Self] = &[
        UltraLogLogEstimator::OptimalFgra,
        UltraLogLogEstimator::SmallRangeCorrected4Gra,
        UltraLogLogEstimator::SmallRangeCorrected1Gra,
        UltraLogLogEstimator::MaximumLikelihood,
    ];

    fn estimate(&self, sketch: &UltraLogLog) -> f64 {
        let p = sketch.p();
        match self {
            UltraLogLogEstimator::OptimalFgra => OptimalFgra::estimate(&sketch.state, p),
            UltraLogLogEstimator::SmallRangeCorrected4Gra => small_range_corrected_gra_estimate(
                &sketch.state,
                p,
                SmallRangeCorrection::FourClasses,
            ),
            UltraLogLogEstimator::SmallRangeCorrected1Gra => small_range_corrected_gra_estimate(
                &sketch.state,
                p,
                SmallRangeCorrection::EmptyRegisters,
            ),
            UltraLogLogEstimator::MaximumLikelihood => {
                maximum_likelihood_estimate(&sketch.state, p)
            }
        }
    }

    fn relative_standard_error(&self, p: u32) -> f64 {
        let m = (1u64 << p) as f64;
        match self {
            UltraLogLogEstimator::OptimalFgra => (FGRA_VARIANCE_FACTOR / m).sqrt(),
            UltraLogLogEstimator::SmallRangeCorrected4Gra
            | UltraLogLogEstimator::SmallRangeCorrected1Gra => (GRA_VARIANCE_FACTOR / m).sqrt(),
            UltraLogLogEstimator::MaximumLikelihood => ML_INV_SQRT_FISHER_INFORMATION / m.sqrt(),
        }
    }
}

struct OptimalFgra;

impl OptimalFgra {
    fn estimate(state: &[u8], p: u32) -> f64 {
        let m = state.len() as u64;
        let off = ((p << 2) + 4) as i32;

        let mut sum = 0.0;
        // registers 4p-4 or smaller, 4p, 4p+2 and 4p+3 (below the offset)
        let mut small = [0u64; 4];
        // registers 252 to 255
        let mut large = [0u64; 4];

        for &reg in state {
            let r = reg as i32;
            let r2 = r - off;
            if r2 < 0 {
                match r2 {
                    ..=-9 => small[0] += 1,
                    -8 => small[1] += 1,
                    -4 => small[2] += 1,
                    -2 => small[3] += 1,
                    _ => {}
                }
            } else if r < 252 {
                sum += FGRA_REGISTER_CONTRIBUTIONS[r2 as usize];
            } else {
                large[(r - 252) as usize] += 1;
            }
        }

        if small.iter().any(|&c| c > 0) {
            let z = Self::small_range_estimate(small, m);
            let [c0, c4, c8, c10] = small.map(|c| c as f64);
            // sigma(z) may be infinite, so empty classes must not contribute 0 * inf
            if small[0] > 0 {
                sum += c0 * Self::sigma(z);
            }
            if small[1] > 0 {
                sum += c4 * POW_2_MINUS_TAU_ETA_X * Self::psi_prime(z, z * z);
            }
            if small[2] > 0 {
                sum += c8 * (z * POW_4_MINUS_TAU_ETA_01 + POW_4_MINUS_TAU_ETA_1);
            }
            if small[3] > 0 {
                sum += c10 * (z * POW_4_MINUS_TAU_ETA_23 + POW_4_MINUS_TAU_ETA_3);
            }
        }

        if large.iter().any(|&c| c > 0) {
            sum += Self::large_range_contribution(large, m, 65 - p as i32);
        }

        FGRA_ESTIMATION_FACTORS[(p - MIN_P) as usize] * sum.powf(MINUS_INV_TAU)
    }

    fn small_range_estimate([c0, c4, c8, c10]: [u64; 4], m: u64) -> f64 {
        let alpha = (m + 3 * (c0 + c4 + c8 + c10)) as f64;
        let beta = (m - c0 - c4) as f64;
        let gamma = (4 * c0 + 2 * c4 + 3 * c8 + c10) as f64;
        let quad_root_z = ((beta * beta + 4.0 * alpha * gamma).sqrt() - beta) / (2.0 * alpha);
        let root_z = quad_root_z * quad_root_z;
        root_z * root_z
    }

    fn psi_prime(z: f64, z_square: f64) -> f64 {
        (z + ETA23X) * (z_square + ETA13X) + ETA3012XX
    }

    fn sigma(z: f64) -> f64 {
        if z <= 0.0 {
            return ETA_3;
        }
        if z >= 1.0 {
            return f64::INFINITY;
        }

        let mut pow_z = z;
        let mut next_pow_z = pow_z * pow_z;
        let mut s = 0.0;
        let mut pow_tau = ETA_X;
        loop {
            let old_s = s;
            let next_next_pow_z = next_pow_z * next_pow_z;
            s += pow_tau * (pow_z - next_pow_z) * Self::psi_prime(next_pow_z, next_next_pow_z);
            if !(s > old_s) {
                return s / z;
            }
            pow_z = next_pow_z;
            next_pow_z = next_next_pow_z;
            pow_tau *= POW_2_TAU;
        }
    }

    fn large_range_contribution(large: [u64; 4], m: u64, w: i32) -> f64 {
        let [c4w0, c4w1, c4w2, c4w3] = large.map(|c| c as f64);
        let z = Self::large_range_estimate(large, m);
        let root_z = z.sqrt();
        let mut s = Self::phi(root_z, z) * (c4w0 + c4w1 + c4w2 + c4w3);
        s += z * (1.0 + root_z) * (c4w0 * ETA_0 + c4w1 * ETA_1 + c4w2 * ETA_2 + c4w3 * ETA_3);
        s += root_z
            * ((c4w0 + c4w1) * (z * POW_2_MINUS_TAU * (ETA_0 - ETA_2) + POW_2_MINUS_TAU * ETA_2)
                + (c4w2 + c4w3)
                    * (z * POW_2_MINUS_TAU * (ETA_1 - ETA_3) + POW_2_MINUS_TAU * ETA_3));
        s * POW_2_MINUS_TAU.powi(w) / ((1.0 + root_z) * (1.0 + z))
    }

    fn large_range_estimate([c4w0, c4w1, c4w2, c4w3]: [u64; 4], m: u64) -> f64 {
        let alpha = (m + 3 * (c4w0 + c4w1 + c4w2 + c4w3)) as f64;
        let beta = (c4w0 + c4w1 + 2 * (c4w2 + c4w3)) as f64;
        let gamma = (m + 2 * c4w0 + c4w2) as f64 - c4w3 as f64;
        (((beta * beta + 4.0 * alpha * gamma).sqrt() - beta) / (2.0 * alpha)).sqrt()
    }

    fn phi(z: f64, z_square: f64) -> f64 {
        if z <= 0.0 {
            return 0.0;
        }
        if z >= 1.0 {
            return PHI_1;
        }

        let mut previous_pow_z = z_square;
        let mut pow_z = z;
        let mut next_pow_z = z.sqrt();
        let mut p = P_INITIAL / (1.0 + next_pow_z);
        let mut ps = Self::psi_prime(pow_z, previous_pow_z);
        let mut s = next_pow_z * (ps + ps) * p;
        loop {
            previous_pow_z = pow_z;
            pow_z = next_pow_z;
            let old_s = s;
            next_pow_z = pow_z.sqrt();
            let next_ps = Self::psi_prime(pow_z, previous_pow_z);
            p *= POW_2_MINUS_TAU / (1.0 + next_pow_z);
            s += next_pow_z * ((next_ps + next_ps) - (pow_z + next_pow_z) * ps) * p;
            if !(s > old_s) {
                return s;
            }
            ps = next_ps;
        }
    }
}

#[derive(Clone, Copy)]
enum SmallRangeCorrection {
    FourClasses,
    EmptyRegisters,
}

fn small_range_corrected_gra_estimate(
    state: &[u8],
    p: u32,
    correction: SmallRangeCorrection,
) -> f64 {
    if state.iter().all(|&r| r == u8::MAX) {
        return f64::INFINITY;
    }
    let m = state.len() as u64;
    let off = ((p + 1) << 2) as i32;
    // classes of registers below the offset: smaller than 4p-4, 4p-4, 4p and 4p+2
    let mut c = [0u64; 4];
    let mut sum = 0.0;
    for &reg in state {
        let t = reg as i32 - off;
        if t >= 0 {
            sum += GRA_REGISTER_CONTRIBUTIONS[t as usize];
        } else {
            c[(((t + 8) | (!t << 28)) as u32).leading_zeros() as usize & 3] += 1;
        }
    }

    let alpha = c[0] + c[1];
    let beta = alpha + c[2] + c[3];
    if beta > 0 {
        let z = match correction {
            SmallRangeCorrection::FourClasses => {
                let gamma = ((beta + alpha) << 1) + ((c[0] + c[2]) << 2);
                gra_small_range_estimate(m, alpha, beta, gamma)
            }
            SmallRangeCorrection::EmptyRegisters => c[0] as f64 / m as f64,
        };
        let [c0, c1, c2, c3] = c.map(|x| x as f64);
        if alpha > 0 {
            let z2 = z * z;
            if c[0] > 0 {
                sum += c0
                    * (z + GRA_KAPPA_1
                        * (z2 + GRA_KAPPA_1 * (GRA_KAPPA_2 + xi(GRA_KAPPA_1, z2 * z2 * z) / z)));
            }
            if c[1] > 0 {
                sum += c1 * (z + GRA_KAPPA_1 * (z2 + GRA_KAPPA_2));
            }
        }
        if c[2] > 0 {
            sum += c2 * (z + GRA_KAPPA_3);
        }
        if c[3] > 0 {
            sum += c3 * (z + GRA_KAPPA_2);
        }
    }

    GRA_ESTIMATION_FACTORS[(p - MIN_P) as usize] * sum.powf(GRA_MINUS_INV_TAU)
}

/// Estimate of `e^(-n/m)` from the four register classes below the offset.
fn gra_small_range_estimate(m: u64, alpha: u64, beta: u64, gamma: u64) -> f64 {
    let mma = (m - alpha) as f64;
    let twice_m_plus_3_beta = (((m + beta) << 1) + (beta << 2)) as f64;
    let x = ((gamma as f64 * twice_m_plus_3_beta + mma * mma).sqrt() - mma) / twice_m_plus_3_beta;
    let x2 = x * x;
    x2 * x2
}

/// `y + sum_{k >= 1} x^k * y^(2^k)`
fn xi(x: f64, mut y: f64) -> f64 {
    if y <= 0.0 {
        return 0.0;
    }
    if y >= 1.0 {
        return f64::INFINITY;
    }
    let mut z = x;
    let mut sum = y;
    loop {
        y *= y;
        let old_sum = sum;
        sum += y * z;
        z *= x;
        if !(old_sum < sum) {
            return sum;
        }
    }
}

fn maximum_likelihood_estimate(state: &[u8], p: u32) -> f64 {
    let m = state.len();
    let p_i32 = p as i32;

    // wraps to zero if all registers are empty or all are saturated
    let mut sum: u64 = 0;
    let mut b = [0u32; 64];

    for &reg in state {
        let r = reg as i32;
        let r2 = r - ((p_i32 << 2) + 4);
        if r2 < 0 {
            let mut ret: u64 = 4;
            if r2 == -2 || r2 == -8 {
                b[0] += 1;
                ret -= 2;
            }
            if r2 == -2 || r2 == -4 {
                b[1] += 1;
                ret -= 1;
            }
            sum = sum.wrapping_add(ret << (62 - p));
        } else {
            let k = (r2 >> 2) as usize;
            let y0 = (r & 1) as u64;
            let y1 = ((r >> 1) & 1) as u64;
            let ret = 0xE000_0000_0000_0000u64 - (y0 << 63) - (y1 << 62);
            sum = sum.wrapping_add(ret >> ((k as u32 + p) & 63));
            b[k] += y0 as u32;
            b[k + 1] += y1 as u32;
            b[k + 2] += 1;
        }
    }

    if sum == 0 {
        return if state[0] == 0 { 0.0 } else { f64::INFINITY };
    }

    let n = (63 - p) as usize;
    b[n] += b[n + 1];

    let factor = (m << 1) as f64;
    let a = sum as f64 * factor * 2f64.powi(-64);

    factor
        * solve_maximum_likelihood_equation(
            a,
            &b[..=n],
            ML_EQUATION_SOLVER_EPS / (m as f64).sqrt(),
        )
        / (1.0 + ML_BIAS_CORRECTION_CONSTANT / m as f64)
}

// indexed by p - 3
const FGRA_ESTIMATION_FACTORS: [f64; 24] = [
    94.59941722950778,
    455.6358404615186,
    2159.476860400962,
    10149.51036338182,
    47499.52712820488,
    221818.76564766388,
    1034754.6840013304,
    4824374.384717942,
    2.2486750611989766e7,
    1.0479810199493326e8,
    4.8837185623048025e8,
    2.275794725435168e9,
    1.0604938814719946e10,
    4.9417362104242645e10,
    2.30276227770117e11,
    1.0730444972228585e12,
    5.0001829613164e12,
    2.329988778511272e13,
    1.0857295240912981e14,
    5.059288069986326e14,
    2.3575295235667005e15,
    1.0985627213141412e16,
    5.119087674515589e16,
    2.3853948339571715e17,
];

// indexed by register - 4 * (p + 1)
const FGRA_REGISTER_CONTRIBUTIONS: [f64; 236] = [
    0.8484061093359406,
    0.38895829052007685,
    0.5059986252327467,
    0.17873835725405993,
    0.48074234060273024,
    0.22040001471443574,
    0.2867199572932749,
    0.10128061935935387,
    0.2724086914332655,
    0.12488785473931466,
    0.16246750447680292,
    0.057389829555353204,
    0.15435814343988866,
    0.0707666752272979,
    0.09206087452057209,
    0.03251947467566813,
    0.08746577181824695,
    0.0400993542020493,
    0.05216553700867983,
    0.018426892732996067,
    0.04956175987398336,
    0.022721969094305374,
    0.029559172293066274,
    0.01044144713836362,
    0.02808376340530896,
    0.012875216815740723,
    0.01674946174724118,
    0.005916560101748389,
    0.015913433441643893,
    0.0072956356627506685,
    0.009490944673308844,
    0.0033525700962450116,
    0.009017216113341773,
    0.004134011914931561,
    0.0053779657012946284,
    0.0018997062578498703,
    0.005109531310944485,
    0.002342503834183061,
    0.00304738001114257,
    0.001076452918957914,
    0.0028952738727082267,
    0.0013273605219527246,
    0.0017267728074345586,
    6.09963188753462e-4,
    0.0016405831157217021,
    7.521379173550258e-4,
    9.78461602292084e-4,
    3.4563062172237723e-4,
    9.2962292270938e-4,
    4.2619276177576713e-4,
    5.544372155028133e-4,
    1.958487477192352e-4,
    5.267631795945699e-4,
    2.4149862146135835e-4,
    3.141672858847145e-4,
    1.1097608132071735e-4,
    2.9848602115777116e-4,
    1.3684320663902123e-4,
    1.7802030736817869e-4,
    6.288368329501905e-5,
    1.6913464774658265e-4,
    7.754107700464113e-5,
    1.0087374230011362e-4,
    3.563252169014952e-5,
    9.583875639268212e-5,
    4.393801322487549e-5,
    5.715927601779108e-5,
    2.0190875207520577e-5,
    5.430624268457414e-5,
    2.4897113642537945e-5,
    3.2388833410757184e-5,
    1.144099329232623e-5,
    3.0772185549154786e-5,
    1.4107744575453657e-5,
    1.8352865935237916e-5,
    6.482944704957522e-6,
    1.7436805727319977e-5,
    7.99403737572986e-6,
    1.0399500462555932e-5,
    3.67350727106242e-6,
    9.880422483694849e-6,
    4.529755498675165e-6,
    5.892791363067244e-6,
    2.081562667074589e-6,
    5.5986600976661345e-6,
    2.5667486794686803e-6,
    3.339101736056405e-6,
    1.1795003568090263e-6,
    3.1724346748254955e-6,
    1.4544270182973653e-6,
    1.8920745223756656e-6,
    6.683541714686068e-7,
    1.7976340035771381e-6,
    8.241391019206623e-7,
    1.072128458850476e-6,
    3.7871739159788393e-7,
    1.0186145159929963e-6,
    4.6699164053601817e-7,
    6.075127690181302e-7,
    2.1459709360913574e-7,
    5.77189533646426e-7,
    2.6461697039041317e-7,
    3.442421115430427e-7,
    1.2159967724530947e-7,
    3.27059699739513e-7,
    1.4994302882644454e-7,
    1.9506195985170504e-7,
    6.890345650764188e-8,
    1.853256875916027e-7,
    8.49639834530526e-8,
    1.1053025444979778e-7,
    3.904357664636507e-8,
    1.0501327589016596e-7,
    4.814414208323267e-8,
    6.263105916717392e-8,
    2.2123721430020238e-8,
    5.9504908663745294e-8,
    2.7280481949286693e-8,
    3.548937430686624e-8,
    1.2536224699555158e-8,
    3.371796684815404e-8,
    1.545826061452554e-8,
    2.0109761920695445e-8,
    7.103548569567803e-9,
    1.910600846054063e-8,
    8.759296176321385e-9,
    1.139503111580109e-8,
    4.0251673442004705e-9,
    1.082626247715867e-8,
    4.963383100969499e-9,
    6.456900615837058e-9,
    2.28082795382416e-9,
    6.134612546958812e-9,
    2.812460192131048e-9,
    3.65874960227048e-9,
    1.292412391857717e-9,
    3.476127720042246e-9,
    1.5936574250689536e-9,
    2.0732003554895977e-9,
    7.323348470132607e-10,
    1.9697191686598677e-9,
    9.030328662369446e-10,
    1.1747619217600795e-9,
    4.1497151491950363e-10,
    1.1161251587553774e-9,
    5.116961428952198e-10,
    6.656691762391315e-10,
    2.351401942661752e-10,
    6.324431369849931e-10,
    2.899484087937328e-10,
    3.771959611450379e-10,
    1.3324025619025952e-10,
    3.5836869940773545e-10,
    1.6429687995368037e-10,
    2.1373498756237659e-10,
    7.549949478033437e-11,
    2.0306667462222755e-10,
    9.309747508122088e-11,
    1.2111117194789844e-10,
    4.2781167456975155e-11,
    1.1506606020637118e-10,
    5.275291818652914e-11,
    6.86266490006118e-11,
    2.424159650745726e-11,
    6.520123617549523e-11,
    2.9892007004129765e-11,
    3.888672595026375e-11,
    1.3736301184893309e-11,
    3.6945743959497274e-11,
    1.693805979747882e-11,
    2.2034843273746723e-11,
    7.783562034953282e-12,
    2.093500180037604e-11,
    9.597812206565218e-12,
    1.248586262365167e-11,
    4.4104913787558985e-12,
    1.186264650299681e-11,
    5.4385213096368525e-12,
    7.075011313669894e-12,
    2.499168647301308e-12,
    6.721871027139603e-12,
    3.081693348317683e-12,
    4.008996942969544e-12,
    1.4161333491633975e-12,
    3.808892905481426e-12,
    1.7462161775917615e-12,
    2.271665129027518e-12,
    8.024403094117999e-13,
    2.1582778227746425e-12,
    9.89479027998621e-13,
    1.2872203525845489e-12,
    4.54696198313039e-13,
    1.2229703685228866e-12,
    5.606801491206791e-13,
    7.293928206826874e-13,
    2.5764985922987735e-13,
    6.92986095905959e-13,
    3.1770479284824887e-13,
    4.1330443990824427e-13,
    1.4599517261737423e-13,
    3.926748688923721e-13,
    1.8002480658009348e-13,
    2.3419555992885186e-13,
    8.272696321778206e-14,
    2.225059832666067e-13,
    1.0200957528418621e-13,
    1.327049869160979e-13,
    4.687655297461429e-14,
    1.2608118449008524e-13,
    5.780288643182276e-14,
    7.519618885068399e-14,
    2.656221301145837e-14,
    7.144286571105751e-14,
    3.2753529955811655e-14,
    4.2609301647742677e-14,
    1.5051259431302017e-14,
    4.0482511975524363e-14,
    1.8559518231526075e-14,
    2.4144210160882415e-14,
    8.528672304925501e-15,
    2.293908229376684e-14,
    1.0516598285774437e-14,
    1.3681118012966618e-14,
    4.832701981970378e-15,
    1.2998242223663023e-14,
    5.959143881034847e-15,
    7.752292944665042e-15,
    2.7384108113817744e-15,
    7.365346997814574e-15,
    3.376699844369893e-15,
    4.392773006047039e-15,
    1.5516979527951759e-15,
    4.173513269314059e-15,
    1.9133791810691354e-15,
    2.4891286772044455e-15,
    8.792568765435867e-16,
];

// indexed by p - 3
const GRA_ESTIMATION_FACTORS: [f64; 24] = [
    198.73981665391312,
    1027.9377396749687,
    5233.925351968597,
    26433.204636982657,
    132944.2295453946,
    667235.7546841304,
    3345276.6696228283,
    16763152.109693773,
    83977830.38422403,
    420645493.52151716,
    2106876773.434261,
    10552313382.074574,
    52850493853.75068,
    264695666633.17322,
    1325692560442.2827,
    6639538747664.202,
    33253131662557.215,
    166543224826691.44,
    834106058225079.1,
    4177491022408222.0,
    2.0922315506308388e+16,
    1.0478616702477387e+17,
    5.248052310107033e+17,
    2.628405409742423e+18,
];

// indexed by register - 4 * (p + 1)
const GRA_REGISTER_CONTRIBUTIONS: [f64; 240] = [
    1.2460201711017937,
    0.653513475722638,
    0.894955987032666,
    0.3024492916535102,
    0.7382752939552941,
    0.38721110988616636,
    0.5302674143865155,
    0.1792032303173878,
    0.4374330547015261,
    0.22942517513274754,
    0.3141869933654037,
    0.10617911379662519,
    0.25918201369081073,
    0.13593595235468833,
    0.1861578971700481,
    0.06291183583392572,
    0.1535670784336574,
    0.08054296191289477,
    0.11029980047095791,
    0.037275683950195294,
    0.09098952216175796,
    0.047722244199058475,
    0.06535337027802751,
    0.022086092315328043,
    0.053911901090191665,
    0.028275749206461226,
    0.03872230945532442,
    0.013086157571593987,
    0.03194316235655737,
    0.01675357072169013,
    0.022943227612823313,
    0.007753635977956072,
    0.018926537567843658,
    0.009926602824109598,
    0.01359401597420574,
    0.0045940812304716815,
    0.01121410022929249,
    0.005881578635654573,
    0.008054545481808098,
    0.002722023888170182,
    0.006644429468508727,
    0.003484874721024335,
    0.0047723721262072265,
    0.0016128173787228353,
    0.003936868947065984,
    0.002064811604764485,
    0.002827662437618638,
    0.000955605095317139,
    0.0023326212099668846,
    0.0012234147005195375,
    0.0016754089265611884,
    0.0005662024171138415,
    0.001382093684688806,
    0.0007248814012831103,
    0.000992691006485508,
    0.00033547872307981245,
    0.0008188997618193659,
    0.0004294970836160677,
    0.0005881760677853368,
    0.00019877338958203874,
    0.00048520359172237,
    0.0002544798976883411,
    0.0003484982582245961,
    0.00011777456419056722,
    0.00028748637671751845,
    0.00015078104321974457,
    0.00020648755132604703,
    6.978221782827322e-05,
    0.00017033760303542404,
    8.933877764395259e-05,
    0.00012234525667313,
    4.13464312816586e-05,
    0.00010092617027332548,
    5.293382391103152e-05,
    7.249038372671083e-05,
    2.4498037364416874e-05,
    5.979943162592211e-05,
    3.1363645079307446e-05,
    4.29510377086804e-05,
    1.4515251162065735e-05,
    3.543156361822687e-05,
    1.8583169700985165e-05,
    2.5448777415875718e-05,
    8.600383498634015e-06,
    2.099343867155194e-05,
    1.1010652469200782e-05,
    1.5078571008120223e-05,
    5.095784805769066e-06,
    1.2438752971926225e-05,
    6.523885308494502e-06,
    8.934154279061265e-06,
    3.019286615629545e-06,
    7.370044418033647e-06,
    3.865445725168695e-06,
    5.293546227894125e-06,
    1.7889475350291736e-06,
    4.366800662926713e-06,
    2.2903024727871896e-06,
    3.136461582326346e-06,
    1.059963392186823e-06,
    2.587358630170215e-06,
    1.3570195495698475e-06,
    1.8583744873278625e-06,
    6.280354067274951e-07,
    1.5330273117228908e-06,
    8.040431688805394e-07,
    1.1010993262635626e-06,
    3.7211518342121145e-07,
    9.083289463949215e-07,
    4.764009609355932e-07,
    6.524087230886388e-07,
    2.2048073762931057e-07,
    5.381909823456857e-07,
    2.822707590394028e-07,
    3.865565365537844e-07,
    1.3063631324750157e-07,
    3.18881760432504e-07,
    1.6724731464060264e-07,
    2.2903733605069478e-07,
    7.740289025879344e-08,
    1.8893957809055026e-07,
    9.90951537087412e-08,
    1.3570615510184212e-07,
    4.586173072003307e-08,
    1.1194796504076395e-07,
    5.871454205205578e-08,
    8.040680550200368e-08,
    2.717338251329552e-08,
    6.632991882072436e-08,
    3.4788759281964074e-08,
    4.7641570613986767e-08,
    1.6100411075226482e-08,
    3.9300921005234995e-08,
    2.061257279849743e-08,
    2.8227949567165946e-08,
    9.539601360428386e-09,
    2.328605883016905e-08,
    1.2213087392099998e-08,
    1.6725249115370975e-08,
    5.652277677301926e-09,
    1.3797145765868082e-08,
    7.236336051070006e-09,
    9.909822082741611e-09,
    3.3490123679435366e-09,
    8.174901243399014e-09,
    4.287577560272542e-09,
    5.871635934040619e-09,
    1.9843122509141475e-09,
    4.843683720777293e-09,
    2.5404184114189026e-09,
    3.478983603747904e-09,
    1.1757182943895137e-09,
    2.86991503485957e-09,
    1.5052149178301797e-09,
    2.0613210783349387e-09,
    6.966209613055487e-10,
    1.7004438733235995e-09,
    8.918499167989679e-10,
    1.2213465402396332e-09,
    4.1275258371500173e-10,
    1.007524380060696e-09,
    5.284270469767305e-10,
    7.236560024701489e-10,
    2.445586693861836e-10,
    5.96964940943696e-10,
    3.1309656335314873e-10,
    4.2877102661487837e-10,
    1.4490264902433124e-10,
    3.5370572441576243e-10,
    1.8551181008694479e-10,
    2.5404970405390984e-10,
    8.585578972509221e-11,
    2.0957300991027393e-10,
    1.0991698954842127e-10,
    1.5052615061103474e-10,
    5.08701302491821e-11,
    1.2417341154259957e-10,
    6.512655224336035e-11,
    8.918775206668936e-11,
    3.014089276745014e-11,
    7.357357772706164e-11,
    3.858791825115141e-11,
    5.284434024532962e-11,
    1.7858680769419393e-11,
    4.3592837406282564e-11,
    2.2863599924550633e-11,
    3.131062540825184e-11,
    1.0581387926519918e-11,
    2.5829048033797352e-11,
    1.3546836035766623e-11,
    1.8551755190897945e-11,
    6.269543192867219e-12,
    1.530388389529476e-11,
    8.02659105239535e-12,
    1.0992039161642047e-11,
    3.7147463187426396e-12,
    9.067653673267387e-12,
    4.755808939614672e-12,
    6.5128567991428e-12,
    2.201012065490087e-12,
    5.372645512790326e-12,
    2.8178486386657384e-12,
    3.85891125953777e-12,
    1.3041143854131823e-12,
    3.1833284382270484e-12,
    1.6695941849744907e-12,
    2.286430758150141e-12,
    7.72696504897584e-13,
    1.8861434132403988e-12,
    9.892457331634913e-13,
    1.3547255327247989e-12,
    4.578278526478915e-13,
    1.1175526007902254e-12,
    5.861347202746278e-13,
    8.026839485405335e-13,
    2.712660680249361e-13,
    6.621573984065978e-13,
    3.4728874615690586e-13,
    4.755956137836443e-13,
    1.6072696153395228e-13,
    3.923326919507526e-13,
    2.057709073277989e-13,
    2.817935854597685e-13,
    9.523180083681482e-14,
    2.324597467969489e-13,
    1.2192064030596472e-13,
    1.6696458609981127e-13,
    5.6425479608827106e-14,
    1.377339563833356e-13,
    7.223879568619792e-14,
    9.892763515534778e-14,
    3.3432474458210114e-14,
    8.160829133818701e-14,
    4.280197011019917e-14,
    5.861528618756994e-14,
    1.9808964959582118e-14,
    4.8353459016328606e-14,
    2.536045386571153e-14,
    3.472994951770057e-14,
    1.1736944367083503e-14,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MartingaleEstimator;
    use ahash::RandomState;
    use test_case::test_case;

    #[test]
    fn test_create_ultraloglog() {
        assert!(UltraLogLog::new(2).is_err()); // Too small p
        assert!(UltraLogLog::new(27).is_err()); // Too large p
        assert!(UltraLogLog::new(4).is_ok()); // Valid p
        for p in MIN_P..=16 {
            let ull = UltraLogLog::new(p).unwrap();
            assert_eq!(ull.p(), p);
            assert_eq!(ull.state().len(), UltraLogLog::state_length(p));
        }
    }

    #[test]
    fn test_add_and_reset() {
        let mut ull = UltraLogLog::new(4).unwrap();
        assert!(ull.is_empty());

        ull.add(123456789);
        assert!(!ull.is_empty());

        ull.reset();
        assert!(ull.is_empty());
    }

    #[test_case(7 => None; "not a power of two")]
    #[test_case(2 => None; "too small")]
    #[test_case(8 => Some(3))]
    #[test_case(16 => Some(4))]
    #[test_case(MAX_STATE_SIZE => Some(26))]
    #[test_case(MAX_STATE_SIZE + 1 => None; "too large")]
    fn test_wrap_state_length(len: usize) -> Option<u32> {
        UltraLogLog::wrap(vec![0; len]).ok().map(|ull| ull.p())
    }

    #[test]
    fn test_register_encoding() {
        assert_eq!(UltraLogLog::register_to_hash_prefix(0), 0);
        for p in MIN_P..=MAX_P {
            // smallest legal nonzero register is 4p - 4
            let min_register = ((p << 2) - 4) as u8;
            assert_eq!(UltraLogLog::register_to_hash_prefix(min_register), 1 << (p - 1));
            for nlz in 0..=(64 - p) {
                let prefix = 1u64 << (nlz + p - 1);
                let register = UltraLogLog::hash_prefix_to_register(prefix);
                assert_eq!(UltraLogLog::register_to_hash_prefix(register), prefix);
                // the two next smaller update values are remembered
                for extra in [prefix >> 1, prefix >> 2, (prefix >> 1) | (prefix >> 2)] {
                    if extra >= 1 << (p - 1) {
                        let register = UltraLogLog::hash_prefix_to_register(prefix | extra);
                        assert_eq!(UltraLogLog::register_to_hash_prefix(register), prefix | extra);
                    }
                }
            }
        }
        assert_eq!(UltraLogLog::hash_prefix_to_register(u64::MAX), 255);
    }

    #[test]
    fn test_scaled_register_change_probability() {
        let p = 8;
        assert_eq!(UltraLogLog::scaled_register_change_probability(0, p), 1 << 56);
        // 4p - 4: 1/2 of the empty case
        assert_eq!(UltraLogLog::scaled_register_change_probability(28, p), 1 << 55);
        // 4p: 3/4, 4p + 2: 1/4
        assert_eq!(UltraLogLog::scaled_register_change_probability(32, p), 3 << 54);
        assert_eq!(UltraLogLog::scaled_register_change_probability(34, p), 1 << 54);
        // 4p + 4: 7/8 of 2^-(p+1)
        assert_eq!(UltraLogLog::scaled_register_change_probability(36, p), 7 << 53);
        assert_eq!(UltraLogLog::scaled_register_change_probability(255, p), 0);
    }

    #[test_case(3)]
    #[test_case(8)]
    #[test_case(26)]
    fn test_scaled_register_change_probability_rounds_down(p: u32) {
        // exact values are 3.5, 1.5 and 2.5 units of 2^-64
        assert_eq!(UltraLogLog::scaled_register_change_probability(252, p), 3);
        assert_eq!(UltraLogLog::scaled_register_change_probability(253, p), 1);
        assert_eq!(UltraLogLog::scaled_register_change_probability(254, p), 2);
        assert_eq!(UltraLogLog::scaled_register_change_probability(248, p), 7);
        assert_eq!(UltraLogLog::scaled_register_change_probability(251, p), 1);
    }

    #[test]
    fn test_state_change_probability_of_almost_saturated_state() {
        let mut state = vec![u8::MAX; 16];
        state[5] = 253;
        let ull = UltraLogLog::wrap(state).unwrap();
        assert_eq!(ull.state_change_probability(), 2f64.powi(-64));
        state = ull.into_state();
        state[5] = 252;
        let ull = UltraLogLog::wrap(state).unwrap();
        assert_eq!(ull.state_change_probability(), 3.0 * 2f64.powi(-64));
    }

    #[test]
    fn test_state_change_probability() {
        let p = 4;
        let mut ull = UltraLogLog::new(p).unwrap();
        assert_eq!(ull.state_change_probability(), 1.0);
        // saturate half of the registers
        for idx in 0..8u64 {
            ull.add(idx << 60);
            ull.add((idx << 60) | 1);
            ull.add((idx << 60) | 2);
        }
        for &reg in &ull.state()[..8] {
            assert_eq!(reg, 255);
        }
        assert_eq!(ull.state_change_probability(), 0.5);
    }

    #[test]
    fn test_martingale_tracks_state_change_probability() {
        let mut ull = UltraLogLog::new(6).unwrap();
        let mut martingale = MartingaleEstimator::new();
        let mut state = 0x1234_u64;
        for _ in 0..5000 {
            state = state.wrapping_add(0x9E3779B97F4A7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
            ull.add_with_martingale(z ^ (z >> 31), &mut martingale);
            assert_eq!(
                martingale.state_change_probability(),
                ull.state_change_probability()
            );
        }
    }

    #[test]
    fn test_add_sketch_rejects_smaller_precision() {
        let mut ull = UltraLogLog::new(8).unwrap();
        let other = UltraLogLog::new(7).unwrap();
        assert_eq!(
            ull.add_sketch(&other).map(|_| ()),
            Err(Error::SmallerPrecision { p: 8, other_p: 7 })
        );
    }

    #[test]
    fn test_estimators_on_extreme_states() {
        for p in MIN_P..=12 {
            let empty = UltraLogLog::new(p).unwrap();
            let full = UltraLogLog::wrap(vec![255; 1 << p]).unwrap();
            assert_eq!(full.state_change_probability(), 0.0);
            for &estimator in UltraLogLogEstimator::ALL {
                assert_eq!(empty.distinct_count_estimate_with(estimator), 0.0);
                assert_eq!(
                    full.distinct_count_estimate_with(estimator),
                    f64::INFINITY,
                    "{estimator:?} p = {p}"
                );
            }
        }
    }

    #[test]
    fn test_xxhash3() {
        let mut ull = UltraLogLog::new(8).unwrap();

        ull.add_value("apple")
            .add_value("banana")
            .add_value("cherry")
            .add_value("033");

        for &estimator in UltraLogLogEstimator::ALL {
            let est = ull.distinct_count_estimate_with(estimator);
            assert!(
                (est - 4.0).abs() < 0.1,
                "{estimator:?} estimate {est:.3} deviates from true count 4"
            );
        }
    }

    #[test]
    fn test_custom_ahash_hasher() {
        let ahash = RandomState::with_seeds(1, 2, 3, 4);

        let mut ull = UltraLogLog::new(8).unwrap();

        ull.add_value_with_build_hasher("apple", &ahash)
            .add_value_with_build_hasher("banana", &ahash)
            .add_value_with_build_hasher("cherry", &ahash);

        let est = ull.distinct_count_estimate();
        assert!(
            (est - 3.0).abs() < 0.1,
            "estimate {:.3} deviates from true count 3",
            est
        );

        // same hasher, same value: no change
        let before = ull.clone();
        ull.add_value_with("banana", Some(&ahash));
        assert_eq!(ull, before);

        let mut with_default = UltraLogLog::new(8).unwrap();
        with_default.add_value_with("banana", None::<&RandomState>);
        let mut xxh3 = UltraLogLog::new(8).unwrap();
        xxh3.add_value("banana");
        assert_eq!(with_default, xxh3);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_save_and_load() {
        use std::fs::{remove_file, File};
        use std::io::{BufReader, BufWriter};

        let file_path = "test_ultraloglog.bin";

        let mut ull = UltraLogLog::new(5).expect("Failed to create ULL");
        ull.add(123456789);
        ull.add(987654321);
        let original_estimate = ull.distinct_count_estimate();
        assert!(original_estimate > 0.0);

        let file = File::create(file_path).expect("Failed to create file");
        let writer = BufWriter::new(file);
        ull.save(writer).expect("Failed to save UltraLogLog");

        let file = File::open(file_path).expect("Failed to open file");
        let reader = BufReader::new(file);
        let loaded_ull = UltraLogLog::load(reader).expect("Failed to load UltraLogLog");

        assert_eq!(loaded_ull, ull);
        assert_eq!(loaded_ull.distinct_count_estimate(), original_estimate);

        remove_file(file_path).ok();
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_two_sketches_in_one_stream() {
        use std::io::Cursor;
        const P: u32 = 8;

        let mut s1 = UltraLogLog::new(P).expect("alloc sketch");
        for word in ["apple", "banana", "cherry", "dragonfruit"] {
            s1.add_value(word);
        }
        let mut s2 = UltraLogLog::new(P).expect("alloc sketch");
        for word in ["alpha", "beta", "delta"] {
            s2.add_value(word);
        }

        let mut buffer = Vec::new();
        s1.save(&mut buffer).expect("save s1");
        s2.save(&mut buffer).expect("save s2");

        let mut reader = Cursor::new(buffer);
        let s1_loaded = UltraLogLog::load(&mut reader).expect("load first sketch");
        let s2_loaded = UltraLogLog::load(&mut reader).expect("load second sketch");

        let est1 = s1_loaded.distinct_count_estimate();
        let est2 = s2_loaded.distinct_count_estimate();
        println!("Set 1 (fruit)  estimate ≈ {:.3}", est1);
        println!("Set 2 (alpha…) estimate ≈ {:.3}", est2);

        assert!((est1 - 4.0).abs() < 0.1, "set 1 estimate {est1} not close to 4");
        assert!((est2 - 3.0).abs() < 0.1, "set 2 estimate {est2} not close to 3");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_load_rejects_invalid_state_length() {
        let invalid = UltraLogLog { state: vec![0; 12] };
        let mut buffer = Vec::new();
        invalid.save(&mut buffer).unwrap();
        let err = UltraLogLog::load(buffer.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
