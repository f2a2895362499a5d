//! Numeric helpers shared by [`HyperLogLog`](crate::HyperLogLog) and
//! [`UltraLogLog`](crate::UltraLogLog).

use log::warn;

use crate::error::{Error, Result};

/// Upper bound on the secant steps of [`solve_maximum_likelihood_equation`].
pub const ML_SOLVER_MAX_ITERATIONS: u32 = 100;

/// Largest precision parameter representable in a token.
pub(crate) const TOKEN_PARAMETER: u32 = 26;

// Coefficients of the series expansion of h(x) = 1 - x / (e^x - 1) around 0
const C0: f64 = -1.0 / 3.0;
const C1: f64 = 1.0 / 45.0;
const C2: f64 = 1.0 / 472.5;

/// Returns true if `x` has at most one bit set. Zero counts as a power of two.
#[inline]
pub fn is_unsigned_power_of_two(x: u64) -> bool {
    x & x.wrapping_sub(1) == 0
}

pub fn check_precision_parameter(p: u32, min_p: u32, max_p: u32) -> Result<()> {
    if !(min_p..=max_p).contains(&p) {
        return Err(Error::InvalidPrecision {
            p,
            min: min_p,
            max: max_p,
        });
    }
    Ok(())
}

/// Converts an unsigned 64-bit integer to the nearest double.
#[inline]
pub fn unsigned_long_to_double(x: u64) -> f64 {
    x as f64
}

/// Converts a probability scaled by `2^64` back to a double.
#[inline]
pub fn scaled_to_probability(scaled: u128) -> f64 {
    scaled as f64 * f64::from_bits((1023 - 64) << 52)
}

/// `2^-k` for `k` in `0..=1022`.
#[inline]
pub(crate) fn pow2_neg(k: u32) -> f64 {
    f64::from_bits(((1023 - k) as u64) << 52)
}

/// Computes a 32-bit token from a 64-bit hash value.
///
/// The token keeps the 26 most significant bits of the hash and the number of leading zeros of
/// the remaining 38 bits. This is all a sketch with precision parameter up to 26 needs to know.
#[inline]
pub fn compute_token(hash_value: u64) -> u32 {
    let idx = (hash_value >> (64 - TOKEN_PARAMETER)) as u32;
    let nlz = (!((!hash_value) << TOKEN_PARAMETER)).leading_zeros();
    (idx << 6) | nlz
}

/// Returns a hash value that has the same effect on any sketch as the hash the token was computed
/// from.
#[inline]
pub fn reconstruct_hash(token: u32) -> u64 {
    let idx = (token & 0xFFFF_FFC0) as u64;
    let nlz = token & 0x3f;
    (idx << 32) | (0x3F_FFFF_FFFFu64 >> nlz)
}

/// Maximizes
///
/// `e^{-x*a} * (1 - e^{-x})^b[0] * (1 - e^{-x/2})^b[1] * (1 - e^{-x/2^2})^b[2] * ...`
///
/// and returns the maximizing `x`. `a` must be non-negative and `b` shorter than 64 elements.
/// Returns infinity if `a` is zero and zero if all elements of `b` are zero.
///
/// The root of the first derivative is found with the secant method described as Algorithm 8 in
/// Ertl, Otmar. "New cardinality estimation algorithms for HyperLogLog sketches."
/// arXiv preprint arXiv:1702.01284 (2017). The iteration stops once the step is smaller than
/// `relative_error_limit` times `x`, or after [`ML_SOLVER_MAX_ITERATIONS`] steps.
pub fn solve_maximum_likelihood_equation(a: f64, b: &[u32], relative_error_limit: f64) -> f64 {
    solve_maximum_likelihood_equation_with_iterations(a, b, relative_error_limit).0
}

pub(crate) fn solve_maximum_likelihood_equation_with_iterations(
    a: f64,
    b: &[u32],
    relative_error_limit: f64,
) -> (f64, u32) {
    if a == 0.0 {
        return (f64::INFINITY, 0);
    }
    let Some(k_max) = b.iter().rposition(|&t| t != 0) else {
        return (0.0, 0);
    };

    let mut k_min = k_max;
    let mut s1: u64 = 0;
    let mut s2: f64 = 0.0;
    for k in (0..=k_max).rev() {
        let t = b[k];
        if t > 0 {
            s1 += t as u64;
            s2 += t as f64 * 2f64.powi(k as i32);
            k_min = k;
        }
    }
    let s1 = s1 as f64;

    // lower bound of the root, tighter variant for large s2/a
    let mut x = if s2 <= 1.5 * a {
        s1 / (0.5 * s2 + a)
    } else {
        (s2 / a).ln_1p() * (s1 / s2)
    };

    let mut delta_x = x;
    let mut g_previous = 0.0;
    let mut iterations = 0;
    while delta_x > x * relative_error_limit && iterations < ML_SOLVER_MAX_ITERATIONS {
        iterations += 1;

        let raw_x = x.to_bits();
        let kappa = ((raw_x >> 52) & 0x7ff) as i32 - 1021;
        // x_prime = x / 2^(max(k_max, kappa) + 1), in [0, 0.25]
        let shift = (kappa.max(k_max as i32) + 1) as u64;
        let mut x_prime = f64::from_bits(raw_x.wrapping_sub(shift << 52));
        let x_prime2 = x_prime * x_prime;
        let mut h = x_prime + x_prime2 * (C0 + x_prime2 * (C1 - x_prime2 * C2));

        for _ in (k_max as i32)..kappa {
            let h_prime = 1.0 - h;
            h = (x_prime + h * h_prime) / (x_prime + h_prime);
            x_prime += x_prime;
        }
        let mut g = b[k_max] as f64 * h;
        for k in (k_min..k_max).rev() {
            let h_prime = 1.0 - h;
            h = (x_prime + h * h_prime) / (x_prime + h_prime);
            x_prime += x_prime;
            g += b[k] as f64 * h;
        }
        g += x * a;

        if g_previous < g && g <= s1 {
            delta_x *= (g - s1) / (g_previous - g);
        } else {
            delta_x = 0.0;
        }
        x += delta_x;
        g_previous = g;
    }
    if iterations == ML_SOLVER_MAX_ITERATIONS && delta_x > x * relative_error_limit {
        warn!(
            "maximum likelihood solver did not converge after {} iterations (a = {}, x = {})",
            iterations, a, x
        );
    }
    (x, iterations)
}
