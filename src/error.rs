use thiserror::Error;

/// Errors reported by sketch construction, merging and the martingale estimator.
///
/// Corrupted register values inside a correctly sized state are never an error. Estimators
/// tolerate arbitrary bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The precision parameter is outside the range supported by the sketch.
    #[error("illegal precision parameter {p}, expected {min}..={max}")]
    InvalidPrecision { p: u32, min: u32, max: u32 },
    /// The byte length does not correspond to any valid precision parameter.
    #[error("illegal state length {0}")]
    InvalidStateLength(usize),
    /// In-place merge of a sketch whose precision is smaller than the receiver's.
    #[error("other has smaller precision ({other_p}) than this sketch ({p})")]
    SmallerPrecision { p: u32, other_p: u32 },
    /// A state change probability outside `[0, 1]` or NaN, kept as raw bits.
    #[error("state change probability {} is not in the range [0,1]", from_bits(.0))]
    InvalidProbability(u64),
    /// A negative or NaN distinct count estimate.
    #[error("distinct count estimate must be non-negative")]
    InvalidEstimate,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_probability(probability: f64) -> Self {
        Error::InvalidProbability(probability.to_bits())
    }
}

fn from_bits(bits: &u64) -> f64 {
    f64::from_bits(*bits)
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            Error::InvalidPrecision { p: 2, min: 3, max: 26 }.to_string(),
            "illegal precision parameter 2, expected 3..=26"
        );
        assert_eq!(
            Error::SmallerPrecision { p: 8, other_p: 7 }.to_string(),
            "other has smaller precision (7) than this sketch (8)"
        );
        assert_eq!(
            Error::invalid_probability(1.5).to_string(),
            "state change probability 1.5 is not in the range [0,1]"
        );
    }

    #[test]
    fn test_into_io_error() {
        let err: std::io::Error = Error::InvalidStateLength(7).into();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "illegal state length 7");
    }
}
