use std::fmt;

use thiserror::Error;

/// Last octet of an internal host's address, known to lie within the
/// configured host bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostId(u8);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("'{0}' is not a number")]
    NotNumeric(String),

    #[error("{value} is outside of the range {min}-{max}")]
    OutOfRange { value: u64, min: u64, max: u64 },

    #[error("range start {first} is after range end {last}")]
    InvertedRange { first: HostId, last: HostId },
}

impl HostId {
    /// Accepts only plain decimal digits within `[min, max]`.
    pub fn validate(input: &str, min: u8, max: u8) -> Result<Self, ValidationError> {
        let value = parse_digits(input)?;

        if value < u64::from(min) || value > u64::from(max) {
            return Err(ValidationError::OutOfRange {
                value,
                min: min.into(),
                max: max.into(),
            });
        }

        Ok(Self(value as u8))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    pub fn check_range(first: HostId, last: HostId) -> Result<(), ValidationError> {
        if first > last {
            return Err(ValidationError::InvertedRange { first, last });
        }

        Ok(())
    }

    /// All hosts in `[first, last]`.
    pub fn range(
        first: HostId,
        last: HostId,
    ) -> Result<impl Iterator<Item = HostId>, ValidationError> {
        Self::check_range(first, last)?;
        Ok((first.0..=last.0).map(HostId))
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Strict decimal parsing: no sign, no whitespace inside, no empty input.
/// Values too large for `u64` saturate so they are reported as out of range.
pub(crate) fn parse_digits(input: &str) -> Result<u64, ValidationError> {
    let s = input.trim();

    if s.is_empty() || !s.bytes().all(|x| x.is_ascii_digit()) {
        return Err(ValidationError::NotNumeric(input.to_owned()));
    }

    Ok(s.parse().unwrap_or(u64::MAX))
}

#[cfg(test)]
impl HostId {
    pub fn new_unchecked(x: u8) -> Self {
        Self(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bounds() {
        assert_eq!(HostId::validate("100", 100, 250).map(|x| x.get()), Ok(100));
        assert_eq!(HostId::validate(" 250\n", 100, 250).map(|x| x.get()), Ok(250));
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(
            HostId::validate("999", 100, 250),
            Err(ValidationError::OutOfRange {
                value: 999,
                min: 100,
                max: 250
            })
        );
        assert!(HostId::validate("99", 100, 250).is_err());
        assert!(HostId::validate("99999999999999999999999", 100, 250).is_err());
    }

    #[test]
    fn rejects_non_digits() {
        for x in ["", "abc", "-100", "+100", "1 00", "10.5"] {
            assert_eq!(
                HostId::validate(x, 100, 250),
                Err(ValidationError::NotNumeric(x.to_owned())),
                "{x:?}"
            );
        }
    }

    #[test]
    fn inverted_range() {
        let a = HostId::new_unchecked(110);
        let b = HostId::new_unchecked(105);

        assert_eq!(
            HostId::check_range(a, b),
            Err(ValidationError::InvertedRange { first: a, last: b })
        );
        assert!(HostId::range(a, b).is_err());
        assert_eq!(HostId::check_range(a, a), Ok(()));
        assert_eq!(HostId::range(b, a).unwrap().count(), 6);
    }
}
