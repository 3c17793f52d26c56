//! Parsing helpers shared by the fixed-width byte types

use crate::error::CoreError;

pub(crate) fn fixed<const N: usize>(slice: &[u8]) -> Result<[u8; N], CoreError> {
    slice.try_into().map_err(|_| CoreError::InvalidLength {
        expected: N,
        got: slice.len(),
    })
}

/// Accepts an optional `0x` prefix
pub(crate) fn fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], CoreError> {
    let bytes = hex::decode(s.trim_start_matches("0x"))?;
    fixed(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width() {
        assert_eq!(fixed::<2>(&[1, 2]).unwrap(), [1, 2]);
        assert!(matches!(
            fixed::<4>(&[1, 2]),
            Err(CoreError::InvalidLength {
                expected: 4,
                got: 2
            })
        ));
        assert_eq!(fixed_hex::<2>("0x0a0b").unwrap(), [10, 11]);
        assert!(matches!(fixed_hex::<2>("zz"), Err(CoreError::Hex(_))));
    }
}
