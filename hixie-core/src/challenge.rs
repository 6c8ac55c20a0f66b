//! The draft-76 challenge/response computation.
//!
//! A draft-76 client proves it speaks the protocol by sending two key headers
//! and eight raw body bytes. Each key hides a number: its digits, read left to
//! right, divided by the number of spaces it contains. The server answers
//! with the MD5 digest of both numbers (big-endian, 32 bits each) followed by
//! the eight body bytes.
//!
//! # Examples
//!
//! ```
//! use hixie_core::challenge;
//!
//! let digest = challenge::compute(
//!     "4 @1  46546xW%0l 1 5",
//!     "12998 5 Y3 1  .P00",
//!     b"^n:ds[4U",
//! )
//! .unwrap();
//!
//! assert_eq!(&digest, b"8jKS'y:G*Co,Wxa-");
//! ```

use crate::error::ChallengeError;

/// Length of the raw body token that follows the request headers.
pub const KEY3_LEN: usize = 8;

/// Length of the digest written after the `101` response headers.
pub const DIGEST_LEN: usize = 16;

/// Recovers the number hidden in a `Sec-WebSocket-Key1`/`Key2` value.
///
/// # Errors
///
/// Fails when the key has no digits, no spaces, a zero value, a value that
/// is not an exact multiple of the space count, or a quotient that does not
/// fit in 32 bits.
///
/// # Examples
///
/// ```
/// use hixie_core::challenge::extract_number;
/// use hixie_core::error::ChallengeError;
///
/// assert_eq!(extract_number("6 0 "), Ok(30));
/// assert_eq!(extract_number("123"), Err(ChallengeError::NoSpaces));
/// ```
pub fn extract_number(key: &str) -> Result<u32, ChallengeError> {
    let mut spaces: u64 = 0;
    let mut digits = String::with_capacity(key.len());

    for ch in key.chars() {
        if ch == ' ' {
            spaces += 1;
        } else if ch.is_ascii_digit() {
            digits.push(ch);
        }
    }

    if digits.is_empty() {
        return Err(ChallengeError::NotNumeric);
    }
    let value: u64 = digits.parse().map_err(|_| ChallengeError::OutOfRange)?;

    if spaces == 0 {
        return Err(ChallengeError::NoSpaces);
    }
    if value == 0 {
        return Err(ChallengeError::ZeroValue);
    }
    if value % spaces != 0 {
        return Err(ChallengeError::NotDivisible { value, spaces });
    }

    u32::try_from(value / spaces).map_err(|_| ChallengeError::OutOfRange)
}

/// Computes the 16-byte handshake response for the given keys.
///
/// This is a pure function of its inputs.
pub fn compute(
    key1: &str,
    key2: &str,
    key3: &[u8; KEY3_LEN],
) -> Result<[u8; DIGEST_LEN], ChallengeError> {
    let n1 = extract_number(key1)?;
    let n2 = extract_number(key2)?;

    let mut input = [0u8; 4 + 4 + KEY3_LEN];
    input[..4].copy_from_slice(&n1.to_be_bytes());
    input[4..8].copy_from_slice(&n2.to_be_bytes());
    input[8..].copy_from_slice(key3);

    Ok(md5::compute(input).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY1: &str = "4 @1  46546xW%0l 1 5";
    const KEY2: &str = "12998 5 Y3 1  .P00";
    const KEY3: &[u8; 8] = b"^n:ds[4U";

    #[test]
    fn test_extract_number_reference_keys() {
        assert_eq!(extract_number(KEY1), Ok(829_309_203));
        assert_eq!(extract_number(KEY2), Ok(259_970_620));
    }

    #[test]
    fn test_compute_reference_vector() {
        let digest = compute(KEY1, KEY2, KEY3).unwrap();
        assert_eq!(&digest, b"8jKS'y:G*Co,Wxa-");
    }

    #[test]
    fn test_compute_matches_manual_md5() {
        let digest = compute("1 0", "  4", b"abcdefgh").unwrap();

        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(b"abcdefgh");
        assert_eq!(digest, md5::compute(&buf).0);
    }

    #[test]
    fn test_compute_is_deterministic() {
        assert_eq!(compute(KEY1, KEY2, KEY3), compute(KEY1, KEY2, KEY3));
    }

    #[test]
    fn test_no_spaces() {
        assert_eq!(extract_number("12345"), Err(ChallengeError::NoSpaces));
    }

    #[test]
    fn test_zero_value() {
        assert_eq!(extract_number("0 0 0"), Err(ChallengeError::ZeroValue));
    }

    #[test]
    fn test_not_divisible() {
        assert_eq!(
            extract_number("1 0"),
            Ok(10),
            "single space divides everything"
        );
        assert_eq!(
            extract_number("1  1"),
            Err(ChallengeError::NotDivisible {
                value: 11,
                spaces: 2
            })
        );
    }

    #[test]
    fn test_no_digits() {
        assert_eq!(extract_number("  abc "), Err(ChallengeError::NotNumeric));
        assert_eq!(extract_number(""), Err(ChallengeError::NotNumeric));
    }

    #[test]
    fn test_quotient_out_of_range() {
        // 8589934592 = 2^33, one space leaves it above u32::MAX
        assert_eq!(
            extract_number("8589934592 "),
            Err(ChallengeError::OutOfRange)
        );
        assert_eq!(
            extract_number("99999999999999999999999 "),
            Err(ChallengeError::OutOfRange)
        );
    }

    #[test]
    fn test_challenge_error_propagates() {
        assert_eq!(
            compute("123", KEY2, KEY3),
            Err(ChallengeError::NoSpaces)
        );
        assert_eq!(
            compute(KEY1, "0 0", KEY3),
            Err(ChallengeError::ZeroValue)
        );
    }
}
