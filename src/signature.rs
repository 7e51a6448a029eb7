//! Page content signatures
//!
//! A [`Signature`] is a content version drawn from one engine-wide counter,
//! so a value is never reused for different bytes during the process
//! lifetime. A fault returns one signature per covered page; callers keep
//! the set from their last upload and compare it with the next fault's set
//! to decide whether the bytes must be copied again.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VbarError};

/// Content version of one page; zero means "never populated"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Signature(pub u64);

impl Signature {
    /// Signature of a page that was never populated
    pub const NONE: Self = Self(0);

    /// Raw value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Per-page signatures covering one faulted byte range, in page order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SignatureSet(Vec<Signature>);

impl SignatureSet {
    /// Wrap a page-ordered sequence
    #[must_use]
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self(signatures)
    }

    /// Number of pages covered
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for an empty range
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Signatures in page order
    #[must_use]
    pub fn as_slice(&self) -> &[Signature] {
        &self.0
    }

    /// Element-wise equality
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::SignatureLengthMismatch)` if the sets cover a
    /// different number of pages.
    pub fn matches(&self, other: &Self) -> Result<bool> {
        if self.len() != other.len() {
            return Err(VbarError::SignatureLengthMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        Ok(self.0 == other.0)
    }

    /// Copy into an ABI output buffer
    ///
    /// # Errors
    ///
    /// Returns `Err(VbarError::InvalidArgument)` if `out` is too short.
    pub fn write_to(&self, out: &mut [u64]) -> Result<()> {
        if out.len() < self.len() {
            return Err(VbarError::InvalidArgument(format!(
                "signature buffer holds {} entries, {} needed",
                out.len(),
                self.len()
            )));
        }
        for (dst, sig) in out.iter_mut().zip(&self.0) {
            *dst = sig.0;
        }
        Ok(())
    }
}

impl From<Vec<u64>> for SignatureSet {
    fn from(raw: Vec<u64>) -> Self {
        Self(raw.into_iter().map(Signature).collect())
    }
}

/// Compare a caller's last known set with a fresh one
///
/// An absent set on either side never matches, which forces the first load.
///
/// # Errors
///
/// Returns `Err(VbarError::SignatureLengthMismatch)` for sets of different
/// lengths.
pub fn signatures_match(
    previous: Option<&SignatureSet>,
    current: Option<&SignatureSet>,
) -> Result<bool> {
    match (previous, current) {
        (Some(a), Some(b)) => a.matches(b),
        _ => Ok(false),
    }
}

/// Output buffer entries needed to fault `size` bytes
///
/// Two spare entries absorb a range that straddles page boundaries.
#[must_use]
pub fn signature_capacity(size: u64, page_size: u64) -> usize {
    (size.div_ceil(page_size) + 2) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(v: &[u64]) -> SignatureSet {
        SignatureSet::from(v.to_vec())
    }

    #[test]
    fn test_equal_sets_match() {
        assert!(set(&[1, 2, 3]).matches(&set(&[1, 2, 3])).unwrap());
        assert!(!set(&[1, 2, 3]).matches(&set(&[1, 9, 3])).unwrap());
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let err = set(&[1, 2]).matches(&set(&[1, 2, 3])).unwrap_err();
        assert_eq!(err, VbarError::SignatureLengthMismatch { left: 2, right: 3 });
    }

    #[test]
    fn test_absent_never_matches() {
        let a = set(&[4]);
        assert!(!signatures_match(None, Some(&a)).unwrap());
        assert!(!signatures_match(Some(&a), None).unwrap());
        assert!(!signatures_match(None, None).unwrap());
        assert!(signatures_match(Some(&a), Some(&a)).unwrap());
        assert!(signatures_match(Some(&a), Some(&set(&[4, 5]))).is_err());
    }

    #[test]
    fn test_capacity() {
        let page = 32 << 20;
        assert_eq!(signature_capacity(1, page), 3);
        assert_eq!(signature_capacity(page, page), 3);
        assert_eq!(signature_capacity(page + 1, page), 4);
        assert_eq!(signature_capacity(0, page), 2);
    }

    #[test]
    fn test_write_to() {
        let mut out = [0u64; 4];
        set(&[7, 8]).write_to(&mut out).unwrap();
        assert_eq!(out, [7, 8, 0, 0]);
        assert!(set(&[1, 2, 3]).write_to(&mut out[..2]).is_err());
    }
}
