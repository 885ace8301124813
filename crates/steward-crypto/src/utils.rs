//! Constant-time comparison utilities.
//!
//! All signature and MAC comparisons go through these helpers so the
//! comparison result leaks no timing information.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// # Example
///
/// ```rust
/// use steward_crypto::utils::constant_time_compare;
///
/// let tag1 = [0u8; 32];
/// let tag2 = [0u8; 32];
/// assert!(constant_time_compare(&tag1, &tag2));
///
/// let tag3 = [1u8; 32];
/// assert!(!constant_time_compare(&tag1, &tag3));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}
