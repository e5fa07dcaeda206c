use digest::Digest;
use sha2::Sha256;

use crate::prelude::*;

/// Number of entries per node when no branch factor is configured.
pub const DEFAULT_BRANCH_FACTOR: u32 = 16;

/// A pluggable layer function: maps a key to the layer it lives at for the
/// given branch factor. Must be a pure function of the key's content, stable
/// across runs and processes.
pub type LayerFn<K> = dyn Fn(&K, u32) -> Result<u8> + Send + Sync;

/// The layer the given canonically-encoded key lives at.
///
/// Hashes the bytes and counts trailing zero digits of the digest read as a
/// base-`branch_factor` numeral. In expectation a `1/branch_factor^L`
/// fraction of keys lands at layer >= L, which is what keeps tree height
/// logarithmic in the entry count.
pub fn layer_of_encoded<D: Digest>(encoded_key: &[u8], branch_factor: u32) -> u8 {
    let digest = D::digest(encoded_key);
    trailing_zero_digits(digest.as_ref(), branch_factor)
}

/// Default layer function: SHA-256 over the canonical key encoding.
pub fn default_layer(encoded_key: &[u8], branch_factor: u32) -> u8 {
    layer_of_encoded::<Sha256>(encoded_key, branch_factor)
}

/// Counts how many times `base` divides the big-endian integer in `digits`.
///
/// The all-zero value is divisible indefinitely and saturates at `u8::MAX`.
fn trailing_zero_digits(digest: &[u8], base: u32) -> u8 {
    debug_assert!(base >= 2);
    let base = u64::from(base);
    let mut digits = digest.to_vec();
    let mut layer: u8 = 0;
    loop {
        if digits.iter().all(|b| *b == 0) {
            return u8::MAX;
        }
        let mut rem: u64 = 0;
        for b in digits.iter_mut() {
            let cur = rem * 256 + u64::from(*b);
            *b = (cur / base) as u8;
            rem = cur % base;
        }
        if rem != 0 {
            return layer;
        }
        if layer == u8::MAX {
            return layer;
        }
        layer += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn trailing_zeros_by_hand() {
        // 0x1000 = 4096 = 16^3
        assert_eq!(trailing_zero_digits(&[0x10, 0x00], 16), 3);
        assert_eq!(trailing_zero_digits(&[0x10, 0x01], 16), 0);
        // 256 divides once in base 256
        assert_eq!(trailing_zero_digits(&[0x01, 0x00], 256), 1);
        // 300 = 3 * 100
        assert_eq!(trailing_zero_digits(&[0x01, 0x2c], 10), 2);
        assert_eq!(trailing_zero_digits(&[0x00, 0x00], 16), u8::MAX);
    }

    #[test]
    fn base_16_matches_nibble_count() {
        // For base 16 the digit count is the trailing zero nibbles.
        assert_eq!(trailing_zero_digits(&[0xab, 0xcd, 0x00], 16), 2);
        assert_eq!(trailing_zero_digits(&[0xab, 0xcd, 0x50], 16), 1);
        assert_eq!(trailing_zero_digits(&[0xab, 0xcd, 0x51], 16), 0);
    }

    #[test_strategy::proptest]
    fn layer_is_pure(key: Vec<u8>) {
        prop_assert_eq!(default_layer(&key, 16), default_layer(&key, 16));
    }

    #[test_strategy::proptest]
    fn power_of_two_bases_nest(key: Vec<u8>) {
        // A value divisible by 256^L is divisible by 16^(2L).
        let coarse = default_layer(&key, 256);
        let fine = default_layer(&key, 16);
        prop_assert!(u32::from(fine) >= 2 * u32::from(coarse));
    }

    #[test]
    fn layers_follow_geometric_distribution() {
        let mut at_zero = 0usize;
        let n = 4096usize;
        for i in 0..n {
            let encoded = serde_json::to_vec(&i).unwrap();
            if default_layer(&encoded, 16) == 0 {
                at_zero += 1;
            }
        }
        // Expected fraction at layer 0 is 15/16; allow generous slack.
        assert!(at_zero > n * 8 / 10, "layer 0 count suspiciously low: {at_zero}");
    }
}
