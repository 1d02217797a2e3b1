//! Seeded deterministic shuffle
//!
//! Listing pages are shuffled so the catalog doesn't always lead with the
//! same rows, but the ordering must be stable while a client pages through
//! it. The seed string is hashed to a u64, the full matching id set is
//! permuted with a seeded RNG, and pagination slices the permutation. Same
//! seed and same input always give the same order, so page N+1 never repeats
//! or skips items from page N.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Derive a u64 RNG seed from an arbitrary seed string.
fn seed_to_u64(seed: &str) -> u64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Fisher-Yates over the whole slice with a seed-derived RNG.
pub fn shuffle_seeded<T>(items: &mut [T], seed: &str) {
    let mut rng = SmallRng::seed_from_u64(seed_to_u64(seed));
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Generate a fresh seed for callers that didn't supply one. The value is
/// echoed back in the response so subsequent pages can reuse it.
pub fn generate_seed() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_order() {
        let mut a: Vec<u32> = (0..100).collect();
        let mut b: Vec<u32> = (0..100).collect();
        shuffle_seeded(&mut a, "k9f2");
        shuffle_seeded(&mut b, "k9f2");
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_seed_different_order() {
        let mut a: Vec<u32> = (0..100).collect();
        let mut b: Vec<u32> = (0..100).collect();
        shuffle_seeded(&mut a, "k9f2");
        shuffle_seeded(&mut b, "z41x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let mut items: Vec<u32> = (0..50).collect();
        shuffle_seeded(&mut items, "seed");
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_pages_of_one_permutation_are_disjoint() {
        let mut items: Vec<u32> = (0..40).collect();
        shuffle_seeded(&mut items, "page-seed");
        let page1: Vec<u32> = items[0..10].to_vec();
        let page2: Vec<u32> = items[10..20].to_vec();
        assert!(page1.iter().all(|i| !page2.contains(i)));
    }

    #[test]
    fn test_empty_and_single_are_fine() {
        let mut empty: Vec<u32> = vec![];
        shuffle_seeded(&mut empty, "s");
        assert!(empty.is_empty());

        let mut one = vec![7u32];
        shuffle_seeded(&mut one, "s");
        assert_eq!(one, vec![7]);
    }

    #[test]
    fn test_generated_seed_is_nonempty_hex() {
        let seed = generate_seed();
        assert_eq!(seed.len(), 16);
        assert!(seed.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
