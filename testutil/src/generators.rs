/// Test data generators

use proptest::prelude::*;
use rand::Rng;

/// Key material for committee member `index`; distinct and stable across runs
pub fn key_seed(index: u32) -> [u8; 32] {
    let mut seed = [0x5a; 32];
    seed[..4].copy_from_slice(&index.to_be_bytes());
    seed
}

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// Random 32-byte block identifier
pub fn random_block_id() -> [u8; 32] {
    rand::thread_rng().gen()
}

/// Delivery schedule for the votes of `n` signers
///
/// Every signer appears at least once, in shuffled order, followed by up
/// to `n` redeliveries of signers already seen.
pub fn delivery_schedule(n: u32) -> impl Strategy<Value = Vec<u32>> {
    let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
    let redeliveries = proptest::collection::vec(0..n.max(1), 0..=n as usize);
    (order, redeliveries).prop_map(|(mut order, redeliveries)| {
        order.extend(redeliveries);
        order
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_seeds_distinct() {
        let seeds: HashSet<_> = (0..100).map(key_seed).collect();
        assert_eq!(seeds.len(), 100);
        assert_eq!(key_seed(7), key_seed(7));
    }

    #[test]
    fn test_random_bytes_len() {
        assert_eq!(random_bytes(48).len(), 48);
    }

    proptest! {
        #[test]
        fn prop_schedule_covers_every_signer(schedule in delivery_schedule(7)) {
            let seen: HashSet<_> = schedule.iter().copied().collect();
            prop_assert_eq!(seen.len(), 7);
            prop_assert!(schedule.len() <= 14);
        }
    }
}
