//! Keyed bijections over power-of-two index domains.
//!
//! The shuffle evaluates a Feistel-style network over every index of
//! `[0, 2^bits)`; because each round is invertible the whole network is a
//! permutation of the domain, and no permutation table is ever stored.

/// Upper bound on the number of Feistel rounds.
pub const MAX_ROUNDS: u32 = 4;

/// Permuted congruential generator hash.
#[inline]
pub fn pcg_hash(value: u32) -> u32 {
    let state = value.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Per-round keys derived by iterated hashing of the caller's key. Unused
/// slots stay zero.
pub fn round_keys(key: u32, rounds: u32) -> [u32; MAX_ROUNDS as usize] {
    let mut keys = [0u32; MAX_ROUNDS as usize];
    let mut previous = key;
    let mut i = 0;
    while i < clamp_rounds(rounds) as usize {
        previous = pcg_hash(previous);
        keys[i] = previous;
        i += 1;
    }
    keys
}

#[inline]
pub fn clamp_rounds(rounds: u32) -> u32 {
    if rounds < 1 {
        1
    } else if rounds > MAX_ROUNDS {
        MAX_ROUNDS
    } else {
        rounds
    }
}

/// A Feistel network over `left_bits + right_bits` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feistel {
    pub left_bits: u32,
    pub left_mask: u32,
    pub right_bits: u32,
    pub right_mask: u32,
    pub rounds: u32,
    pub keys: [u32; MAX_ROUNDS as usize],
}

impl Feistel {
    /// Builds the network permuting `[0, domain)`. `domain` must be a power of
    /// two.
    pub fn new(domain: u32, key: u32, rounds: u32) -> Self {
        let total_bits = domain.trailing_zeros();
        let left_bits = total_bits / 2;
        let right_bits = total_bits - left_bits;
        let rounds = clamp_rounds(rounds);
        Self {
            left_bits,
            left_mask: (1u32 << left_bits) - 1,
            right_bits,
            right_mask: (1u32 << right_bits) - 1,
            rounds,
            keys: round_keys(key, rounds),
        }
    }

    /// The image of `value` under the network.
    ///
    /// Each round mixes the left half with a hash of the right half, offsets
    /// the right half by the round key, then swaps the halves. Every step is
    /// invertible on its own half.
    #[inline]
    pub fn permute(&self, value: u32) -> u32 {
        let mut state = value;
        let mut round = 0;
        while round < self.rounds as usize {
            let key = self.keys[round];
            let left = state >> self.right_bits;
            let right = state & self.right_mask;
            let left = (left ^ pcg_hash(right ^ key)) & self.left_mask;
            let right = right.wrapping_add(key) & self.right_mask;
            state = (right << self.left_bits) | left;
            round += 1;
        }
        state
    }
}

#[cfg(all(test, not(target_os = "cuda")))]
mod tests {
    use super::*;

    fn image(domain: u32, key: u32, rounds: u32) -> Vec<u32> {
        let feistel = Feistel::new(domain, key, rounds);
        (0..domain).map(|i| feistel.permute(i)).collect()
    }

    #[test]
    fn permutes_every_domain_size() {
        for bits in 0..=12 {
            let domain = 1u32 << bits;
            for rounds in 1..=4 {
                let mut out = image(domain, 17, rounds);
                out.sort_unstable();
                assert_eq!(out, (0..domain).collect::<Vec<_>>(), "bits {bits} rounds {rounds}");
            }
        }
    }

    #[test]
    fn depends_on_key() {
        assert_ne!(image(1024, 1, 2), image(1024, 2, 2));
    }

    #[test]
    fn rounds_are_clamped() {
        assert_eq!(Feistel::new(64, 3, 0).rounds, 1);
        assert_eq!(Feistel::new(64, 3, 9).rounds, 4);
        assert_eq!(round_keys(3, 9), round_keys(3, 4));
    }

    #[test]
    fn round_keys_chain_hashes() {
        let keys = round_keys(42, 3);
        assert_eq!(keys[0], pcg_hash(42));
        assert_eq!(keys[1], pcg_hash(keys[0]));
        assert_eq!(keys[2], pcg_hash(keys[1]));
        assert_eq!(keys[3], 0);
    }
}
