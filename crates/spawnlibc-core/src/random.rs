//! Randomness for exploit-mitigation layout choices.
//!
//! Thread creation randomizes the gap above each stack, the stack top within
//! its first bytes, and the shadow call stack slot. All of these draw from a
//! [`RandomSource`] so the layout code stays a pure function of its inputs.

use core::sync::atomic::{AtomicU64, Ordering};

/// Source of uniformly distributed random words.
pub trait RandomSource: Sync {
    /// Next 64 random bits.
    fn next_u64(&self) -> u64;

    /// Uniform value in `0..upper`, without modulo bias.
    ///
    /// Returns 0 when `upper < 2`, matching `arc4random_uniform`.
    fn uniform(&self, upper: usize) -> usize {
        let upper = upper as u64;
        if upper < 2 {
            return 0;
        }
        // Reject the low `2^64 % upper` values so every residue is equally likely.
        let min = upper.wrapping_neg() % upper;
        loop {
            let r = self.next_u64();
            if r >= min {
                return (r % upper) as usize;
            }
        }
    }
}

/// Lock-free SplitMix64 generator.
///
/// Deterministic for a given seed, which the simulation backend relies on;
/// the kernel-backed source uses it as a fallback when `getrandom` is
/// unavailable.
#[derive(Debug)]
pub struct SplitMix64 {
    state: AtomicU64,
}

impl SplitMix64 {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: AtomicU64::new(seed),
        }
    }
}

impl RandomSource for SplitMix64 {
    fn next_u64(&self) -> u64 {
        let mut z = self
            .state
            .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Kernel CSPRNG via `getrandom(2)`, non-blocking.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[derive(Debug)]
pub struct KernelRandom {
    fallback: SplitMix64,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl KernelRandom {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fallback: SplitMix64::new(0x5EED_0F_7EAD_5EED),
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl Default for KernelRandom {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl RandomSource for KernelRandom {
    fn next_u64(&self) -> u64 {
        const GRND_NONBLOCK: u32 = 0x1;
        let mut buf = [0u8; 8];
        loop {
            match crate::syscall::sys_getrandom(&mut buf, GRND_NONBLOCK) {
                Ok(8) => return u64::from_ne_bytes(buf),
                Err(crate::errno::EINTR) => continue,
                // Early boot (pool not initialized) or a seccomp filter.
                _ => {
                    let stack_addr = &buf as *const [u8; 8] as u64;
                    return self.fallback.next_u64() ^ stack_addr.rotate_left(17);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl RandomSource for Fixed {
        fn next_u64(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn uniform_below_two_is_zero() {
        let rng = SplitMix64::new(1);
        assert_eq!(rng.uniform(0), 0);
        assert_eq!(rng.uniform(1), 0);
    }

    #[test]
    fn uniform_stays_in_range_and_varies() {
        let rng = SplitMix64::new(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let v = rng.uniform(10);
            assert!(v < 10);
            seen.insert(v);
        }
        assert_eq!(seen.len(), 10, "all residues should appear");
    }

    #[test]
    fn uniform_reduces_accepted_word() {
        assert_eq!(Fixed(u64::MAX).uniform(7), (u64::MAX % 7) as usize);
    }

    #[test]
    fn splitmix_is_deterministic_per_seed() {
        let a = SplitMix64::new(7);
        let b = SplitMix64::new(7);
        for _ in 0..8 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn kernel_random_produces_distinct_words() {
        let rng = KernelRandom::new();
        assert_ne!(rng.next_u64(), rng.next_u64());
    }
}
