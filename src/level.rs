// Copyright (c) 2025 SkipSet Contributors
//
// Tower-height generator
//
// Every insert draws the new node's tower height from a truncated geometric
// distribution: each level is kept with probability 1/2, capped at
// MAX_LEVEL. The generator state is thread-local, so concurrent workers
// never contend on it, and each thread's seed mixes the wall clock with a
// per-thread token so workers spawned in the same clock tick still diverge.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::MAX_LEVEL;

/// Hands every thread a distinct token to fold into its seed.
static SEED_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(seed_state());
}

fn seed_state() -> u64 {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let token = SEED_TOKEN.fetch_add(1, Ordering::Relaxed);
    let seed = clock ^ token.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    // xorshift state must be nonzero
    if seed == 0 {
        0x1234_5678_9abc_def0
    } else {
        seed
    }
}

/// xorshift64 step on the thread-local state
fn next_u64(state: &Cell<u64>) -> u64 {
    let mut x = state.get();
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    state.set(x);
    x
}

/// Draw a tower height in `[0, MAX_LEVEL]`.
///
/// Returns 0 with probability 1/2, 1 with probability 1/4, and so on,
/// truncated at `MAX_LEVEL`.
pub fn random_level() -> usize {
    RNG_STATE.with(|state| {
        let mut level = 0;
        while level < MAX_LEVEL && next_u64(state) & 1 == 0 {
            level += 1;
        }
        level
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_levels_in_range() {
        for _ in 0..10_000 {
            let level = random_level();
            assert!(level <= MAX_LEVEL);
        }
    }

    #[test]
    fn test_geometric_shape() {
        let draws = 100_000;
        let mut zero = 0usize;
        let mut tall = 0usize;
        for _ in 0..draws {
            let level = random_level();
            if level == 0 {
                zero += 1;
            }
            if level >= 4 {
                tall += 1;
            }
        }
        // P(level == 0) = 1/2, P(level >= 4) = 1/16; allow wide slack.
        assert!(zero > draws * 4 / 10 && zero < draws * 6 / 10);
        assert!(tall > draws / 32 && tall < draws / 8);
    }

    #[test]
    fn test_cap_is_reachable() {
        // P(miss in 2^21 draws) = (1 - 2^-16)^(2^21) ~ e^-32.
        let hit = (0..1 << 21).any(|_| random_level() == MAX_LEVEL);
        assert!(hit);
    }

    #[test]
    fn test_threads_draw_independently() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    let mut total = 0usize;
                    for _ in 0..1_000 {
                        total += random_level();
                    }
                    total
                })
            })
            .collect();

        for handle in handles {
            // Mean level is ~1, so 1k draws land far from zero.
            let total = handle.join().unwrap();
            assert!(total > 0);
        }
    }
}
