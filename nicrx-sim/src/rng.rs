//! Thread-local random number generation for simulation.
//!
//! Every source of randomness in the harness (link latency, workload shape)
//! draws from one seeded ChaCha8 generator per thread, so a seed reproduces
//! a run exactly.

use std::cell::RefCell;

use rand::distributions::{uniform::SampleUniform, Distribution, Standard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

thread_local! {
    static SIM_RNG: RefCell<ChaCha8Rng> = RefCell::new(ChaCha8Rng::seed_from_u64(0));
    static CURRENT_SEED: RefCell<u64> = const { RefCell::new(0) };
}

/// Generate a random value from the simulation RNG.
pub fn sim_random<T>() -> T
where
    Standard: Distribution<T>,
{
    SIM_RNG.with(|rng| rng.borrow_mut().sample(Standard))
}

/// Generate a random value in `range` (exclusive upper bound).
///
/// # Example
///
/// ```rust
/// use nicrx_sim::rng::{set_sim_seed, sim_random_range};
///
/// set_sim_seed(42);
/// let pid = sim_random_range(0..4u16);
/// assert!(pid < 4);
/// ```
pub fn sim_random_range<T>(range: std::ops::Range<T>) -> T
where
    T: SampleUniform + PartialOrd,
{
    SIM_RNG.with(|rng| rng.borrow_mut().gen_range(range))
}

/// Like [`sim_random_range`], returning the start when the range is empty.
pub fn sim_random_range_or_default<T>(range: std::ops::Range<T>) -> T
where
    T: SampleUniform + PartialOrd + Clone,
{
    if range.start >= range.end {
        range.start
    } else {
        sim_random_range(range)
    }
}

/// Return `true` with probability `p`.
pub fn sim_chance(p: f64) -> bool {
    p > 0.0 && sim_random::<f64>() < p
}

/// Shuffle `items` in place (Fisher-Yates).
pub fn sim_shuffle<T>(items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = sim_random_range(0..i + 1);
        items.swap(i, j);
    }
}

/// Seed the simulation RNG.
pub fn set_sim_seed(seed: u64) {
    SIM_RNG.with(|rng| {
        *rng.borrow_mut() = ChaCha8Rng::seed_from_u64(seed);
    });
    CURRENT_SEED.with(|current| {
        *current.borrow_mut() = seed;
    });
}

/// Seed last set with [`set_sim_seed`], for failure reports.
pub fn get_current_sim_seed() -> u64 {
    CURRENT_SEED.with(|current| *current.borrow())
}

/// Put the RNG back into its initial state.
pub fn reset_sim_rng() {
    set_sim_seed(0);
}
