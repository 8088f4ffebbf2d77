//! Simple deterministic PRNG for timestep sampling and epoch shuffling.
//!
//! A lightweight splitmix64 generator. All randomness in a run (timesteps,
//! epoch order and the Gaussian noise fed to the model) comes from here, so
//! a seed reproduces a run on any device.

/// Deterministic PRNG based on splitmix64.
///
/// # Example
///
/// ```
/// use ddpm_core::SimpleRng;
///
/// let mut rng = SimpleRng::new(42);
/// let t = rng.next_timestep(600);
/// assert!((1..=600).contains(&t));
/// ```
#[derive(Debug, Clone)]
pub struct SimpleRng(u64);

impl SimpleRng {
    /// Creates a new PRNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    /// Returns the next pseudo-random u64.
    pub fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Returns a uniform f32 in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / ((1u64 << 24) as f32)
    }

    /// Returns a uniform integer in `0..n`. `n` must be non-zero.
    pub fn next_below(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        // Lemire's multiply-shift, bias is negligible for n << 2^64
        ((self.next_u64() as u128 * n as u128) >> 64) as usize
    }

    /// Returns a diffusion timestep uniform in `1..=n_t`.
    pub fn next_timestep(&mut self, n_t: usize) -> usize {
        1 + self.next_below(n_t)
    }

    /// Returns a standard normal sample (Box–Muller).
    pub fn next_gaussian(&mut self) -> f32 {
        // shift into (0, 1] so ln never sees zero
        let u1 = 1.0 - self.next_f32();
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    }

    /// Returns `n` standard normal samples.
    pub fn gaussian_vec(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.next_gaussian()).collect()
    }

    /// Fisher–Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_below(i + 1);
            items.swap(i, j);
        }
    }
}
