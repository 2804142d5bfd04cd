//! Injectable randomness for scenario branches.
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Source of the random decisions a scenario iteration makes.
///
/// Every pick and every probability gate goes through this trait so tests can
/// script the exact branch an iteration takes.
pub trait RandomSource: Send {
    /// Uniform index in `0..len`. Callers guarantee `len > 0`.
    fn pick(&mut self, len: usize) -> usize;

    /// `true` with probability `p`.
    fn chance(&mut self, p: f64) -> bool;
}

/// [`RandomSource`] backed by [`StdRng`].
#[derive(Debug, Clone)]
pub struct StdRandom(StdRng);

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    /// Stream for one iteration of one virtual user, derived from a run seed.
    ///
    /// Without a run seed every iteration draws from fresh entropy.
    pub fn for_iteration(seed: Option<u64>, vu: usize, iteration: u64) -> Self {
        match seed {
            Some(seed) => {
                let mixed = seed
                    ^ (vu as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
                    ^ iteration.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
                Self::seeded(mixed)
            }
            None => Self::from_entropy(),
        }
    }
}

impl RandomSource for StdRandom {
    fn pick(&mut self, len: usize) -> usize {
        self.0.gen_range(0..len)
    }

    fn chance(&mut self, p: f64) -> bool {
        self.0.gen_bool(p.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_streams_repeat() {
        let mut a = StdRandom::for_iteration(Some(7), 3, 11);
        let mut b = StdRandom::for_iteration(Some(7), 3, 11);
        let xs: Vec<_> = (0..20).map(|_| a.pick(100)).collect();
        let ys: Vec<_> = (0..20).map(|_| b.pick(100)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn chance_edges_are_certain() {
        let mut rng = StdRandom::seeded(1);
        assert!((0..100).all(|_| rng.chance(1.0)));
        assert!((0..100).all(|_| !rng.chance(0.0)));
        assert!((0..100).all(|_| !rng.chance(-3.0)));
    }
}
