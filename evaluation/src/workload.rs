use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;

/// Seeded key generators for the evaluation streams.
pub enum Workload {
    /// Keys drawn uniformly from `[0, universe)`.
    Uniform { rng: ChaChaRng, universe: u64 },
    /// Keys in `1..=universe` with `P(k) ∝ 1 / k^alpha`.
    Zipf { rng: ChaChaRng, cdf: Vec<f64> },
}

impl Workload {
    pub fn uniform(universe: u64, seed: u64) -> Self {
        Workload::Uniform {
            rng: ChaChaRng::seed_from_u64(seed),
            universe,
        }
    }

    pub fn zipf(universe: u64, alpha: f64, seed: u64) -> Self {
        let mut cdf = Vec::with_capacity(universe as usize);
        let mut norm = 0.0;

        for k in 1..=universe {
            norm += 1.0 / (k as f64).powf(alpha);
            cdf.push(norm);
        }

        cdf.iter_mut().for_each(|p| *p /= norm);

        Workload::Zipf {
            rng: ChaChaRng::seed_from_u64(seed),
            cdf,
        }
    }

    pub fn sample(&mut self) -> u64 {
        match self {
            Workload::Uniform { rng, universe } => rng.gen_range(0, *universe),
            Workload::Zipf { rng, cdf } => {
                let u: f64 = rng.gen();

                let rank = cdf.partition_point(|p| *p < u);

                rank.min(cdf.len() - 1) as u64 + 1
            },
        }
    }
}
