// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Variational Bayes kernels shared by the subclone and single-cell models,
//! plus seed construction. Kernels work on raw `f64` log values; `LogProb`
//! appears only at the model boundaries.

use rand::Rng;

pub(crate) mod mixture;
pub(crate) mod mixture_mixture;

#[derive(Debug, Clone, Copy)]
pub(crate) struct VariationalBayesOptions {
    pub epsilon: f64,
    pub max_iterations: usize,
    pub save_memory: bool,
    pub parallel: bool,
}

impl Default for VariationalBayesOptions {
    fn default() -> Self {
        VariationalBayesOptions {
            epsilon: 0.05,
            max_iterations: 1000,
            save_memory: false,
            parallel: false,
        }
    }
}

pub(crate) fn ln_sum_exp_raw(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Normalise raw log probabilities in place; returns the log normaliser.
pub(crate) fn normalise_ln(values: &mut [f64]) -> f64 {
    let norm = ln_sum_exp_raw(values);
    if norm == f64::NEG_INFINITY {
        let uniform = -(values.len() as f64).ln();
        values.iter_mut().for_each(|v| *v = uniform);
    } else {
        values.iter_mut().for_each(|v| *v -= norm);
    }
    norm
}

pub(crate) fn log_uniform_seed(n: usize) -> Vec<f64> {
    vec![-(n as f64).ln(); n]
}

/// A seed concentrated on one candidate.
pub(crate) fn make_point_seed(n: usize, idx: usize, p: f64) -> Vec<f64> {
    if n == 1 {
        return vec![0.0];
    }
    let mut seed = vec![((1.0 - p) / (n - 1) as f64).ln(); n];
    seed[idx] = p.ln();
    seed
}

/// Dirichlet(1) draws as random restart seeds.
pub(crate) fn make_random_seeds<R: Rng>(n: usize, count: usize, rng: &mut R) -> Vec<Vec<f64>> {
    (0..count)
        .map(|_| {
            // Exponential(1) weights, log-normalised.
            let mut seed: Vec<f64> = (0..n)
                .map(|_| {
                    let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
                    (-u.ln()).max(f64::MIN_POSITIVE).ln()
                })
                .collect();
            normalise_ln(&mut seed);
            seed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_ln_sum_exp_raw() {
        let values = vec![0.5f64.ln(), 0.25f64.ln(), 0.25f64.ln()];
        assert_relative_eq!(ln_sum_exp_raw(&values), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_point_seed_masses() {
        let seed = make_point_seed(4, 2, 0.9999);
        let total: f64 = seed.iter().map(|v| v.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        assert!(seed[2] > seed[0]);
    }

    #[test]
    fn test_random_seeds_normalised() {
        let mut rng = StdRng::seed_from_u64(7);
        for seed in make_random_seeds(5, 3, &mut rng) {
            let total: f64 = seed.iter().map(|v| v.exp()).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }
}
