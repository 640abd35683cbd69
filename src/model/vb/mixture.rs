// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Variational mixture kernel for the subclone model, monomorphised over the
//! ploidy `K`.
//!
//! One latent genotype is shared by all samples; each sample draws every read
//! from one of the genotype's `K` haplotype copies with sample-specific
//! Dirichlet mixture weights (modelling subclonal fractions and allelic
//! dropout). Coordinate ascent updates read responsibilities, Dirichlet
//! concentrations and the genotype posterior in turn; the evidence lower
//! bound is monotonically non-decreasing over iterations.

use bio::stats::LogProb;
use rayon::prelude::*;
use statrs::function::gamma::{digamma, ln_gamma};

use super::{normalise_ln, VariationalBayesOptions};
use crate::utils::CancellationToken;

/// `likelihoods[sample][genotype][k]` is the read-indexed log likelihood
/// vector of the genotype's k-th haplotype copy for that sample.
pub(crate) type MixtureLikelihoods<'a, const K: usize> = Vec<Vec<[&'a [LogProb]; K]>>;

#[derive(Debug, Clone)]
pub(crate) struct MixtureLatents {
    /// Normalised genotype log posteriors.
    pub genotype_log_posteriors: Vec<f64>,
    /// Posterior Dirichlet concentrations per sample.
    pub alphas: Vec<Vec<f64>>,
    pub log_evidence: f64,
    pub converged: bool,
}

fn ln_beta(alpha: &[f64]) -> f64 {
    alpha.iter().map(|&a| ln_gamma(a)).sum::<f64>() - ln_gamma(alpha.iter().sum())
}

fn expected_ln_weights<const K: usize>(alpha: &[f64; K]) -> [f64; K] {
    let total = digamma(alpha.iter().sum());
    std::array::from_fn(|k| digamma(alpha[k]) - total)
}

struct SeedRun<'a, const K: usize> {
    genotype_log_priors: &'a [f64],
    likelihoods: &'a MixtureLikelihoods<'a, K>,
    prior_alphas: &'a [[f64; K]],
    /// Normalised genotype log posteriors, `q(g)`.
    q: Vec<f64>,
    alphas: Vec<[f64; K]>,
    /// `responsibilities[sample][read][k]`; empty in the memory-saving path,
    /// which instead re-derives them from the pre-sweep state below.
    responsibilities: Vec<Vec<[f64; K]>>,
    prev_q: Vec<f64>,
    prev_eln_w: Vec<[f64; K]>,
    save_memory: bool,
}

impl<'a, const K: usize> SeedRun<'a, K> {
    fn new(
        genotype_log_priors: &'a [f64],
        likelihoods: &'a MixtureLikelihoods<'a, K>,
        prior_alphas: &'a [[f64; K]],
        seed: Vec<f64>,
        save_memory: bool,
    ) -> Self {
        let n_reads: Vec<usize> = likelihoods
            .iter()
            .map(|sample| sample.first().map_or(0, |g| g[0].len()))
            .collect();
        let prev_q = seed.clone();
        let prev_eln_w = prior_alphas.iter().map(expected_ln_weights).collect();
        SeedRun {
            genotype_log_priors,
            likelihoods,
            prior_alphas,
            q: seed,
            alphas: prior_alphas.to_vec(),
            responsibilities: if save_memory {
                Vec::new()
            } else {
                n_reads
                    .iter()
                    .map(|&r| vec![[1.0 / K as f64; K]; r])
                    .collect()
            },
            prev_q,
            prev_eln_w,
            save_memory,
        }
    }

    fn n_samples(&self) -> usize {
        self.likelihoods.len()
    }

    fn n_reads(&self, sample: usize) -> usize {
        self.likelihoods[sample].first().map_or(0, |g| g[0].len())
    }

    /// Expected log likelihood of read `r` on copy `k` under a genotype
    /// distribution: `Σ_g q(g) · L[g][k][r]`.
    fn expected_log_likelihood(&self, q: &[f64], sample: usize, read: usize, k: usize) -> f64 {
        self.likelihoods[sample]
            .iter()
            .zip(q.iter())
            .map(|(genotype, &lq)| lq.exp() * *genotype[k][read])
            .sum()
    }

    fn responsibility(&self, q: &[f64], sample: usize, read: usize, eln_w: &[f64; K]) -> [f64; K] {
        let mut tau: [f64; K] =
            std::array::from_fn(|k| eln_w[k] + self.expected_log_likelihood(q, sample, read, k));
        normalise_ln(&mut tau);
        tau.iter_mut().for_each(|t| *t = t.exp());
        tau
    }

    /// The responsibility of read `r` as computed during the last sweep.
    fn sweep_responsibility(&self, sample: usize, read: usize) -> [f64; K] {
        if self.save_memory {
            self.responsibility(&self.prev_q, sample, read, &self.prev_eln_w[sample])
        } else {
            self.responsibilities[sample][read]
        }
    }

    /// One coordinate-ascent sweep: responsibilities, then concentrations,
    /// then the genotype posterior.
    fn iterate(&mut self) {
        let n_samples = self.n_samples();
        self.prev_q.clone_from(&self.q);
        self.prev_eln_w = self.alphas.iter().map(expected_ln_weights).collect();
        let mut q_accumulator = vec![0.0f64; self.q.len()];
        for sample in 0..n_samples {
            let eln_w = self.prev_eln_w[sample];
            let mut alpha = self.prior_alphas[sample];
            for read in 0..self.n_reads(sample) {
                let tau = self.responsibility(&self.prev_q, sample, read, &eln_w);
                for k in 0..K {
                    alpha[k] += tau[k];
                    for (slot, genotype) in
                        q_accumulator.iter_mut().zip(self.likelihoods[sample].iter())
                    {
                        *slot += tau[k] * *genotype[k][read];
                    }
                }
                if !self.save_memory {
                    self.responsibilities[sample][read] = tau;
                }
            }
            self.alphas[sample] = alpha;
        }
        for ((slot, &prior), acc) in self
            .q
            .iter_mut()
            .zip(self.genotype_log_priors.iter())
            .zip(q_accumulator.iter())
        {
            *slot = prior + acc;
        }
        normalise_ln(&mut self.q);
    }

    /// Evidence lower bound at the current variational state. The
    /// responsibilities are the ones of the last sweep; concentrations and
    /// genotype posterior are current, so successive evaluations are
    /// non-decreasing.
    fn elbo(&self) -> f64 {
        let mut elbo: f64 = self
            .q
            .iter()
            .zip(self.genotype_log_priors.iter())
            .map(|(&lq, &prior)| {
                let p = lq.exp();
                if p > 0.0 {
                    p * (prior - lq)
                } else {
                    0.0
                }
            })
            .sum();
        for sample in 0..self.n_samples() {
            let eln_w = expected_ln_weights(&self.alphas[sample]);
            for read in 0..self.n_reads(sample) {
                let tau = self.sweep_responsibility(sample, read);
                for (k, &t) in tau.iter().enumerate() {
                    if t > 0.0 {
                        elbo += t
                            * (self.expected_log_likelihood(&self.q, sample, read, k) + eln_w[k]
                                - t.ln());
                    }
                }
            }
            elbo += ln_beta(&self.alphas[sample]) - ln_beta(&self.prior_alphas[sample]);
            for k in 0..K {
                elbo += (self.prior_alphas[sample][k] - self.alphas[sample][k]) * eln_w[k];
            }
        }
        elbo
    }

    fn run(mut self, options: &VariationalBayesOptions, token: &CancellationToken) -> MixtureLatents {
        let mut previous = f64::NEG_INFINITY;
        let mut converged = false;
        for _ in 0..options.max_iterations {
            if token.is_cancelled() {
                break;
            }
            self.iterate();
            let current = self.elbo();
            if (current - previous).abs() <= options.epsilon {
                converged = true;
                previous = current;
                break;
            }
            previous = current;
        }
        MixtureLatents {
            genotype_log_posteriors: self.q,
            alphas: self.alphas.iter().map(|a| a.to_vec()).collect(),
            log_evidence: previous,
            converged,
        }
    }
}

/// Run the mixture VB from every seed and keep the maximum-evidence result.
pub(crate) fn run_mixture_vb<const K: usize>(
    genotype_log_priors: &[f64],
    likelihoods: &MixtureLikelihoods<'_, K>,
    prior_alphas: &[[f64; K]],
    options: &VariationalBayesOptions,
    seeds: Vec<Vec<f64>>,
    token: &CancellationToken,
) -> MixtureLatents {
    assert!(!seeds.is_empty());
    let run_seed = |seed: Vec<f64>| {
        SeedRun::new(
            genotype_log_priors,
            likelihoods,
            prior_alphas,
            seed,
            options.save_memory,
        )
        .run(options, token)
    };
    let results: Vec<MixtureLatents> = if options.parallel {
        seeds.into_par_iter().map(run_seed).collect()
    } else {
        seeds.into_iter().map(run_seed).collect()
    };
    results
        .into_iter()
        .max_by(|a, b| a.log_evidence.partial_cmp(&b.log_evidence).unwrap())
        .unwrap()
}
