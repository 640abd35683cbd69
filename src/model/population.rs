// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Joint posterior over per-sample genotypes for a cohort. Small problems
//! are enumerated exactly; otherwise expectation-maximisation fits
//! Hardy-Weinberg haplotype frequencies and a top-K set of joint genotypes
//! is evaluated exactly.

use bio::stats::LogProb;
use getset::{CopyGetters, Getters};
use itertools::Itertools;

use crate::errors::{Error, Result};
use crate::model::likelihood::{genotype_log_likelihoods, HaplotypeLikelihoodCache};
use crate::model::priors::{GenotypePriorModel, HardyWeinbergModel};
use crate::model::{inverse_genotype_table, Genotype, HaplotypeId};
use crate::utils;
use crate::utils::select_top_k::select_top_k_tuples;
use crate::utils::CancellationToken;

#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct PopulationModelOptions {
    pub max_joint_genotypes: usize,
    pub max_em_iterations: usize,
    pub em_epsilon: f64,
}

impl Default for PopulationModelOptions {
    fn default() -> Self {
        PopulationModelOptions {
            max_joint_genotypes: 1_000_000,
            max_em_iterations: 100,
            em_epsilon: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct PopulationInferences {
    /// Normalised genotype posterior per sample.
    #[getset(get = "pub")]
    marginal_posteriors: Vec<Vec<LogProb>>,
    #[getset(get_copy = "pub")]
    log_evidence: f64,
    /// False when the EM frequency fit stopped at the iteration cap.
    #[getset(get_copy = "pub")]
    em_converged: bool,
}

#[derive(Debug)]
pub struct PopulationModel<'a> {
    prior: &'a GenotypePriorModel,
    options: PopulationModelOptions,
}

/// Number of joint genotype configurations, saturating on overflow.
pub(crate) fn num_combinations(n_genotypes: usize, n_samples: usize) -> usize {
    let mut result = 1usize;
    for _ in 0..n_samples {
        result = result.saturating_mul(n_genotypes);
    }
    result
}

impl<'a> PopulationModel<'a> {
    pub fn new(prior: &'a GenotypePriorModel, options: PopulationModelOptions) -> Self {
        PopulationModel { prior, options }
    }

    /// `hom_ref_idx` is the index of the all-reference genotype if one is
    /// among the candidates; the approximate path guarantees it a slot in
    /// the evaluated joint set.
    pub fn evaluate(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        n_haplotypes: usize,
        likelihoods: &HaplotypeLikelihoodCache,
        hom_ref_idx: Option<usize>,
        token: &CancellationToken,
    ) -> Result<PopulationInferences> {
        if genotypes.is_empty() {
            return Err(Error::EmptyCandidates {
                context: "population model",
            });
        }
        let n_samples = likelihoods.n_samples();
        let log_likelihoods: Vec<Vec<LogProb>> = (0..n_samples)
            .map(|sample| genotype_log_likelihoods(genotypes, &likelihoods.primed(sample)))
            .collect();
        if num_combinations(genotypes.len(), n_samples) <= self.options.max_joint_genotypes {
            let joint = all_joint_genotypes(genotypes.len(), n_samples);
            self.posterior_marginals(genotypes, &joint, &log_likelihoods, true)
        } else {
            let mut em = Em::new(genotypes, n_haplotypes, &log_likelihoods);
            let converged = em.run(
                self.options.max_em_iterations,
                self.options.em_epsilon,
                token,
            );
            let joint = propose_joint_genotypes(
                genotypes,
                em.posteriors(),
                self.options.max_joint_genotypes,
                |idx| Some(idx) == hom_ref_idx,
            );
            self.posterior_marginals(genotypes, &joint, &log_likelihoods, converged)
        }
    }

    fn posterior_marginals(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        joint_genotypes: &[Vec<usize>],
        log_likelihoods: &[Vec<LogProb>],
        em_converged: bool,
    ) -> Result<PopulationInferences> {
        let n_samples = log_likelihoods.len();
        let mut joint_posteriors: Vec<LogProb> = joint_genotypes
            .iter()
            .map(|indices| {
                indices
                    .iter()
                    .enumerate()
                    .map(|(sample, &genotype_idx)| {
                        self.prior.ln_prob(genotype_idx, &genotypes[genotype_idx])
                            + log_likelihoods[sample][genotype_idx]
                    })
                    .sum()
            })
            .collect();
        let log_evidence = *utils::normalise(&mut joint_posteriors, "joint genotype posteriors")?;
        let mut marginals = vec![vec![0.0f64; genotypes.len()]; n_samples];
        for (indices, posterior) in joint_genotypes.iter().zip(joint_posteriors.iter()) {
            for (sample, &genotype_idx) in indices.iter().enumerate() {
                marginals[sample][genotype_idx] += posterior.exp();
            }
        }
        let marginal_posteriors = marginals
            .into_iter()
            .map(|sample| sample.into_iter().map(|p| LogProb(p.ln())).collect())
            .collect();
        Ok(PopulationInferences {
            marginal_posteriors,
            log_evidence,
            em_converged,
        })
    }
}

pub(crate) fn all_joint_genotypes(n_genotypes: usize, n_samples: usize) -> Vec<Vec<usize>> {
    (0..n_samples)
        .map(|_| 0..n_genotypes)
        .multi_cartesian_product()
        .collect()
}

/// Top-K joint proposals from per-sample EM marginals: the best tuples by
/// marginal product, enriched with single-genotype substitutions of the best
/// tuple, with the all-homozygous-reference tuple guaranteed a slot.
fn propose_joint_genotypes<F>(
    genotypes: &[Genotype<HaplotypeId>],
    em_marginals: &[Vec<f64>],
    max_joint_genotypes: usize,
    is_hom_ref: F,
) -> Vec<Vec<usize>>
where
    F: Fn(usize) -> bool,
{
    let n_samples = em_marginals.len();
    let mut result = select_top_k_tuples(em_marginals, max_joint_genotypes);
    debug_assert!(!result.is_empty());
    // Substitute the overall strongest genotypes into the best tuple.
    let top_genotypes = select_top_genotypes(genotypes.len(), em_marginals, n_samples / 2);
    let best = result[0].clone();
    for genotype_idx in top_genotypes {
        for sample in 0..n_samples {
            if best[sample] != genotype_idx {
                let mut tuple = best.clone();
                tuple[sample] = genotype_idx;
                if !result.contains(&tuple) {
                    result.push(tuple);
                }
            }
        }
    }
    if let Some(hom_ref_idx) = (0..genotypes.len()).find(|&idx| is_hom_ref(idx)) {
        let ref_tuple = vec![hom_ref_idx; n_samples];
        if !result.contains(&ref_tuple) {
            if result.len() < max_joint_genotypes {
                result.push(ref_tuple);
            } else {
                *result.last_mut().unwrap() = ref_tuple;
            }
        }
    }
    result
}

/// Genotypes ranked by their total marginal mass across samples.
fn select_top_genotypes(n_genotypes: usize, em_marginals: &[Vec<f64>], k: usize) -> Vec<usize> {
    let mut mass = vec![0.0f64; n_genotypes];
    for sample in em_marginals {
        for (genotype_idx, &p) in sample.iter().enumerate() {
            mass[genotype_idx] += p;
        }
    }
    let mut order: Vec<usize> = (0..n_genotypes).collect();
    order.sort_by(|&a, &b| mass[b].partial_cmp(&mass[a]).unwrap().then(a.cmp(&b)));
    order.truncate(k);
    order
}

/// Expectation-maximisation of Hardy-Weinberg haplotype frequencies given
/// per-sample genotype log likelihoods.
pub(crate) struct Em<'a> {
    genotypes: &'a [Genotype<HaplotypeId>],
    log_likelihoods: &'a [Vec<LogProb>],
    hw: HardyWeinbergModel,
    genotype_log_marginals: Vec<LogProb>,
    /// Linear-space per-sample genotype posteriors.
    posteriors: Vec<Vec<f64>>,
    genotypes_containing: Vec<Vec<usize>>,
    frequency_update_norm: f64,
}

impl<'a> Em<'a> {
    pub(crate) fn new(
        genotypes: &'a [Genotype<HaplotypeId>],
        n_haplotypes: usize,
        log_likelihoods: &'a [Vec<LogProb>],
    ) -> Self {
        let ploidy = genotypes[0].ploidy();
        let hw = HardyWeinbergModel::uniform(n_haplotypes);
        let genotype_log_marginals: Vec<LogProb> =
            genotypes.iter().map(|g| hw.evaluate(g)).collect();
        let mut em = Em {
            genotypes,
            log_likelihoods,
            hw,
            genotype_log_marginals,
            posteriors: vec![Vec::new(); log_likelihoods.len()],
            genotypes_containing: inverse_genotype_table(genotypes, n_haplotypes),
            frequency_update_norm: log_likelihoods.len() as f64 * f64::from(ploidy),
        };
        em.update_posteriors();
        em
    }

    pub(crate) fn frequencies(&self) -> &[f64] {
        self.hw.frequencies()
    }

    pub(crate) fn posteriors(&self) -> &[Vec<f64>] {
        &self.posteriors
    }

    /// `Σ_s log Σ_g π(g; f) P(reads_s | g)`
    pub(crate) fn data_log_likelihood(&self) -> f64 {
        self.log_likelihoods
            .iter()
            .map(|sample| {
                *LogProb::ln_sum_exp(
                    &self
                        .genotype_log_marginals
                        .iter()
                        .zip(sample.iter())
                        .map(|(&marginal, &ll)| marginal + ll)
                        .collect::<Vec<_>>(),
                )
            })
            .sum()
    }

    fn update_posteriors(&mut self) {
        for (sample, log_likelihood) in self.log_likelihoods.iter().enumerate() {
            let mut posterior: Vec<LogProb> = self
                .genotype_log_marginals
                .iter()
                .zip(log_likelihood.iter())
                .map(|(&marginal, &ll)| marginal + ll)
                .collect();
            // Degenerate rows are replaced by uniform inside normalise.
            utils::normalise(&mut posterior, "EM genotype posteriors")
                .expect("bug: NaN in EM posterior normalisation");
            self.posteriors[sample] = posterior.iter().map(|p| p.exp()).collect();
        }
    }

    /// One M+E sweep; returns the largest haplotype frequency change.
    pub(crate) fn step(&mut self) -> f64 {
        let mut collapsed = vec![0.0f64; self.genotypes.len()];
        for sample in &self.posteriors {
            for (slot, &p) in collapsed.iter_mut().zip(sample.iter()) {
                *slot += p;
            }
        }
        let mut frequencies = self.hw.frequencies().to_vec();
        let mut max_change = 0.0f64;
        for (haplotype, frequency) in frequencies.iter_mut().enumerate() {
            let mut new_frequency = 0.0;
            for &genotype_idx in &self.genotypes_containing[haplotype] {
                let multiplicity = self.genotypes[genotype_idx].multiplicity(&haplotype);
                new_frequency += multiplicity as f64 * collapsed[genotype_idx];
            }
            new_frequency /= self.frequency_update_norm;
            max_change = max_change.max((*frequency - new_frequency).abs());
            *frequency = new_frequency;
        }
        self.hw.set_frequencies(frequencies);
        for (marginal, genotype) in self
            .genotype_log_marginals
            .iter_mut()
            .zip(self.genotypes.iter())
        {
            *marginal = self.hw.evaluate(genotype);
        }
        self.update_posteriors();
        max_change
    }

    /// Returns true if converged before the iteration cap.
    pub(crate) fn run(
        &mut self,
        max_iterations: usize,
        epsilon: f64,
        token: &CancellationToken,
    ) -> bool {
        for _ in 0..max_iterations {
            if token.is_cancelled() {
                break;
            }
            if self.step() <= epsilon {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_all_genotypes;
    use approx::assert_relative_eq;

    /// Two haplotypes, two reads-worth of likelihood favouring one haplotype
    /// per "sample": a synthetic matrix, no alignment involved.
    fn synthetic_log_likelihoods(n_samples: usize) -> Vec<Vec<LogProb>> {
        // genotypes over 2 haplotypes, ploidy 2: [0/0, 0/1, 1/1]
        (0..n_samples)
            .map(|sample| {
                if sample % 2 == 0 {
                    vec![LogProb(-1.0), LogProb(-4.0), LogProb(-9.0)]
                } else {
                    vec![LogProb(-9.0), LogProb(-4.0), LogProb(-1.0)]
                }
            })
            .collect()
    }

    #[test]
    fn test_em_frequencies_stay_normalised() {
        let genotypes = generate_all_genotypes(2, 2);
        let log_likelihoods = synthetic_log_likelihoods(4);
        let mut em = Em::new(&genotypes, 2, &log_likelihoods);
        for _ in 0..10 {
            em.step();
            let total: f64 = em.frequencies().iter().sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_em_balanced_haplotypes_converge_to_half() {
        let genotypes = generate_all_genotypes(2, 2);
        let log_likelihoods = synthetic_log_likelihoods(8);
        let mut em = Em::new(&genotypes, 2, &log_likelihoods);
        em.run(100, 1e-6, &CancellationToken::new());
        assert_relative_eq!(em.frequencies()[0], 0.5, epsilon = 0.01);
        assert_relative_eq!(em.frequencies()[1], 0.5, epsilon = 0.01);
    }

    #[test]
    fn test_em_data_log_likelihood_non_decreasing() {
        let genotypes = generate_all_genotypes(2, 2);
        let log_likelihoods = synthetic_log_likelihoods(6);
        let mut em = Em::new(&genotypes, 2, &log_likelihoods);
        let mut previous = em.data_log_likelihood();
        for _ in 0..25 {
            em.step();
            let current = em.data_log_likelihood();
            assert!(
                current >= previous - 1e-9,
                "EM data log-likelihood decreased: {} -> {}",
                previous,
                current
            );
            previous = current;
        }
    }

    #[test]
    fn test_exact_path_single_sample_matches_individual() {
        use crate::model::priors::GenotypePriorModel;
        let genotypes = generate_all_genotypes(2, 2);
        let log_likelihoods = synthetic_log_likelihoods(1);
        let prior = GenotypePriorModel::Uniform { n_genotypes: 3 };
        let model = PopulationModel::new(&prior, PopulationModelOptions::default());
        let inferences = model
            .posterior_marginals(
                &genotypes,
                &all_joint_genotypes(3, 1),
                &log_likelihoods,
                true,
            )
            .unwrap();
        // ∝ prior * likelihood, same as the individual model.
        let mut expected: Vec<LogProb> = log_likelihoods[0]
            .iter()
            .map(|&ll| LogProb(*ll - (3.0f64).ln()))
            .collect();
        crate::utils::normalise(&mut expected, "test").unwrap();
        for (observed, expected) in inferences.marginal_posteriors()[0].iter().zip(expected) {
            assert_relative_eq!(**observed, *expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_top_k_proposals_include_hom_ref() {
        let genotypes = generate_all_genotypes(2, 2);
        let em_marginals = vec![vec![0.01, 0.9, 0.09]; 3];
        let proposals = propose_joint_genotypes(&genotypes, &em_marginals, 4, |idx| idx == 0);
        assert!(proposals.contains(&vec![0, 0, 0]));
        assert!(proposals[0] == vec![1, 1, 1]);
    }
}
