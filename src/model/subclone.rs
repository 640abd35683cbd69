// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Subclone model: variational Bayes over a shared latent genotype with
//! per-sample Dirichlet mixture weights across its haplotype copies. The VB
//! kernel is monomorphised over ploidy 1..=10; higher ploidies are rejected.

use bio::stats::LogProb;
use getset::{CopyGetters, Getters};
use rand::rngs::StdRng;

use crate::config::ExecutionPolicy;
use crate::errors::{Error, Result};
use crate::model::likelihood::{genotype_log_likelihoods, HaplotypeLikelihoodCache};
use crate::model::priors::GenotypePriorModel;
use crate::model::vb::mixture::{run_mixture_vb, MixtureLikelihoods};
use crate::model::vb::{
    log_uniform_seed, make_point_seed, make_random_seeds, VariationalBayesOptions,
};
use crate::model::{Genotype, HaplotypeId};
use crate::utils::CancellationToken;

/// Highest ploidy the monomorphised VB kernels are instantiated for.
pub const MAX_VB_PLOIDY: u32 = 10;

const POINT_SEED_MASS: f64 = 0.9999;

#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SubcloneModelOptions {
    pub epsilon: f64,
    pub max_iterations: usize,
    pub max_seeds: usize,
    pub dropout_concentration: f64,
    pub execution_policy: ExecutionPolicy,
    pub target_max_memory: Option<usize>,
}

impl Default for SubcloneModelOptions {
    fn default() -> Self {
        SubcloneModelOptions {
            epsilon: 0.05,
            max_iterations: 1000,
            max_seeds: 12,
            dropout_concentration: 1.5,
            execution_policy: ExecutionPolicy::Seq,
            target_max_memory: None,
        }
    }
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct SubcloneInferences {
    /// Normalised genotype posterior.
    #[getset(get = "pub")]
    genotype_posteriors: Vec<LogProb>,
    /// Posterior Dirichlet concentrations per sample (mixture weights).
    #[getset(get = "pub")]
    alphas: Vec<Vec<f64>>,
    #[getset(get_copy = "pub")]
    log_evidence: f64,
    /// False when every VB seed stopped at the iteration cap.
    #[getset(get_copy = "pub")]
    converged: bool,
}

impl SubcloneInferences {
    pub fn map_genotype(&self) -> usize {
        self.genotype_posteriors
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(idx, _)| idx)
            .expect("bug: empty posterior vector")
    }
}

#[derive(Debug)]
pub struct SubcloneModel<'a> {
    prior: &'a GenotypePriorModel,
    options: SubcloneModelOptions,
}

impl<'a> SubcloneModel<'a> {
    pub fn new(prior: &'a GenotypePriorModel, options: SubcloneModelOptions) -> Self {
        SubcloneModel { prior, options }
    }

    pub fn evaluate(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<SubcloneInferences> {
        if genotypes.is_empty() {
            return Err(Error::EmptyCandidates {
                context: "subclone model",
            });
        }
        match genotypes[0].ploidy() {
            1 => self.evaluate_k::<1>(genotypes, likelihoods, rng, token),
            2 => self.evaluate_k::<2>(genotypes, likelihoods, rng, token),
            3 => self.evaluate_k::<3>(genotypes, likelihoods, rng, token),
            4 => self.evaluate_k::<4>(genotypes, likelihoods, rng, token),
            5 => self.evaluate_k::<5>(genotypes, likelihoods, rng, token),
            6 => self.evaluate_k::<6>(genotypes, likelihoods, rng, token),
            7 => self.evaluate_k::<7>(genotypes, likelihoods, rng, token),
            8 => self.evaluate_k::<8>(genotypes, likelihoods, rng, token),
            9 => self.evaluate_k::<9>(genotypes, likelihoods, rng, token),
            10 => self.evaluate_k::<10>(genotypes, likelihoods, rng, token),
            ploidy => Err(Error::UnimplementedFeature {
                feature: format!("ploidy {}", ploidy),
                model: "subclone",
            }),
        }
    }

    fn evaluate_k<const K: usize>(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<SubcloneInferences> {
        let n_samples = likelihoods.n_samples();
        let genotype_log_priors: Vec<f64> = genotypes
            .iter()
            .enumerate()
            .map(|(idx, genotype)| *self.prior.ln_prob(idx, genotype))
            .collect();
        let vb_likelihoods: MixtureLikelihoods<'_, K> = (0..n_samples)
            .map(|sample| {
                let primed = likelihoods.primed(sample);
                genotypes
                    .iter()
                    .map(|genotype| {
                        std::array::from_fn(|k| primed.haplotype(genotype.members()[k]))
                    })
                    .collect()
            })
            .collect();
        let prior_alphas = vec![[self.options.dropout_concentration; K]; n_samples];
        let seeds = self.seeds(genotypes, &genotype_log_priors, likelihoods, rng);
        let options = VariationalBayesOptions {
            epsilon: self.options.epsilon,
            max_iterations: self.options.max_iterations,
            save_memory: self.needs_memory_saving::<K>(likelihoods),
            parallel: self.options.execution_policy == ExecutionPolicy::Par,
        };
        let latents = run_mixture_vb::<K>(
            &genotype_log_priors,
            &vb_likelihoods,
            &prior_alphas,
            &options,
            seeds,
            token,
        );
        Ok(SubcloneInferences {
            genotype_posteriors: latents
                .genotype_log_posteriors
                .iter()
                .map(|&p| LogProb(p))
                .collect(),
            alphas: latents.alphas,
            log_evidence: latents.log_evidence,
            converged: latents.converged,
        })
    }

    /// Dense responsibilities cost `Σ_s reads_s · K` floats; fall back to the
    /// recomputing path when that would exceed the configured target.
    fn needs_memory_saving<const K: usize>(&self, likelihoods: &HaplotypeLikelihoodCache) -> bool {
        match self.options.target_max_memory {
            Some(target) => {
                let total_reads: usize = (0..likelihoods.n_samples())
                    .map(|sample| likelihoods.primed(sample).n_reads())
                    .sum();
                total_reads * K * std::mem::size_of::<f64>() > target
            }
            None => false,
        }
    }

    /// A uniform seed, point seeds at the strongest genotypes by prior plus
    /// likelihood, and random restarts up to `max_seeds`.
    fn seeds(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        genotype_log_priors: &[f64],
        likelihoods: &HaplotypeLikelihoodCache,
        rng: &mut StdRng,
    ) -> Vec<Vec<f64>> {
        let n = genotypes.len();
        let mut scores: Vec<f64> = genotype_log_priors.to_vec();
        for sample in 0..likelihoods.n_samples() {
            for (score, ll) in scores
                .iter_mut()
                .zip(genotype_log_likelihoods(genotypes, &likelihoods.primed(sample)))
            {
                *score += *ll;
            }
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap().then(a.cmp(&b)));

        let mut seeds = vec![log_uniform_seed(n)];
        let n_point_seeds = self.options.max_seeds.saturating_sub(2).min(n);
        for &idx in order.iter().take(n_point_seeds) {
            seeds.push(make_point_seed(n, idx, POINT_SEED_MASS));
        }
        if seeds.len() < self.options.max_seeds {
            seeds.extend(make_random_seeds(
                n,
                self.options.max_seeds - seeds.len(),
                rng,
            ));
        }
        seeds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_all_genotypes;
    use crate::model::likelihood::HaplotypeLikelihoodCache;
    use crate::model::pairhmm::HmmModel;
    use crate::model::repeats::RepeatBasedIndelModel;
    use crate::variants::{AlignedRead, CigarOp, CigarString, Flags, GenomicRegion, Haplotype};
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn region(begin: u64, end: u64) -> GenomicRegion {
        GenomicRegion::new("1", begin, end)
    }

    fn read(name: &str, begin: u64, sequence: &[u8]) -> AlignedRead {
        AlignedRead::new(
            name.into(),
            region(begin, begin + sequence.len() as u64),
            sequence.to_vec(),
            vec![30u8; sequence.len()],
            CigarString(vec![CigarOp::Match(sequence.len() as u32)]),
            60,
            Flags::default(),
            None,
        )
    }

    fn setup() -> (Vec<Haplotype>, HaplotypeLikelihoodCache) {
        let haplotypes = vec![
            Haplotype::reference(region(100, 120), b"ACGTACGTACGTACGTACGT"),
            Haplotype::from_alleles(
                region(100, 120),
                b"ACGTACGTACGTACGTACGT",
                vec![crate::variants::Allele::new(region(110, 111), b"T".to_vec())],
            ),
        ];
        let reads = vec![
            read("r1", 100, b"ACGTACGTACGTACGT"),
            read("r2", 102, b"GTACGTACGTACGTAC"),
            read("r3", 104, b"ACGTACGTACGTACGT"),
        ];
        let cache = HaplotypeLikelihoodCache::compute(
            &haplotypes,
            &[("s1".to_owned(), reads)],
            &RepeatBasedIndelModel,
            |_, gap_extend| HmmModel::new(gap_extend, 0, 0),
        )
        .unwrap();
        (haplotypes, cache)
    }

    #[test]
    fn test_reference_reads_favour_hom_ref() {
        let (_, cache) = setup();
        let genotypes = generate_all_genotypes(2, 2);
        let prior = GenotypePriorModel::Uniform {
            n_genotypes: genotypes.len(),
        };
        let model = SubcloneModel::new(&prior, SubcloneModelOptions::default());
        let mut rng = StdRng::seed_from_u64(11);
        let inferences = model.evaluate(&genotypes, &cache, &mut rng, &CancellationToken::new()).unwrap();
        assert_eq!(inferences.map_genotype(), 0);
        let total: f64 = inferences
            .genotype_posteriors()
            .iter()
            .map(|p| p.exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        assert_eq!(inferences.alphas().len(), 1);
        assert_eq!(inferences.alphas()[0].len(), 2);
    }

    #[test]
    fn test_ploidy_above_ten_unsupported() {
        let (_, cache) = setup();
        let genotypes = vec![Genotype::new(vec![0usize; 11])];
        let prior = GenotypePriorModel::Uniform { n_genotypes: 1 };
        let model = SubcloneModel::new(&prior, SubcloneModelOptions::default());
        let mut rng = StdRng::seed_from_u64(11);
        let err = model.evaluate(&genotypes, &cache, &mut rng, &CancellationToken::new()).unwrap_err();
        assert!(matches!(err, Error::UnimplementedFeature { .. }));
    }

    #[test]
    fn test_deterministic_given_seeded_rng() {
        let (_, cache) = setup();
        let genotypes = generate_all_genotypes(2, 2);
        let prior = GenotypePriorModel::Uniform {
            n_genotypes: genotypes.len(),
        };
        let model = SubcloneModel::new(&prior, SubcloneModelOptions::default());
        let a = model
            .evaluate(
                &genotypes,
                &cache,
                &mut StdRng::seed_from_u64(5),
                &CancellationToken::new(),
            )
            .unwrap();
        let b = model
            .evaluate(
                &genotypes,
                &cache,
                &mut StdRng::seed_from_u64(5),
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(a.genotype_posteriors(), b.genotype_posteriors());
        assert_relative_eq!(a.log_evidence(), b.log_evidence());
    }
}
