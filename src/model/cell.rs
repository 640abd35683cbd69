// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Single-cell model: a mixture-of-mixtures over a cell phylogeny. Each
//! phylogeny group carries one latent genotype; samples (cells) attach to
//! groups via an outer Dirichlet mixture, and reads within a cell follow the
//! subclone-style inner mixture. A one-group phylogeny degenerates to the
//! subclone model.

use std::cell::RefCell;
use std::collections::HashMap;

use bio::stats::LogProb;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use rand::rngs::StdRng;

use crate::config::{CachingStrategy, ExecutionPolicy, MutationModelParams};
use crate::errors::{Error, Result};
use crate::model::individual::IndividualModel;
use crate::model::likelihood::HaplotypeLikelihoodCache;
use crate::model::phylogeny::Phylogeny;
use crate::model::population::{num_combinations, PopulationModel, PopulationModelOptions};
use crate::model::priors::GenotypePriorModel;
use crate::model::subclone::{SubcloneModel, SubcloneModelOptions, MAX_VB_PLOIDY};
use crate::model::vb::mixture_mixture::{run_mixture_mixture_vb, CombinationLikelihoods};
use crate::model::vb::{
    log_uniform_seed, make_point_seed, make_random_seeds, VariationalBayesOptions,
};
use crate::model::{Genotype, HaplotypeId};
use crate::utils::k_medoids::{k_medoids, symmetric_kl_divergence};
use crate::utils::CancellationToken;
use crate::utils::select_top_k::select_top_k_tuples;
use crate::variants::{Allele, Haplotype};

/// De novo mutation model on phylogeny edges: the probability of a descendant
/// genotype given its ancestor decays with the number of new mutations.
#[derive(Debug)]
pub struct DeNovoModel {
    theta: f64,
    caching: CachingStrategy,
    haplotype_mutations: Vec<Vec<Allele>>,
    cache: RefCell<HashMap<(usize, usize), LogProb>>,
}

impl DeNovoModel {
    pub fn new(params: MutationModelParams, haplotypes: &[Haplotype]) -> Self {
        DeNovoModel {
            theta: params.theta,
            caching: params.caching,
            haplotype_mutations: haplotypes
                .iter()
                .map(|haplotype| haplotype.derivation().clone())
                .collect(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn mutations(&self, genotype: &Genotype<HaplotypeId>) -> Vec<&Allele> {
        let mut mutations: Vec<&Allele> = genotype
            .counts()
            .into_iter()
            .flat_map(|(haplotype, _)| self.haplotype_mutations[haplotype].iter())
            .collect();
        mutations.sort();
        mutations.dedup();
        mutations
    }

    /// `log P(descendant | ancestor)`: penalises the mutations separating
    /// the two genotypes. Losing an ancestral mutation requires a back
    /// mutation, so gains and losses both count.
    pub fn evaluate(
        &self,
        ancestor_idx: usize,
        ancestor: &Genotype<HaplotypeId>,
        descendant_idx: usize,
        descendant: &Genotype<HaplotypeId>,
    ) -> LogProb {
        if self.caching == CachingStrategy::ByAddress {
            if let Some(&cached) = self.cache.borrow().get(&(ancestor_idx, descendant_idx)) {
                return cached;
            }
        }
        let ancestor_mutations = self.mutations(ancestor);
        let descendant_mutations = self.mutations(descendant);
        let novel = descendant_mutations
            .iter()
            .filter(|mutation| !ancestor_mutations.contains(mutation))
            .count();
        let lost = ancestor_mutations
            .iter()
            .filter(|mutation| !descendant_mutations.contains(mutation))
            .count();
        let ln_prob = LogProb(-self.theta * (novel + lost) as f64);
        if self.caching == CachingStrategy::ByAddress {
            self.cache
                .borrow_mut()
                .insert((ancestor_idx, descendant_idx), ln_prob);
        }
        ln_prob
    }
}

/// Prior over joint genotype combinations on a phylogeny: the founder
/// genotype follows the germline prior, every edge follows the de novo model.
#[derive(Debug)]
pub struct SingleCellPriorModel<'a> {
    phylogeny: Phylogeny<()>,
    germline_prior: &'a GenotypePriorModel,
    mutation_model: DeNovoModel,
}

impl<'a> SingleCellPriorModel<'a> {
    pub fn new(
        phylogeny: Phylogeny<()>,
        germline_prior: &'a GenotypePriorModel,
        mutation_model: DeNovoModel,
    ) -> Self {
        SingleCellPriorModel {
            phylogeny,
            germline_prior,
            mutation_model,
        }
    }

    pub fn phylogeny(&self) -> &Phylogeny<()> {
        &self.phylogeny
    }

    pub fn germline_prior(&self) -> &'a GenotypePriorModel {
        self.germline_prior
    }

    pub fn evaluate(
        &self,
        combination: &[usize],
        genotypes: &[Genotype<HaplotypeId>],
    ) -> LogProb {
        let founder_idx = combination[0];
        let mut ln_prob = self
            .germline_prior
            .ln_prob(founder_idx, &genotypes[founder_idx]);
        for group in 1..self.phylogeny.size() {
            let ancestor = self
                .phylogeny
                .ancestor(group)
                .expect("bug: non-founder group without ancestor");
            ln_prob = ln_prob
                + self.mutation_model.evaluate(
                    combination[ancestor],
                    &genotypes[combination[ancestor]],
                    combination[group],
                    &genotypes[combination[group]],
                );
        }
        ln_prob
    }
}

#[derive(Debug, Clone, Copy, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SingleCellModelOptions {
    pub max_genotype_combinations: usize,
    pub max_seeds: usize,
    pub epsilon: f64,
    pub max_iterations: usize,
    pub dropout_concentration: f64,
    pub group_concentration: f64,
    pub execution_policy: ExecutionPolicy,
    pub target_max_memory: Option<usize>,
    pub max_em_iterations: usize,
    pub em_epsilon: f64,
}

impl Default for SingleCellModelOptions {
    fn default() -> Self {
        SingleCellModelOptions {
            max_genotype_combinations: 10_000,
            max_seeds: 12,
            epsilon: 0.05,
            max_iterations: 1000,
            dropout_concentration: 1.5,
            group_concentration: 1.0,
            execution_policy: ExecutionPolicy::Seq,
            target_max_memory: None,
            max_em_iterations: 100,
            em_epsilon: 1e-3,
        }
    }
}

/// Posterior summary for one phylogeny group.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct GroupInferences {
    /// Probability that each sample is attached to this group.
    sample_attachment_posteriors: Vec<f64>,
    /// Marginal genotype posterior of this group (linear space).
    genotype_posteriors: Vec<f64>,
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct CellInferences {
    #[getset(get = "pub")]
    phylogeny: Phylogeny<GroupInferences>,
    #[getset(get_copy = "pub")]
    log_evidence: f64,
    #[getset(get_copy = "pub")]
    converged: bool,
}

#[derive(Debug)]
pub struct SingleCellModel<'a> {
    prior_model: SingleCellPriorModel<'a>,
    options: SingleCellModelOptions,
}

impl<'a> SingleCellModel<'a> {
    pub fn new(prior_model: SingleCellPriorModel<'a>, options: SingleCellModelOptions) -> Self {
        SingleCellModel {
            prior_model,
            options,
        }
    }

    pub fn evaluate(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<CellInferences> {
        if genotypes.is_empty() {
            return Err(Error::EmptyCandidates {
                context: "single-cell model",
            });
        }
        let ploidy = genotypes[0].ploidy();
        if ploidy > MAX_VB_PLOIDY {
            return Err(Error::UnimplementedFeature {
                feature: format!("ploidy {}", ploidy),
                model: "cell",
            });
        }
        if self.prior_model.phylogeny().size() == 1 {
            self.evaluate_single_group(genotypes, likelihoods, rng, token)
        } else {
            self.evaluate_phylogeny(genotypes, likelihoods, rng, token)
        }
    }

    /// One-group phylogeny: the subclone model with every sample attached to
    /// the founder.
    fn evaluate_single_group(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<CellInferences> {
        let subclone_options = SubcloneModelOptions {
            epsilon: self.options.epsilon,
            max_iterations: self.options.max_iterations,
            max_seeds: self.options.max_seeds,
            dropout_concentration: self.options.dropout_concentration,
            execution_policy: self.options.execution_policy,
            target_max_memory: self.options.target_max_memory,
        };
        let helper = SubcloneModel::new(self.prior_model.germline_prior(), subclone_options);
        let inferences = helper.evaluate(genotypes, likelihoods, rng, token)?;
        let founder = GroupInferences {
            sample_attachment_posteriors: vec![1.0; likelihoods.n_samples()],
            genotype_posteriors: inferences
                .genotype_posteriors()
                .iter()
                .map(|p| p.exp())
                .collect(),
        };
        Ok(CellInferences {
            phylogeny: Phylogeny::founder(founder),
            log_evidence: inferences.log_evidence(),
            converged: inferences.converged(),
        })
    }

    fn evaluate_phylogeny(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<CellInferences> {
        let n_groups = self.prior_model.phylogeny().size();
        let combinations = self.propose_genotype_combinations(genotypes, likelihoods, token)?;
        let combination_log_priors: Vec<f64> = combinations
            .iter()
            .map(|combination| *self.prior_model.evaluate(combination, genotypes))
            .collect();
        let vb_likelihoods = self.combination_likelihoods(&combinations, genotypes, likelihoods);
        let seeds = self.seeds(combinations.len(), rng);
        let options = VariationalBayesOptions {
            epsilon: self.options.epsilon,
            max_iterations: self.options.max_iterations,
            save_memory: self.needs_memory_saving(likelihoods, n_groups, ploidy_of(genotypes)),
            parallel: self.options.execution_policy == ExecutionPolicy::Par,
        };
        let latents = run_mixture_mixture_vb(
            &combination_log_priors,
            &vb_likelihoods,
            self.options.group_concentration,
            self.options.dropout_concentration,
            n_groups,
            ploidy_of(genotypes) as usize,
            &options,
            seeds,
            token,
        );
        let n_samples = likelihoods.n_samples();
        let phylogeny = self.prior_model.phylogeny().map(|group_idx, _| {
            let sample_attachment_posteriors: Vec<f64> = (0..n_samples)
                .map(|sample| latents.group_responsibilities[sample][group_idx])
                .collect();
            let mut genotype_posteriors = vec![0.0f64; genotypes.len()];
            for (combination, &lq) in combinations
                .iter()
                .zip(latents.combination_log_posteriors.iter())
            {
                genotype_posteriors[combination[group_idx]] += lq.exp();
            }
            GroupInferences {
                sample_attachment_posteriors,
                genotype_posteriors,
            }
        });
        Ok(CellInferences {
            phylogeny,
            log_evidence: latents.log_evidence,
            converged: latents.converged,
        })
    }

    /// One genotype per phylogeny group. Small spaces are enumerated in full
    /// (combinations repeating a genotype across groups are redundant and
    /// dropped); otherwise clusters of samples vote for their favourite
    /// genotypes and the best tuples are kept.
    fn propose_genotype_combinations(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        token: &CancellationToken,
    ) -> Result<Vec<Vec<usize>>> {
        let n_groups = self.prior_model.phylogeny().size();
        let max_possible = num_combinations(genotypes.len(), n_groups);
        if max_possible <= self.options.max_genotype_combinations {
            let all: Vec<Vec<usize>> = (0..n_groups)
                .map(|_| 0..genotypes.len())
                .multi_cartesian_product()
                .filter(|combination| combination.iter().all_unique())
                .collect();
            if all.is_empty() {
                return Err(Error::EmptyCandidates {
                    context: "genotype combinations",
                });
            }
            return Ok(all);
        }

        // 1. Population marginals. 2. Cluster samples. 3. Individual model on
        // each cluster's pooled reads. 4. Top combinations from the cluster
        // marginals.
        let uniform_prior = GenotypePriorModel::Uniform {
            n_genotypes: genotypes.len(),
        };
        let population = PopulationModel::new(
            &uniform_prior,
            PopulationModelOptions {
                max_joint_genotypes: self.options.max_genotype_combinations,
                max_em_iterations: self.options.max_em_iterations,
                em_epsilon: self.options.em_epsilon,
            },
        );
        let n_haplotypes = likelihoods.n_haplotypes();
        let population_inferences =
            population.evaluate(genotypes, n_haplotypes, likelihoods, None, token)?;
        let sample_marginals: Vec<Vec<f64>> = population_inferences
            .marginal_posteriors()
            .iter()
            .map(|sample| sample.iter().map(|p| p.exp()).collect())
            .collect();
        let clusters = k_medoids(&sample_marginals, n_groups, symmetric_kl_divergence);

        let individual = IndividualModel::new(self.prior_model.germline_prior());
        let mut cluster_marginals = Vec::with_capacity(n_groups);
        for cluster in &clusters {
            let pooled = likelihoods.merge_samples(cluster, "pool");
            let inferences = individual.evaluate(genotypes, &pooled.primed(0))?;
            cluster_marginals.push(
                inferences
                    .genotype_posteriors()
                    .iter()
                    .map(|p| p.exp())
                    .collect::<Vec<f64>>(),
            );
        }
        // Fewer samples than groups leaves clusters short; every tuple slot
        // still needs a marginal to draw from.
        while cluster_marginals.len() < n_groups {
            let last = cluster_marginals
                .last()
                .cloned()
                .unwrap_or_else(|| vec![1.0 / genotypes.len() as f64; genotypes.len()]);
            cluster_marginals.push(last);
        }

        let mut k = self.options.max_genotype_combinations;
        let mut result = Vec::new();
        while result.is_empty() && k <= max_possible {
            result = select_top_k_tuples(&cluster_marginals, k);
            result.retain(|combination| combination.iter().all_unique());
            k = k.saturating_mul(2);
        }
        if result.is_empty() {
            return Err(Error::EmptyCandidates {
                context: "genotype combinations",
            });
        }
        result.truncate(self.options.max_genotype_combinations);
        Ok(result)
    }

    fn combination_likelihoods<'c>(
        &self,
        combinations: &[Vec<usize>],
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &'c HaplotypeLikelihoodCache,
    ) -> CombinationLikelihoods<'c> {
        (0..likelihoods.n_samples())
            .map(|sample| {
                let primed = likelihoods.primed(sample);
                combinations
                    .iter()
                    .map(|combination| {
                        combination
                            .iter()
                            .map(|&genotype_idx| {
                                genotypes[genotype_idx]
                                    .members()
                                    .iter()
                                    .map(|&haplotype| primed.haplotype(haplotype))
                                    .collect()
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect()
    }

    fn needs_memory_saving(
        &self,
        likelihoods: &HaplotypeLikelihoodCache,
        n_groups: usize,
        ploidy: u32,
    ) -> bool {
        match self.options.target_max_memory {
            Some(target) => {
                let total_reads: usize = (0..likelihoods.n_samples())
                    .map(|sample| likelihoods.primed(sample).n_reads())
                    .sum();
                total_reads * n_groups * ploidy as usize * std::mem::size_of::<f64>() > target
            }
            None => false,
        }
    }

    /// A uniform seed, point seeds on the leading combinations, and random
    /// restarts up to `max_seeds`.
    fn seeds(&self, n_combinations: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
        let mut seeds = vec![log_uniform_seed(n_combinations)];
        let k = self.options.max_seeds.saturating_sub(2).min(n_combinations);
        for idx in 0..k {
            seeds.push(make_point_seed(n_combinations, idx, 0.9999));
        }
        if seeds.len() < self.options.max_seeds {
            seeds.extend(make_random_seeds(
                n_combinations,
                self.options.max_seeds - seeds.len(),
                rng,
            ));
        }
        seeds
    }
}

fn ploidy_of(genotypes: &[Genotype<HaplotypeId>]) -> u32 {
    genotypes[0].ploidy()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_all_genotypes;
    use crate::model::pairhmm::HmmModel;
    use crate::model::repeats::RepeatBasedIndelModel;
    use crate::variants::{AlignedRead, CigarOp, CigarString, Flags, GenomicRegion};
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

    const REF_SEQ: &[u8] = b"ACGTACGTACGTACGTACGT";

    fn haplotypes() -> Vec<Haplotype> {
        vec![
            Haplotype::reference(region(100, 120), REF_SEQ),
            Haplotype::from_alleles(
                region(100, 120),
                REF_SEQ,
                vec![Allele::new(region(110, 111), b"T".to_vec())],
            ),
        ]
    }

    fn wildtype_reads(prefix: &str) -> Vec<AlignedRead> {
        (0..3)
            .map(|i| read(&format!("{}{}", prefix, i), 100, b"ACGTACGTACGTACGTACGT"))
            .collect()
    }

    fn mutant_reads(prefix: &str) -> Vec<AlignedRead> {
        (0..3)
            .map(|i| read(&format!("{}{}", prefix, i), 100, b"ACGTACGTACTTACGTACGT"))
            .collect()
    }

    fn cache(reads_by_sample: &[(String, Vec<AlignedRead>)]) -> HaplotypeLikelihoodCache {
        HaplotypeLikelihoodCache::compute(
            &haplotypes(),
            reads_by_sample,
            &RepeatBasedIndelModel,
            |_, gap_extend| HmmModel::new(gap_extend, 0, 0),
        )
        .unwrap()
    }

    fn two_group_phylogeny() -> Phylogeny<()> {
        let mut phylogeny = Phylogeny::founder(());
        phylogeny.add_descendant((), 0);
        phylogeny
    }

    #[test]
    fn test_single_group_degenerates_to_subclone() {
        let haplotypes = haplotypes();
        let cache = cache(&[("cell0".into(), wildtype_reads("w"))]);
        let prior = GenotypePriorModel::Uniform { n_genotypes: 3 };
        let mutation_model =
            DeNovoModel::new(MutationModelParams::default(), &haplotypes);
        let model = SingleCellModel::new(
            SingleCellPriorModel::new(Phylogeny::founder(()), &prior, mutation_model),
            SingleCellModelOptions::default(),
        );
        let genotypes = generate_all_genotypes(2, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let inferences = model.evaluate(&genotypes, &cache, &mut rng, &CancellationToken::new()).unwrap();
        assert_eq!(inferences.phylogeny().size(), 1);
        let founder = inferences.phylogeny().group(0);
        assert_relative_eq!(founder.sample_attachment_posteriors()[0], 1.0);
        let total: f64 = founder.genotype_posteriors().iter().sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_combination_proposal_drops_duplicates() {
        let haplotypes = haplotypes();
        let cache = cache(&[
            ("cell0".into(), wildtype_reads("w")),
            ("cell1".into(), mutant_reads("m")),
        ]);
        let prior = GenotypePriorModel::Uniform { n_genotypes: 3 };
        let mutation_model =
            DeNovoModel::new(MutationModelParams::default(), &haplotypes);
        let model = SingleCellModel::new(
            SingleCellPriorModel::new(two_group_phylogeny(), &prior, mutation_model),
            SingleCellModelOptions::default(),
        );
        let genotypes = generate_all_genotypes(2, 2);
        let combinations = model
            .propose_genotype_combinations(&genotypes, &cache, &CancellationToken::new())
            .unwrap();
        // 3 genotypes over 2 groups: 9 tuples, 3 with equal entries dropped.
        assert_eq!(combinations.len(), 6);
        for combination in &combinations {
            assert!(combination.iter().all_unique());
        }
    }

    #[test]
    fn test_variant_cell_lands_in_descendant_group() {
        let haplotypes = haplotypes();
        let cache = cache(&[
            ("cell0".into(), wildtype_reads("a")),
            ("cell1".into(), wildtype_reads("b")),
            ("cell2".into(), wildtype_reads("c")),
            ("cell3".into(), mutant_reads("m")),
        ]);
        // A coalescent germline prior penalises a mutant founder, so the
        // somatic variant must be explained by the descendant group.
        let prior = GenotypePriorModel::Coalescent(crate::model::priors::CoalescentModel::new(
            MutationModelParams::default(),
            &haplotypes,
        ));
        let mutation_model =
            DeNovoModel::new(MutationModelParams::default(), &haplotypes);
        let model = SingleCellModel::new(
            SingleCellPriorModel::new(two_group_phylogeny(), &prior, mutation_model),
            SingleCellModelOptions::default(),
        );
        let genotypes = generate_all_genotypes(2, 2);
        let mut rng = StdRng::seed_from_u64(3);
        let inferences = model.evaluate(&genotypes, &cache, &mut rng, &CancellationToken::new()).unwrap();
        assert_eq!(inferences.phylogeny().size(), 2);
        let founder = inferences.phylogeny().group(0);
        let descendant = inferences.phylogeny().group(1);
        // The three wild-type cells go to the founder, the mutant cell to
        // the descendant.
        for sample in 0..3 {
            assert!(founder.sample_attachment_posteriors()[sample] >= 0.9);
        }
        assert!(descendant.sample_attachment_posteriors()[3] >= 0.9);
        // The descendant group's genotype carries the alternative allele.
        let descendant_map = descendant
            .genotype_posteriors()
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(idx, _)| idx)
            .unwrap();
        assert!(genotypes[descendant_map].contains(&1));
    }
}
