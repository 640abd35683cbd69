// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Exact posterior over candidate genotypes for a single sample:
//! `P(g | reads) ∝ P(g) · Π_r P(r | g)` under the constant-mixture read
//! likelihood.

use bio::stats::LogProb;
use getset::{CopyGetters, Getters};

use crate::errors::{Error, Result};
use crate::model::likelihood::{genotype_log_likelihoods, PrimedLikelihoods};
use crate::model::priors::GenotypePriorModel;
use crate::model::{Genotype, HaplotypeId};
use crate::utils;

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct IndividualInferences {
    /// Normalised posterior per candidate genotype.
    #[getset(get = "pub")]
    genotype_posteriors: Vec<LogProb>,
    #[getset(get_copy = "pub")]
    log_evidence: f64,
}

impl IndividualInferences {
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
pub struct IndividualModel<'a> {
    prior: &'a GenotypePriorModel,
}

impl<'a> IndividualModel<'a> {
    pub fn new(prior: &'a GenotypePriorModel) -> Self {
        IndividualModel { prior }
    }

    pub fn evaluate(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &PrimedLikelihoods,
    ) -> Result<IndividualInferences> {
        if genotypes.is_empty() {
            return Err(Error::EmptyCandidates {
                context: "individual model",
            });
        }
        let log_likelihoods = genotype_log_likelihoods(genotypes, likelihoods);
        let mut posteriors: Vec<LogProb> = genotypes
            .iter()
            .enumerate()
            .zip(log_likelihoods.iter())
            .map(|((idx, genotype), log_likelihood)| {
                self.prior.ln_prob(idx, genotype) + *log_likelihood
            })
            .collect();
        let log_evidence = *utils::normalise(&mut posteriors, "individual genotype posteriors")?;
        Ok(IndividualInferences {
            genotype_posteriors: posteriors,
            log_evidence,
        })
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

    fn cache(haplotypes: &[Haplotype], reads: Vec<AlignedRead>) -> HaplotypeLikelihoodCache {
        HaplotypeLikelihoodCache::compute(
            haplotypes,
            &[("s1".to_owned(), reads)],
            &RepeatBasedIndelModel,
            |_, gap_extend| HmmModel::new(gap_extend, 0, 0),
        )
        .unwrap()
    }

    #[test]
    fn test_posteriors_normalised() {
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
        ];
        let cache = cache(&haplotypes, reads);
        let prior = GenotypePriorModel::Uniform { n_genotypes: 3 };
        let model = IndividualModel::new(&prior);
        let genotypes = generate_all_genotypes(2, 2);
        let inferences = model.evaluate(&genotypes, &cache.primed(0)).unwrap();
        let total: f64 = inferences
            .genotype_posteriors()
            .iter()
            .map(|p| p.exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        // Reads match the reference haplotype: hom-ref must win.
        assert_eq!(inferences.map_genotype(), 0);
    }

    #[test]
    fn test_uniform_prior_uniform_likelihood_gives_uniform_posterior() {
        // A single haplotype makes every read likelihood identical across
        // the lone genotype; with two identical haplotypes all genotypes tie.
        let sequence = b"ACGTACGTACGTACGTACGT";
        let haplotypes = vec![
            Haplotype::reference(region(100, 120), sequence),
            Haplotype::reference(region(100, 120), sequence),
        ];
        let reads = vec![read("r1", 100, b"ACGTACGTACGTACGT")];
        let cache = cache(&haplotypes, reads);
        let prior = GenotypePriorModel::Uniform { n_genotypes: 3 };
        let model = IndividualModel::new(&prior);
        let genotypes = generate_all_genotypes(2, 2);
        let inferences = model.evaluate(&genotypes, &cache.primed(0)).unwrap();
        for posterior in inferences.genotype_posteriors() {
            assert_relative_eq!(posterior.exp(), 1.0 / 3.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_empty_candidates() {
        let haplotypes = vec![Haplotype::reference(region(100, 120), b"ACGTACGTACGTACGTACGT")];
        let cache = cache(&haplotypes, vec![read("r1", 100, b"ACGTACGTACGTACGT")]);
        let prior = GenotypePriorModel::Uniform { n_genotypes: 0 };
        let model = IndividualModel::new(&prior);
        let err = model.evaluate(&[], &cache.primed(0)).unwrap_err();
        assert!(matches!(err, Error::EmptyCandidates { .. }));
    }
}
