// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Genotype prior models. A small tagged sum: uniform, Hardy-Weinberg with
//! per-haplotype frequencies, or coalescent (mutation-count based). All three
//! are deterministic; the coalescent cache is interior mutability only.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;

use bio::stats::LogProb;
use statrs::function::gamma::ln_gamma;

use crate::config::{CachingStrategy, MutationModelParams};
use crate::model::{Genotype, HaplotypeId};
use crate::variants::{Allele, Haplotype};

#[derive(Debug)]
pub enum GenotypePriorModel {
    Uniform { n_genotypes: usize },
    HardyWeinberg(HardyWeinbergModel),
    Coalescent(CoalescentModel),
}

impl GenotypePriorModel {
    /// Log prior of a candidate genotype. `genotype_idx` keys the coalescent
    /// by-address cache; it must be stable for the lifetime of the window.
    pub fn ln_prob(&self, genotype_idx: usize, genotype: &Genotype<HaplotypeId>) -> LogProb {
        match self {
            GenotypePriorModel::Uniform { n_genotypes } => {
                LogProb(-(*n_genotypes as f64).ln())
            }
            GenotypePriorModel::HardyWeinberg(model) => model.evaluate(genotype),
            GenotypePriorModel::Coalescent(model) => model.evaluate(genotype_idx, genotype),
        }
    }
}

/// Hardy-Weinberg prior: a genotype is a multinomial draw of its haplotypes
/// from the population frequencies.
#[derive(Debug, Clone)]
pub struct HardyWeinbergModel {
    frequencies: Vec<f64>,
}

impl HardyWeinbergModel {
    pub fn new(frequencies: Vec<f64>) -> Self {
        assert!(frequencies.iter().all(|&f| f >= 0.0));
        HardyWeinbergModel { frequencies }
    }

    pub fn uniform(n_haplotypes: usize) -> Self {
        HardyWeinbergModel::new(vec![1.0 / n_haplotypes as f64; n_haplotypes])
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn set_frequencies(&mut self, frequencies: Vec<f64>) {
        assert_eq!(frequencies.len(), self.frequencies.len());
        self.frequencies = frequencies;
    }

    /// `log (n! / Π m_h!) + Σ m_h · log f_h`
    pub fn evaluate(&self, genotype: &Genotype<HaplotypeId>) -> LogProb {
        let n = f64::from(genotype.ploidy());
        let mut ln_prob = ln_gamma(n + 1.0);
        for (haplotype, multiplicity) in genotype.counts() {
            ln_prob -= ln_gamma(multiplicity as f64 + 1.0);
            ln_prob += multiplicity as f64 * self.frequencies[haplotype].max(f64::MIN_POSITIVE).ln();
        }
        LogProb(ln_prob)
    }
}

/// Coalescent prior: `log P(g) = -θ · k` (up to the normalisation shared by
/// all candidates) where `k` is the number of distinct mutations carried by
/// the genotype relative to the designated reference haplotype.
#[derive(Debug)]
pub struct CoalescentModel {
    theta: f64,
    caching: CachingStrategy,
    /// Derivation alleles per haplotype, relative to the reference.
    haplotype_mutations: Vec<Vec<Allele>>,
    cache: RefCell<HashMap<usize, LogProb>>,
}

impl CoalescentModel {
    pub fn new(params: MutationModelParams, haplotypes: &[Haplotype]) -> Self {
        CoalescentModel {
            theta: params.theta,
            caching: params.caching,
            haplotype_mutations: haplotypes
                .iter()
                .map(|haplotype| haplotype.derivation().clone())
                .collect(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    fn num_distinct_mutations(&self, genotype: &Genotype<HaplotypeId>) -> usize {
        let mut mutations: Vec<&Allele> = genotype
            .counts()
            .into_iter()
            .flat_map(|(haplotype, _)| self.haplotype_mutations[haplotype].iter())
            .collect();
        mutations.sort();
        mutations.dedup();
        mutations.len()
    }

    pub fn evaluate(&self, genotype_idx: usize, genotype: &Genotype<HaplotypeId>) -> LogProb {
        if self.caching == CachingStrategy::ByAddress {
            if let Some(&cached) = self.cache.borrow().get(&genotype_idx) {
                return cached;
            }
        }
        let ln_prob = LogProb(-self.theta * self.num_distinct_mutations(genotype) as f64);
        if self.caching == CachingStrategy::ByAddress {
            self.cache.borrow_mut().insert(genotype_idx, ln_prob);
        }
        ln_prob
    }

    /// Prior probability of a single haplotype, used for deduplication
    /// ordering.
    fn haplotype_ln_prob(&self, haplotype: usize) -> LogProb {
        LogProb(-self.theta * self.haplotype_mutations[haplotype].len() as f64)
    }
}

/// Orders haplotypes by descending coalescent probability; used to pick the
/// representative when deduplicating haplotypes with the prior model.
#[derive(Debug)]
pub struct CoalescentProbabilityGreater<'a> {
    model: &'a CoalescentModel,
}

impl<'a> CoalescentProbabilityGreater<'a> {
    pub fn new(model: &'a CoalescentModel) -> Self {
        CoalescentProbabilityGreater { model }
    }

    pub fn compare(&self, lhs: usize, rhs: usize) -> Ordering {
        self.model
            .haplotype_ln_prob(rhs)
            .partial_cmp(&self.model.haplotype_ln_prob(lhs))
            .unwrap_or(Ordering::Equal)
            .then(lhs.cmp(&rhs))
    }
}
