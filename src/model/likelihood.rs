// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Read-to-haplotype likelihoods. For every (sample, read, haplotype) triple
//! the cache stores the best pair-HMM log probability over a handful of
//! candidate mapping positions, computed once per window and immutable
//! afterwards.

use std::collections::HashMap;

use bio::stats::LogProb;
use getset::Getters;

use crate::errors::Result;
use crate::model::pairhmm::{align_around_offset, HmmModel};
use crate::model::repeats::{gap_penalties, IndelPenaltyTable};
use crate::model::{Genotype, HaplotypeId};
use crate::variants::{AlignedRead, Haplotype};

/// Slack beyond the read end that an anchored alignment needs inside the
/// haplotype.
const ALIGNMENT_SLACK: usize = 15;

/// K-mer length used to find extra candidate mapping positions.
const MAPPING_KMER: usize = 15;

fn num_out_of_range_bases(position: usize, read: &AlignedRead, haplotype: &Haplotype) -> usize {
    (read.len() + position + ALIGNMENT_SLACK).saturating_sub(haplotype.len())
}

fn is_in_range(position: usize, read: &AlignedRead, haplotype: &Haplotype) -> bool {
    num_out_of_range_bases(position, read, haplotype) == 0
}

fn original_mapping_position(read: &AlignedRead, haplotype: &Haplotype) -> usize {
    read.region()
        .begin()
        .saturating_sub(haplotype.region().begin()) as usize
}

/// Best alignment log probability of a read over the given candidate mapping
/// positions. Out-of-range candidates are skipped; if none is in range the
/// read's original mapping position is shifted left by the minimum amount
/// that brings the alignment back in range.
pub(crate) fn log_probability(
    read: &AlignedRead,
    haplotype: &Haplotype,
    gap_open: &[u8],
    model: &HmmModel,
    mapping_positions: &[usize],
) -> Result<LogProb> {
    let original_position = original_mapping_position(read, haplotype);
    let mut best: Option<LogProb> = None;
    let mut original_tried = false;
    for &position in mapping_positions {
        if is_in_range(position, read, haplotype) {
            let current = align_around_offset(
                haplotype.sequence(),
                read.sequence(),
                read.base_qualities(),
                gap_open,
                position,
                model,
            )?;
            if best.map_or(true, |b| current > b) {
                best = Some(current);
            }
        }
        if position == original_position {
            original_tried = true;
        }
    }
    if !original_tried && is_in_range(original_position, read, haplotype) {
        let current = align_around_offset(
            haplotype.sequence(),
            read.sequence(),
            read.base_qualities(),
            gap_open,
            original_position,
            model,
        )?;
        if best.map_or(true, |b| current > b) {
            best = Some(current);
        }
    }
    match best {
        Some(best) => Ok(best),
        None => {
            let min_shift = num_out_of_range_bases(original_position, read, haplotype);
            let position = original_position.saturating_sub(min_shift);
            align_around_offset(
                haplotype.sequence(),
                read.sequence(),
                read.base_qualities(),
                gap_open,
                position,
                model,
            )
        }
    }
}

/// Candidate mapping positions of a read on a haplotype: the aligner's
/// reported position plus exact hits of the read's leading k-mer.
fn candidate_mapping_positions(
    read: &AlignedRead,
    haplotype: &Haplotype,
    kmer_index: &HashMap<&[u8], Vec<usize>>,
) -> Vec<usize> {
    let mut positions = vec![original_mapping_position(read, haplotype)];
    if read.len() >= MAPPING_KMER {
        if let Some(hits) = kmer_index.get(&read.sequence()[..MAPPING_KMER]) {
            positions.extend(hits.iter().copied());
        }
    }
    positions.sort_unstable();
    positions.dedup();
    positions
}

fn kmer_index(haplotype: &Haplotype) -> HashMap<&[u8], Vec<usize>> {
    let mut index: HashMap<&[u8], Vec<usize>> = HashMap::new();
    let sequence = haplotype.sequence();
    if sequence.len() >= MAPPING_KMER {
        for pos in 0..=sequence.len() - MAPPING_KMER {
            index
                .entry(&sequence[pos..pos + MAPPING_KMER])
                .or_default()
                .push(pos);
        }
    }
    index
}

/// Per-window likelihood store, keyed by sample. Lookup requires priming to
/// a sample first; the primed view is borrowed, never owning.
#[derive(Debug, Clone, Getters)]
pub struct HaplotypeLikelihoodCache {
    #[getset(get = "pub")]
    samples: Vec<String>,
    /// `likelihoods[sample][haplotype][read]`
    likelihoods: Vec<Vec<Vec<LogProb>>>,
}

impl HaplotypeLikelihoodCache {
    /// Align every read of every sample against every haplotype. The flank
    /// model and gap-extension penalty come from `flank_model`; gap-open
    /// penalty vectors are derived per haplotype from the repeat-aware
    /// `table`.
    pub fn compute<T: IndelPenaltyTable>(
        haplotypes: &[Haplotype],
        reads_by_sample: &[(String, Vec<AlignedRead>)],
        table: &T,
        flank_model: impl Fn(&Haplotype, u8) -> HmmModel,
    ) -> Result<Self> {
        let mut likelihoods = vec![vec![Vec::new(); haplotypes.len()]; reads_by_sample.len()];
        for (haplotype_idx, haplotype) in haplotypes.iter().enumerate() {
            let (gap_open, gap_extend) = gap_penalties(table, haplotype.sequence());
            let model = flank_model(haplotype, gap_extend);
            let index = kmer_index(haplotype);
            for (sample_idx, (_, reads)) in reads_by_sample.iter().enumerate() {
                let mut entries = Vec::with_capacity(reads.len());
                for read in reads {
                    let positions = candidate_mapping_positions(read, haplotype, &index);
                    entries.push(log_probability(
                        read, haplotype, &gap_open, &model, &positions,
                    )?);
                }
                likelihoods[sample_idx][haplotype_idx] = entries;
            }
        }
        Ok(HaplotypeLikelihoodCache {
            samples: reads_by_sample
                .iter()
                .map(|(name, _)| name.clone())
                .collect(),
            likelihoods,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_haplotypes(&self) -> usize {
        self.likelihoods.first().map_or(0, |sample| sample.len())
    }

    /// Fix the sample context for subsequent lookups.
    pub fn primed(&self, sample: usize) -> PrimedLikelihoods<'_> {
        PrimedLikelihoods {
            cache: self,
            sample,
        }
    }

    /// A virtual pooled sample over the given sample set: its read set is the
    /// union of the samples' reads, so its per-genotype log likelihoods are
    /// the sums of the per-sample ones.
    pub fn merge_samples(&self, samples: &[usize], pooled_name: &str) -> Self {
        let n_haplotypes = self.n_haplotypes();
        let mut pooled = vec![Vec::new(); n_haplotypes];
        for (haplotype_idx, entry) in pooled.iter_mut().enumerate() {
            for &sample in samples {
                entry.extend_from_slice(&self.likelihoods[sample][haplotype_idx]);
            }
        }
        HaplotypeLikelihoodCache {
            samples: vec![pooled_name.to_owned()],
            likelihoods: vec![pooled],
        }
    }
}

/// Borrowed view of the cache with the sample context fixed.
#[derive(Debug, Clone, Copy)]
pub struct PrimedLikelihoods<'a> {
    cache: &'a HaplotypeLikelihoodCache,
    sample: usize,
}

impl<'a> PrimedLikelihoods<'a> {
    /// Likelihood vector over all reads of the primed sample.
    pub fn haplotype(&self, haplotype: HaplotypeId) -> &'a [LogProb] {
        &self.cache.likelihoods[self.sample][haplotype]
    }

    pub fn read(&self, read: usize, haplotype: HaplotypeId) -> LogProb {
        self.cache.likelihoods[self.sample][haplotype][read]
    }

    pub fn n_reads(&self) -> usize {
        self.cache.likelihoods[self.sample]
            .first()
            .map_or(0, |reads| reads.len())
    }
}

/// Constant-mixture genotype likelihood: each read is drawn uniformly from
/// the haplotype copies of the genotype.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantMixtureModel;

impl ConstantMixtureModel {
    pub fn evaluate(
        &self,
        genotype: &Genotype<HaplotypeId>,
        likelihoods: &PrimedLikelihoods,
    ) -> LogProb {
        let ln_ploidy = f64::from(genotype.ploidy()).ln();
        let counts = genotype.counts();
        (0..likelihoods.n_reads())
            .map(|read| {
                LogProb::ln_sum_exp(
                    &counts
                        .iter()
                        .map(|&(haplotype, multiplicity)| {
                            LogProb((multiplicity as f64).ln() - ln_ploidy)
                                + likelihoods.read(read, haplotype)
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .sum()
    }
}

/// Genotype log likelihoods for one sample over all candidate genotypes.
pub(crate) fn genotype_log_likelihoods(
    genotypes: &[Genotype<HaplotypeId>],
    likelihoods: &PrimedLikelihoods,
) -> Vec<LogProb> {
    let model = ConstantMixtureModel;
    genotypes
        .iter()
        .map(|genotype| model.evaluate(genotype, likelihoods))
        .collect()
}
