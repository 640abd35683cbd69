// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Posterior marginalisation and call assembly: from per-sample genotype
//! posteriors to per-allele posterior probabilities, MAP genotype calls and
//! filtered variant calls ready for the VCF layer.

pub mod engine;

use bio::stats::LogProb;
use derive_builder::Builder;
use derive_new::new;
use getset::{CopyGetters, Getters};
use itertools::Itertools;

use crate::model::{Genotype, HaplotypeId};
use crate::utils;
use crate::variants::{Allele, GenomicRegion, Haplotype, Variant};

/// Emitted qualities are capped so that a posterior of exactly one does not
/// serialise as infinity.
pub const MAX_QUALITY: f64 = 3000.0;

/// Phasing information attached to a called genotype: the phase-set region
/// the genotype is phased within, and the confidence of the phasing.
#[derive(new, Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct PhaseCall {
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get_copy = "pub")]
    score: f64,
}

/// Per-sample part of a variant call.
#[derive(Debug, Clone, Builder, Getters, CopyGetters)]
#[builder(pattern = "owned")]
pub struct SampleCall {
    /// The called allele genotype over the call's region.
    #[getset(get = "pub")]
    genotype: Genotype<Allele>,
    /// Phred-scaled confidence of the genotype call.
    #[getset(get_copy = "pub")]
    genotype_posterior: f64,
    /// Phred-scaled posterior that the alt allele is present in the sample.
    #[getset(get_copy = "pub")]
    allele_posterior: f64,
    #[builder(default)]
    #[getset(get = "pub")]
    phase: Option<PhaseCall>,
}

/// A called variant with per-sample genotypes.
#[derive(Debug, Clone, Builder, Getters, CopyGetters)]
#[builder(pattern = "owned")]
pub struct Call {
    #[getset(get = "pub")]
    variant: Variant,
    /// Phred-scaled call quality (maximum per-sample allele posterior).
    #[getset(get_copy = "pub")]
    quality: f64,
    /// Set when the alt allele is carried by a descendant cell group but not
    /// the founder.
    #[builder(default)]
    #[getset(get_copy = "pub")]
    somatic: bool,
    #[getset(get = "pub")]
    sample_calls: Vec<SampleCall>,
}

/// A confident homozygous-reference site.
#[derive(new, Debug, Clone, Getters, CopyGetters)]
pub struct ReferenceCall {
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get_copy = "pub")]
    quality: f64,
}

pub(crate) fn cap_quality(quality: f64) -> f64 {
    if quality.is_finite() {
        quality.min(MAX_QUALITY)
    } else {
        MAX_QUALITY
    }
}

/// `-10·log10(P(not E))` is the Phred quality of event `E`; capped so a
/// posterior of exactly one stays representable.
pub(crate) fn phred_of_complement(prob_complement: LogProb) -> f64 {
    cap_quality(*bio::stats::PHREDProb::from(prob_complement))
}

/// Phred-scaled posterior that `allele` is present in each sample:
/// `P(a in s) = Σ_g q_s(g) · [a ∈ g]`, computed through the complement so
/// the Phred conversion stays accurate for posteriors near one.
pub(crate) fn allele_posteriors(
    genotype_posteriors: &[Vec<LogProb>],
    genotypes: &[Genotype<HaplotypeId>],
    haplotypes: &[Haplotype],
    allele: &Allele,
) -> Vec<f64> {
    let noncontaining: Vec<usize> = genotypes
        .iter()
        .enumerate()
        .filter(|(_, genotype)| !genotype.contains_allele(haplotypes, allele))
        .map(|(idx, _)| idx)
        .collect();
    genotype_posteriors
        .iter()
        .map(|sample| {
            let prob_absent = utils::ln_sum_exp(
                &noncontaining
                    .iter()
                    .map(|&idx| sample[idx])
                    .collect::<Vec<_>>(),
            );
            phred_of_complement(prob_absent)
        })
        .collect()
}

/// MAP genotype index per sample.
pub(crate) fn call_genotypes(genotype_posteriors: &[Vec<LogProb>]) -> Vec<usize> {
    genotype_posteriors
        .iter()
        .map(|sample| {
            sample
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
                .map(|(idx, _)| idx)
                .expect("bug: empty genotype posterior vector")
        })
        .collect()
}

/// Posterior probability that each haplotype is present in at least one
/// sample, from the inverse genotype table.
pub(crate) fn haplotype_posteriors(
    genotype_posteriors: &[Vec<LogProb>],
    genotypes: &[Genotype<HaplotypeId>],
    n_haplotypes: usize,
) -> Vec<f64> {
    let containing = crate::model::inverse_genotype_table(genotypes, n_haplotypes);
    (0..n_haplotypes)
        .map(|haplotype| {
            let mut prob_not_observed = 1.0f64;
            for sample in genotype_posteriors {
                let prob_without: f64 = sample
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| containing[haplotype].binary_search(idx).is_err())
                    .map(|(_, p)| p.exp())
                    .sum();
                prob_not_observed *= prob_without;
            }
            1.0 - prob_not_observed
        })
        .collect()
}

/// Phred-scaled posterior of an allele genotype call: marginalise over all
/// candidate genotypes whose projection onto the call region agrees.
pub(crate) fn allele_genotype_posterior(
    sample_posteriors: &[LogProb],
    allele_genotype: &Genotype<Allele>,
    genotypes: &[Genotype<HaplotypeId>],
    haplotypes: &[Haplotype],
    region: &GenomicRegion,
) -> f64 {
    let prob_disagree = utils::ln_sum_exp(
        &genotypes
            .iter()
            .zip(sample_posteriors.iter())
            .filter(|(genotype, _)| !allele_genotype.agrees_with(genotype, haplotypes, region))
            .map(|(_, &p)| p)
            .collect::<Vec<_>>(),
    );
    phred_of_complement(prob_disagree)
}

pub(crate) struct CallAssemblerInput<'a> {
    pub genotype_posteriors: &'a [Vec<LogProb>],
    pub genotypes: &'a [Genotype<HaplotypeId>],
    pub haplotypes: &'a [Haplotype],
    pub window_region: &'a GenomicRegion,
    pub min_variant_posterior: f64,
    pub min_refcall_posterior: f64,
    pub min_somatic_posterior: f64,
    /// Alt alleles carried by a descendant cell group but not the founder.
    pub somatic_alleles: Vec<Allele>,
}

/// Assemble filtered variant calls and reference calls from per-sample
/// genotype posteriors and the candidate list.
pub(crate) fn assemble_calls(
    input: &CallAssemblerInput,
    candidates: &[Variant],
) -> (Vec<Call>, Vec<ReferenceCall>) {
    let map_genotypes = call_genotypes(input.genotype_posteriors);
    let mut calls = Vec::new();
    let mut reference_calls = Vec::new();
    for candidate in candidates {
        let alt = candidate.alt_allele();
        let posteriors = allele_posteriors(
            input.genotype_posteriors,
            input.genotypes,
            input.haplotypes,
            &alt,
        );
        let somatic = input.somatic_alleles.contains(&alt);
        let min_posterior = if somatic {
            input.min_variant_posterior.max(input.min_somatic_posterior)
        } else {
            input.min_variant_posterior
        };
        let above = posteriors.iter().any(|&p| p >= min_posterior);
        let alt_called = map_genotypes
            .iter()
            .any(|&g| input.genotypes[g].contains_allele(input.haplotypes, &alt));
        if above && alt_called {
            let quality = posteriors
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            let sample_calls = map_genotypes
                .iter()
                .zip(input.genotype_posteriors.iter())
                .zip(posteriors.iter())
                .map(|((&map_idx, sample_posteriors), &allele_posterior)| {
                    let genotype = input.genotypes[map_idx]
                        .project(input.haplotypes, candidate.region());
                    let genotype_posterior = allele_genotype_posterior(
                        sample_posteriors,
                        &genotype,
                        input.genotypes,
                        input.haplotypes,
                        candidate.region(),
                    );
                    let phase = if genotype.is_homozygous() {
                        None
                    } else {
                        Some(PhaseCall::new(
                            input.window_region.clone(),
                            genotype_posterior,
                        ))
                    };
                    SampleCallBuilder::default()
                        .genotype(genotype)
                        .genotype_posterior(genotype_posterior)
                        .allele_posterior(allele_posterior)
                        .phase(phase)
                        .build()
                        .expect("bug: incomplete sample call")
                })
                .collect_vec();
            calls.push(
                CallBuilder::default()
                    .variant(candidate.clone())
                    .quality(quality)
                    .somatic(somatic)
                    .sample_calls(sample_calls)
                    .build()
                    .expect("bug: incomplete call"),
            );
        } else {
            // Not callable as a variant; emit a reference call if the ref
            // allele is confidently present somewhere.
            let ref_posteriors = allele_posteriors(
                input.genotype_posteriors,
                input.genotypes,
                input.haplotypes,
                &candidate.ref_allele(),
            );
            let quality = ref_posteriors
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max);
            if quality >= input.min_refcall_posterior {
                reference_calls.push(ReferenceCall::new(candidate.region().clone(), quality));
            }
        }
    }
    (calls, reference_calls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_all_genotypes;
    use approx::assert_relative_eq;

    fn region(begin: u64, end: u64) -> GenomicRegion {
        GenomicRegion::new("1", begin, end)
    }

    const REF_SEQ: &[u8] = b"ACGT";

    fn haplotypes() -> Vec<Haplotype> {
        vec![
            Haplotype::reference(region(10, 14), REF_SEQ),
            Haplotype::from_alleles(
                region(10, 14),
                REF_SEQ,
                vec![Allele::new(region(12, 13), b"A".to_vec())],
            ),
        ]
    }

    fn posteriors(p: &[f64]) -> Vec<LogProb> {
        p.iter().map(|&x| LogProb(x.ln())).collect()
    }

    #[test]
    fn test_allele_posterior_sums_containing_genotypes() {
        let haplotypes = haplotypes();
        let genotypes = generate_all_genotypes(2, 2);
        // sample: hom-ref 0.1, het 0.6, hom-alt 0.3
        let q = vec![posteriors(&[0.1, 0.6, 0.3])];
        let alt = Allele::new(region(12, 13), b"A".to_vec());
        let phred = allele_posteriors(&q, &genotypes, &haplotypes, &alt);
        // P(alt present) = 0.9, so Phred(0.1).
        assert_relative_eq!(phred[0], 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_call_emitted_only_with_map_support() {
        let haplotypes = haplotypes();
        let genotypes = generate_all_genotypes(2, 2);
        let candidate = Variant::new(region(12, 13), b"G".to_vec(), b"A".to_vec());
        // High allele posterior but MAP genotype is hom-ref: no call.
        let q = vec![posteriors(&[0.5, 0.45, 0.05])];
        let input = CallAssemblerInput {
            genotype_posteriors: &q,
            genotypes: &genotypes,
            haplotypes: &haplotypes,
            window_region: &region(10, 14),
            min_variant_posterior: 2.0,
            min_refcall_posterior: 2.0,
            min_somatic_posterior: 2.0,
            somatic_alleles: Vec::new(),
        };
        let (calls, _) = assemble_calls(&input, std::slice::from_ref(&candidate));
        assert!(calls.is_empty());

        let q = vec![posteriors(&[0.02, 0.93, 0.05])];
        let input = CallAssemblerInput {
            genotype_posteriors: &q,
            ..input
        };
        let (calls, reference_calls) = assemble_calls(&input, std::slice::from_ref(&candidate));
        assert_eq!(calls.len(), 1);
        assert!(reference_calls.is_empty());
        let call = &calls[0];
        assert!(call.quality() > 10.0);
        let sample = &call.sample_calls()[0];
        // Heterozygous call carries a phase set.
        assert!(!sample.genotype().is_homozygous());
        assert!(sample.phase().is_some());
    }

    #[test]
    fn test_reference_call_for_uncalled_candidate() {
        let haplotypes = haplotypes();
        let genotypes = generate_all_genotypes(2, 2);
        let candidate = Variant::new(region(12, 13), b"G".to_vec(), b"A".to_vec());
        let q = vec![posteriors(&[0.999, 0.0005, 0.0005])];
        let input = CallAssemblerInput {
            genotype_posteriors: &q,
            genotypes: &genotypes,
            haplotypes: &haplotypes,
            window_region: &region(10, 14),
            min_variant_posterior: 2.0,
            min_refcall_posterior: 2.0,
            min_somatic_posterior: 2.0,
            somatic_alleles: Vec::new(),
        };
        let (calls, reference_calls) = assemble_calls(&input, std::slice::from_ref(&candidate));
        assert!(calls.is_empty());
        assert_eq!(reference_calls.len(), 1);
        assert!(reference_calls[0].quality() >= 30.0);
    }

    #[test]
    fn test_haplotype_posteriors() {
        let genotypes = generate_all_genotypes(2, 2);
        let q = vec![posteriors(&[0.25, 0.5, 0.25])];
        let posteriors = haplotype_posteriors(&q, &genotypes, 2);
        assert_relative_eq!(posteriors[0], 0.75, epsilon = 1e-9);
        assert_relative_eq!(posteriors[1], 0.75, epsilon = 1e-9);
    }

    #[test]
    fn test_projection_round_trip() {
        let haplotypes = haplotypes();
        let genotypes = generate_all_genotypes(2, 2);
        let window = region(10, 14);
        for genotype in &genotypes {
            let projected = genotype.project(&haplotypes, &window);
            assert_eq!(projected.back_project(&haplotypes), Some(genotype.clone()));
        }
    }
}
