// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-window inference engine. A window owns its haplotype arena, read
//! slices and likelihood cache; windows are processed in parallel and their
//! results are re-ordered by window index before emission.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::Result as AnyResult;
use bio::stats::LogProb;
use crossbeam::channel::Receiver;
use getset::{CopyGetters, Getters};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::calling::{
    assemble_calls, call_genotypes, haplotype_posteriors, Call, CallAssemblerInput, ReferenceCall,
};
use crate::config::{CallerMode, Config};
use crate::errors::Result;
use crate::model::cell::{
    DeNovoModel, SingleCellModel, SingleCellModelOptions, SingleCellPriorModel,
};
use crate::model::likelihood::HaplotypeLikelihoodCache;
use crate::model::pairhmm::HmmModel;
use crate::model::phylogeny::Phylogeny;
use crate::model::population::{PopulationModel, PopulationModelOptions};
use crate::model::priors::{CoalescentModel, CoalescentProbabilityGreater, GenotypePriorModel};
use crate::model::repeats::RepeatBasedIndelModel;
use crate::model::subclone::{SubcloneModel, SubcloneModelOptions};
use crate::model::{find_hom_ref_index, generate_all_genotypes, Genotype, HaplotypeId};
use crate::utils::worker_pool::{worker_pool, Orderable};
use crate::utils::CancellationToken;
use crate::variants::{Allele, AlignedRead, GenomicRegion, Haplotype, Variant};

/// Lifecycle of a window. Transitions are strictly forward; any failure
/// releases the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Empty,
    HaplotypesLoaded,
    LikelihoodsComputed,
    InferenceDone,
    Emitted,
    Released,
}

/// One unit of work: a genomic region with its candidate haplotypes,
/// candidate variants and per-sample reads.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct Window {
    #[getset(get_copy = "pub")]
    index: usize,
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get = "pub")]
    haplotypes: Vec<Haplotype>,
    #[getset(get = "pub")]
    candidates: Vec<Variant>,
    #[getset(get = "pub")]
    reads_by_sample: Vec<(String, Vec<AlignedRead>)>,
}

impl Window {
    pub fn new(
        index: usize,
        region: GenomicRegion,
        haplotypes: Vec<Haplotype>,
        candidates: Vec<Variant>,
        reads_by_sample: Vec<(String, Vec<AlignedRead>)>,
    ) -> Self {
        Window {
            index,
            region,
            haplotypes,
            candidates,
            reads_by_sample,
        }
    }

    /// Assemble a window from the upstream contracts: candidate haplotypes
    /// from the haplotype source, reads per sample from the read stream.
    pub fn from_sources<H, R>(
        index: usize,
        region: GenomicRegion,
        samples: &[String],
        haplotype_source: &H,
        read_stream: &R,
        candidates: Vec<Variant>,
    ) -> Result<Self>
    where
        H: crate::variants::HaplotypeSource,
        R: crate::variants::ReadStream,
    {
        let haplotypes = haplotype_source.haplotypes_in(&region)?;
        let reads_by_sample = samples
            .iter()
            .map(|sample| {
                read_stream
                    .reads_in(&region, sample)
                    .map(|reads| (sample.clone(), reads))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Window::new(
            index,
            region,
            haplotypes,
            candidates,
            reads_by_sample,
        ))
    }
}

impl Orderable for Window {
    fn index(&self) -> usize {
        self.index
    }
}

/// Diagnostics attached to a window's result. Locally recovered conditions
/// land here; they never silently alter posteriors.
#[derive(Debug, Clone, Default, Getters, CopyGetters)]
pub struct Diagnostics {
    /// Set when EM or VB stopped at its iteration cap.
    #[getset(get_copy = "pub")]
    pub non_convergence: bool,
    #[getset(get = "pub")]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct WindowResult {
    #[getset(get_copy = "pub")]
    index: usize,
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get = "pub")]
    samples: Vec<String>,
    /// The deduplicated haplotype arena the genotype indices refer to.
    #[getset(get = "pub")]
    haplotypes: Vec<Haplotype>,
    /// Normalised genotype posterior per sample.
    #[getset(get = "pub")]
    genotype_posteriors: Vec<Vec<LogProb>>,
    /// MAP genotype per sample, as indices into the arena.
    #[getset(get = "pub")]
    map_genotypes: Vec<Genotype<HaplotypeId>>,
    /// Posterior that each haplotype is present in at least one sample.
    #[getset(get = "pub")]
    haplotype_posteriors: Vec<f64>,
    #[getset(get = "pub")]
    calls: Vec<Call>,
    #[getset(get = "pub")]
    reference_calls: Vec<ReferenceCall>,
    #[getset(get_copy = "pub")]
    log_evidence: f64,
    #[getset(get = "pub")]
    diagnostics: Diagnostics,
}

impl Orderable for WindowResult {
    fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug)]
pub struct Engine {
    config: Config,
}

/// Marginal genotype posteriors and bookkeeping produced by whichever
/// inference model ran.
struct ModelOutput {
    genotype_posteriors: Vec<Vec<LogProb>>,
    log_evidence: f64,
    non_convergence: bool,
    somatic_alleles: Vec<Allele>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Engine { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Infer genotype posteriors and calls for one window. Returns `None`
    /// when the token is cancelled before the result is assembled.
    pub fn infer(
        &self,
        window: Window,
        token: &CancellationToken,
    ) -> Result<Option<WindowResult>> {
        let mut state = WindowState::Empty;
        let result = self.infer_inner(window, token, &mut state);
        if result.is_err() || matches!(result, Ok(None)) {
            state = WindowState::Released;
        }
        debug!("window finished in state {:?}", state);
        result
    }

    fn infer_inner(
        &self,
        window: Window,
        token: &CancellationToken,
        state: &mut WindowState,
    ) -> Result<Option<WindowResult>> {
        let Window {
            index,
            region,
            haplotypes,
            candidates,
            reads_by_sample,
        } = window;
        let samples: Vec<String> = reads_by_sample.iter().map(|(s, _)| s.clone()).collect();
        let haplotypes = self.deduplicate_haplotypes(haplotypes);
        if haplotypes.is_empty() {
            // Nothing to genotype against; skip the window rather than
            // aborting the run.
            warn!("window {} has no candidate haplotypes, skipping", region);
            return Ok(None);
        }
        *state = WindowState::HaplotypesLoaded;
        if token.is_cancelled() {
            return Ok(None);
        }

        let (lhs_flank, rhs_flank) = flank_sizes(&region, &haplotypes, &candidates);
        let likelihoods = HaplotypeLikelihoodCache::compute(
            &haplotypes,
            &reads_by_sample,
            &RepeatBasedIndelModel,
            |_, gap_extend| HmmModel::new(gap_extend, lhs_flank, rhs_flank),
        )?;
        *state = WindowState::LikelihoodsComputed;
        if token.is_cancelled() {
            return Ok(None);
        }

        let genotypes = generate_all_genotypes(haplotypes.len(), self.config.ploidy());
        if genotypes.is_empty() {
            warn!("window {} has no candidate genotypes, skipping", region);
            return Ok(None);
        }
        let prior = self.make_prior_model(&haplotypes, genotypes.len());
        let mut rng = window_rng(&region);
        let output = match self.config.mode() {
            CallerMode::Population => {
                self.infer_population(&genotypes, &haplotypes, &likelihoods, &prior, token)?
            }
            CallerMode::Subclone => {
                self.infer_subclone(&genotypes, &likelihoods, &prior, &mut rng, token)?
            }
            CallerMode::Cell => self.infer_cell(
                &genotypes,
                &haplotypes,
                &likelihoods,
                &prior,
                &mut rng,
                token,
            )?,
        };
        *state = WindowState::InferenceDone;
        if token.is_cancelled() {
            return Ok(None);
        }

        let map_genotypes: Vec<Genotype<HaplotypeId>> =
            call_genotypes(&output.genotype_posteriors)
                .into_iter()
                .map(|idx| genotypes[idx].clone())
                .collect();
        let haplotype_posteriors =
            haplotype_posteriors(&output.genotype_posteriors, &genotypes, haplotypes.len());
        let assembler_input = CallAssemblerInput {
            genotype_posteriors: &output.genotype_posteriors,
            genotypes: &genotypes,
            haplotypes: &haplotypes,
            window_region: &region,
            min_variant_posterior: self.config.min_variant_posterior(),
            min_refcall_posterior: self.config.min_refcall_posterior(),
            min_somatic_posterior: self.config.min_somatic_posterior(),
            somatic_alleles: output.somatic_alleles,
        };
        let (calls, mut reference_calls) = assemble_calls(&assembler_input, &candidates);
        if candidates.is_empty() {
            // No candidates at all: the window itself is a reference call if
            // some sample confidently carries only reference haplotypes.
            if let Some(quality) = self.window_refcall_quality(
                &output.genotype_posteriors,
                &genotypes,
                &haplotypes,
            ) {
                reference_calls.push(ReferenceCall::new(region.clone(), quality));
            }
        }
        let mut diagnostics = Diagnostics::default();
        if output.non_convergence {
            diagnostics.non_convergence = true;
            diagnostics
                .notes
                .push("inference stopped at the iteration cap".to_owned());
        }
        *state = WindowState::Emitted;
        Ok(Some(WindowResult {
            index,
            region,
            samples,
            haplotypes,
            genotype_posteriors: output.genotype_posteriors,
            map_genotypes,
            haplotype_posteriors,
            calls,
            reference_calls,
            log_evidence: output.log_evidence,
            diagnostics,
        }))
    }

    /// Remove haplotypes with identical sequences. With a coalescent prior
    /// configured for deduplication, the representative of each group is the
    /// one the prior favours; otherwise the first seen wins.
    fn deduplicate_haplotypes(&self, haplotypes: Vec<Haplotype>) -> Vec<Haplotype> {
        if haplotypes.len() < 2 {
            return haplotypes;
        }
        let order: Vec<usize> = if self.config.deduplicate_haplotypes_with_prior_model() {
            let params = (*self.config.prior_model_params())
                .unwrap_or_else(|| self.config.mutation_model_parameters());
            let model = CoalescentModel::new(params, &haplotypes);
            let cmp = CoalescentProbabilityGreater::new(&model);
            let mut order: Vec<usize> = (0..haplotypes.len()).collect();
            order.sort_by(|&a, &b| cmp.compare(a, b));
            order
        } else {
            (0..haplotypes.len()).collect()
        };
        let mut seen: Vec<&[u8]> = Vec::new();
        let mut keep = vec![false; haplotypes.len()];
        for &idx in &order {
            let sequence = haplotypes[idx].sequence().as_slice();
            if !seen.contains(&sequence) {
                seen.push(sequence);
                keep[idx] = true;
            }
        }
        haplotypes
            .into_iter()
            .zip(keep)
            .filter(|(_, keep)| *keep)
            .map(|(haplotype, _)| haplotype)
            .collect()
    }

    fn make_prior_model(
        &self,
        haplotypes: &[Haplotype],
        n_genotypes: usize,
    ) -> GenotypePriorModel {
        match self.config.prior_model_params() {
            Some(params) => {
                GenotypePriorModel::Coalescent(CoalescentModel::new(*params, haplotypes))
            }
            None => GenotypePriorModel::Uniform { n_genotypes },
        }
    }

    fn infer_population(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodCache,
        prior: &GenotypePriorModel,
        token: &CancellationToken,
    ) -> Result<ModelOutput> {
        let model = PopulationModel::new(
            prior,
            PopulationModelOptions {
                max_joint_genotypes: self.config.max_joint_genotypes(),
                max_em_iterations: self.config.max_em_iterations(),
                em_epsilon: self.config.em_epsilon(),
            },
        );
        let hom_ref_idx = find_hom_ref_index(genotypes, haplotypes);
        let inferences =
            model.evaluate(genotypes, haplotypes.len(), likelihoods, hom_ref_idx, token)?;
        Ok(ModelOutput {
            genotype_posteriors: inferences.marginal_posteriors().clone(),
            log_evidence: inferences.log_evidence(),
            non_convergence: !inferences.em_converged(),
            somatic_alleles: Vec::new(),
        })
    }

    fn infer_subclone(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        likelihoods: &HaplotypeLikelihoodCache,
        prior: &GenotypePriorModel,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<ModelOutput> {
        let model = SubcloneModel::new(prior, self.subclone_options());
        let inferences = model.evaluate(genotypes, likelihoods, rng, token)?;
        // The latent genotype is shared; every sample reports the same
        // marginal.
        let genotype_posteriors =
            vec![inferences.genotype_posteriors().clone(); likelihoods.n_samples()];
        Ok(ModelOutput {
            genotype_posteriors,
            log_evidence: inferences.log_evidence(),
            non_convergence: !inferences.converged(),
            somatic_alleles: Vec::new(),
        })
    }

    /// Evaluate competing phylogeny topologies (founder-only and founder
    /// plus one descendant), normalise across them by log evidence, and
    /// marginalise genotype posteriors over topologies, groups and
    /// attachments.
    fn infer_cell(
        &self,
        genotypes: &[Genotype<HaplotypeId>],
        haplotypes: &[Haplotype],
        likelihoods: &HaplotypeLikelihoodCache,
        prior: &GenotypePriorModel,
        rng: &mut StdRng,
        token: &CancellationToken,
    ) -> Result<ModelOutput> {
        let mut topologies = vec![Phylogeny::founder(())];
        let mut two_group = Phylogeny::founder(());
        two_group.add_descendant((), 0);
        topologies.push(two_group);

        let mut inferences = Vec::with_capacity(topologies.len());
        for topology in topologies {
            let prior_model = SingleCellPriorModel::new(
                topology,
                prior,
                DeNovoModel::new(self.config.mutation_model_parameters(), haplotypes),
            );
            let model = SingleCellModel::new(prior_model, self.cell_options());
            inferences.push(model.evaluate(genotypes, likelihoods, rng, token)?);
        }

        let mut phylogeny_posteriors: Vec<LogProb> =
            inferences.iter().map(|i| LogProb(i.log_evidence())).collect();
        let log_evidence =
            *crate::utils::normalise(&mut phylogeny_posteriors, "phylogeny posteriors")?;

        let n_samples = likelihoods.n_samples();
        let mut genotype_posteriors =
            vec![vec![0.0f64; genotypes.len()]; n_samples];
        for (inference, &topology_posterior) in
            inferences.iter().zip(phylogeny_posteriors.iter())
        {
            for (_, group) in inference.phylogeny().iter() {
                for sample in 0..n_samples {
                    let attachment = group.sample_attachment_posteriors()[sample];
                    for (slot, &p) in genotype_posteriors[sample]
                        .iter_mut()
                        .zip(group.genotype_posteriors().iter())
                    {
                        *slot += topology_posterior.exp() * attachment * p;
                    }
                }
            }
        }
        let genotype_posteriors: Vec<Vec<LogProb>> = genotype_posteriors
            .into_iter()
            .map(|sample| sample.into_iter().map(|p| LogProb(p.ln())).collect())
            .collect();

        let somatic_alleles = somatic_alleles(&inferences, &phylogeny_posteriors, genotypes, haplotypes);
        let non_convergence = inferences.iter().any(|i| !i.converged());
        Ok(ModelOutput {
            genotype_posteriors,
            log_evidence,
            non_convergence,
            somatic_alleles,
        })
    }

    /// Model comparison score for the cell caller. Deliberately not
    /// implemented; callers must not rely on it.
    pub fn calculate_model_posterior(&self, _result: &WindowResult) -> Option<f64> {
        None
    }

    fn window_refcall_quality(
        &self,
        genotype_posteriors: &[Vec<LogProb>],
        genotypes: &[Genotype<HaplotypeId>],
        haplotypes: &[Haplotype],
    ) -> Option<f64> {
        let hom_ref_idx = find_hom_ref_index(genotypes, haplotypes)?;
        let quality = genotype_posteriors
            .iter()
            .map(|sample| {
                let prob_not_ref = crate::utils::ln_sum_exp(
                    &sample
                        .iter()
                        .enumerate()
                        .filter(|(idx, _)| *idx != hom_ref_idx)
                        .map(|(_, &p)| p)
                        .collect::<Vec<_>>(),
                );
                crate::calling::phred_of_complement(prob_not_ref)
            })
            .fold(f64::NEG_INFINITY, f64::max);
        if quality >= self.config.min_refcall_posterior() {
            Some(quality)
        } else {
            None
        }
    }

    fn subclone_options(&self) -> SubcloneModelOptions {
        SubcloneModelOptions {
            epsilon: self.config.vb_epsilon(),
            max_iterations: self.config.max_vb_iterations(),
            max_seeds: self.config.max_vb_seeds(),
            dropout_concentration: self.config.dropout_concentration(),
            execution_policy: self.config.execution_policy(),
            target_max_memory: self.config.target_max_memory(),
        }
    }

    fn cell_options(&self) -> SingleCellModelOptions {
        SingleCellModelOptions {
            max_genotype_combinations: self.config.max_genotype_combinations(),
            max_seeds: self.config.max_vb_seeds(),
            epsilon: self.config.vb_epsilon(),
            max_iterations: self.config.max_vb_iterations(),
            dropout_concentration: self.config.dropout_concentration(),
            group_concentration: self.config.group_concentration(),
            execution_policy: self.config.execution_policy(),
            target_max_memory: self.config.target_max_memory(),
            max_em_iterations: self.config.max_em_iterations(),
            em_epsilon: self.config.em_epsilon(),
        }
    }

    /// Process windows from a channel on a worker pool. Results reach the
    /// sink in window-index order; cancelled windows are dropped whole.
    pub fn call_windows<P>(
        &self,
        windows: Receiver<Window>,
        threads: usize,
        token: &CancellationToken,
        mut sink: P,
    ) -> AnyResult<()>
    where
        P: FnMut(WindowResult) -> AnyResult<()> + Send,
    {
        worker_pool(
            threads,
            threads * 2,
            windows,
            |window: Window| {
                if token.is_cancelled() {
                    return Ok(None);
                }
                Ok(self.infer(window, token)?)
            },
            |result| sink(result),
        )
    }
}

/// Free emission flanks: the haplotype bases outside the span of the
/// candidate variants carry no evidence about the alleles under test.
fn flank_sizes(
    region: &GenomicRegion,
    haplotypes: &[Haplotype],
    candidates: &[Variant],
) -> (usize, usize) {
    if candidates.is_empty() {
        return (0, 0);
    }
    let active_begin = candidates
        .iter()
        .map(|v| v.region().begin())
        .min()
        .unwrap_or_else(|| region.begin());
    let active_end = candidates
        .iter()
        .map(|v| v.region().end())
        .max()
        .unwrap_or_else(|| region.end());
    let haplotype_begin = haplotypes
        .iter()
        .map(|h| h.region().begin())
        .min()
        .unwrap_or_else(|| region.begin());
    let haplotype_end = haplotypes
        .iter()
        .map(|h| h.region().end())
        .max()
        .unwrap_or_else(|| region.end());
    (
        active_begin.saturating_sub(haplotype_begin) as usize,
        haplotype_end.saturating_sub(active_end) as usize,
    )
}

/// Deterministic per-window generator seeded by the window's region, so VB
/// restarts are reproducible regardless of scheduling.
fn window_rng(region: &GenomicRegion) -> StdRng {
    let mut hasher = DefaultHasher::new();
    region.hash(&mut hasher);
    StdRng::seed_from_u64(hasher.finish())
}

/// Alt alleles that the maximum-posterior topology places in a descendant
/// group but not in the founder.
fn somatic_alleles(
    inferences: &[crate::model::cell::CellInferences],
    phylogeny_posteriors: &[LogProb],
    genotypes: &[Genotype<HaplotypeId>],
    haplotypes: &[Haplotype],
) -> Vec<Allele> {
    let map_topology = phylogeny_posteriors
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    let phylogeny = inferences[map_topology].phylogeny();
    let map_group_genotype = |group: &crate::model::cell::GroupInferences| {
        group
            .genotype_posteriors()
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(idx, _)| idx)
            .expect("bug: empty group posterior")
    };
    let founder_genotype = &genotypes[map_group_genotype(phylogeny.group(0))];
    let founder_alleles: Vec<&Allele> = founder_genotype
        .iter()
        .flat_map(|&h| haplotypes[h].derivation().iter())
        .collect();
    let mut result = Vec::new();
    for (group_idx, group) in phylogeny.iter() {
        if group_idx == 0 {
            continue;
        }
        let genotype = &genotypes[map_group_genotype(group)];
        for &haplotype in genotype.iter() {
            for allele in haplotypes[haplotype].derivation() {
                if !founder_alleles.contains(&allele) && !result.contains(allele) {
                    result.push(allele.clone());
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::variants::{CigarOp, CigarString, Flags};
    use approx::assert_relative_eq;
    use crossbeam::channel::unbounded;

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

    fn het_window(index: usize) -> Window {
        let window_region = region(100, 120);
        let haplotypes = vec![
            Haplotype::reference(window_region.clone(), REF_SEQ),
            Haplotype::from_alleles(
                window_region.clone(),
                REF_SEQ,
                vec![Allele::new(region(110, 111), b"T".to_vec())],
            ),
        ];
        let candidates = vec![Variant::new(region(110, 111), b"G".to_vec(), b"T".to_vec())];
        let mut reads = Vec::new();
        for i in 0..10 {
            reads.push(read(&format!("ref{}", i), 100, b"ACGTACGTACGTACGTACGT"));
            reads.push(read(&format!("alt{}", i), 100, b"ACGTACGTACTTACGTACGT"));
        }
        Window::new(
            index,
            window_region,
            haplotypes,
            candidates,
            vec![("s1".to_owned(), reads)],
        )
    }

    #[test]
    fn test_heterozygous_window_called() {
        let engine = Engine::new(Config::default());
        let result = engine
            .infer(het_window(0), &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(result.calls().len(), 1);
        let call = &result.calls()[0];
        assert!(call.quality() > 20.0);
        let sample = &call.sample_calls()[0];
        assert!(!sample.genotype().is_homozygous());
        // Posterior vector normalised.
        let total: f64 = result.genotype_posteriors()[0]
            .iter()
            .map(|p| p.exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_deduplicate_haplotypes() {
        let engine = Engine::new(Config::default());
        let window_region = region(100, 120);
        let haplotypes = vec![
            Haplotype::reference(window_region.clone(), REF_SEQ),
            Haplotype::reference(window_region.clone(), REF_SEQ),
            Haplotype::from_alleles(
                window_region,
                REF_SEQ,
                vec![Allele::new(region(110, 111), b"T".to_vec())],
            ),
        ];
        let deduplicated = engine.deduplicate_haplotypes(haplotypes);
        assert_eq!(deduplicated.len(), 2);
    }

    #[test]
    fn test_cancelled_window_produces_no_output() {
        let engine = Engine::new(Config::default());
        let token = CancellationToken::new();
        token.cancel();
        let result = engine.infer(het_window(0), &token).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_call_windows_ordered_and_cancellable() {
        let engine = Engine::new(Config::default());
        let token = CancellationToken::new();
        let (sender, receiver) = unbounded();
        for i in 0..4 {
            sender.send(het_window(i)).unwrap();
        }
        drop(sender);
        let mut indices = Vec::new();
        engine
            .call_windows(receiver, 2, &token, |result| {
                indices.push(result.index());
                Ok(())
            })
            .unwrap();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_window_rng_deterministic() {
        let a = window_rng(&region(10, 20));
        let b = window_rng(&region(10, 20));
        assert_eq!(format!("{:?}", a), format!("{:?}", b));
    }

    #[test]
    fn test_model_posterior_not_implemented() {
        let engine = Engine::new(Config::default());
        let result = engine
            .infer(het_window(0), &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert!(engine.calculate_model_posterior(&result).is_none());
    }
}
