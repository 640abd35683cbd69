// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

/// Caching behaviour of the coalescent prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachingStrategy {
    #[default]
    None,
    ByAddress,
}

/// Parameters of a mutation-count based model (coalescent genotype prior or
/// de novo mutation model on phylogeny edges).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct MutationModelParams {
    pub theta: f64,
    pub caching: CachingStrategy,
}

impl Default for MutationModelParams {
    fn default() -> Self {
        MutationModelParams {
            theta: 1e-3_f64.ln().abs(),
            caching: CachingStrategy::ByAddress,
        }
    }
}

/// Whether variational Bayes seeds are evaluated sequentially or in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPolicy {
    #[default]
    Seq,
    Par,
}

/// Which inference engine a window is evaluated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallerMode {
    /// Exact per-sample posteriors; joint across samples when more than one.
    #[default]
    Population,
    /// Variational mixture model for subclonal composition.
    Subclone,
    /// Mixture-of-mixtures over a cell phylogeny.
    Cell,
}

/// All options recognised by the core engine. Thresholds are Phred-scaled.
#[derive(Debug, Clone, Builder, Getters, CopyGetters, Serialize, Deserialize)]
#[builder(pattern = "owned", default)]
pub struct Config {
    #[getset(get_copy = "pub")]
    pub ploidy: u32,
    #[getset(get_copy = "pub")]
    pub mode: CallerMode,
    #[getset(get_copy = "pub")]
    pub max_joint_genotypes: usize,
    #[getset(get_copy = "pub")]
    pub max_genotype_combinations: usize,
    #[getset(get_copy = "pub")]
    pub max_vb_seeds: usize,
    #[getset(get_copy = "pub")]
    pub dropout_concentration: f64,
    #[getset(get_copy = "pub")]
    pub group_concentration: f64,
    #[getset(get_copy = "pub")]
    pub mutation_model_parameters: MutationModelParams,
    /// Coalescent prior parameters; absent means a uniform genotype prior.
    #[getset(get = "pub")]
    pub prior_model_params: Option<MutationModelParams>,
    #[getset(get_copy = "pub")]
    pub deduplicate_haplotypes_with_prior_model: bool,
    #[getset(get_copy = "pub")]
    pub min_variant_posterior: f64,
    #[getset(get_copy = "pub")]
    pub min_refcall_posterior: f64,
    #[getset(get_copy = "pub")]
    pub min_somatic_posterior: f64,
    #[getset(get_copy = "pub")]
    pub em_epsilon: f64,
    #[getset(get_copy = "pub")]
    pub max_em_iterations: usize,
    #[getset(get_copy = "pub")]
    pub vb_epsilon: f64,
    #[getset(get_copy = "pub")]
    pub max_vb_iterations: usize,
    #[getset(get_copy = "pub")]
    pub execution_policy: ExecutionPolicy,
    /// Rough upper bound on inference working memory, in bytes. When the
    /// dense responsibility matrices would exceed it, the VB engines fall
    /// back to a recomputing update path.
    #[getset(get_copy = "pub")]
    pub target_max_memory: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ploidy: 2,
            mode: CallerMode::Population,
            max_joint_genotypes: 1_000_000,
            max_genotype_combinations: 10_000,
            max_vb_seeds: 12,
            dropout_concentration: 1.5,
            group_concentration: 1.0,
            mutation_model_parameters: MutationModelParams::default(),
            prior_model_params: None,
            deduplicate_haplotypes_with_prior_model: false,
            min_variant_posterior: 2.0,
            min_refcall_posterior: 2.0,
            min_somatic_posterior: 2.0,
            em_epsilon: 1e-3,
            max_em_iterations: 100,
            vb_epsilon: 0.05,
            max_vb_iterations: 1000,
            execution_policy: ExecutionPolicy::Seq,
            target_max_memory: None,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = Config::builder().ploidy(3).build().unwrap();
        assert_eq!(config.ploidy(), 3);
        assert_eq!(config.max_vb_seeds(), 12);
        assert!(config.prior_model_params().is_none());
    }
}
