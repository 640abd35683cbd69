// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Genotypes and the inference models operating on them. Haplotypes are large
//! and shared between many genotypes, so a genotype over haplotypes stores
//! small indices into the window's haplotype arena rather than owning
//! sequences.

pub mod cell;
pub mod individual;
pub mod likelihood;
pub mod pairhmm;
pub mod phylogeny;
pub mod population;
pub mod priors;
pub mod repeats;
pub mod subclone;
pub(crate) mod vb;

use itertools::Itertools;

use crate::variants::{Allele, GenomicRegion, Haplotype};

/// Index into a window's haplotype arena.
pub type HaplotypeId = usize;

/// An ordered multiset of fixed size (the ploidy). `T` is a haplotype index
/// within a window, or an [`Allele`] for projected call-level genotypes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Genotype<T> {
    members: Vec<T>,
}

impl<T: Ord> Genotype<T> {
    pub fn new(mut members: Vec<T>) -> Self {
        assert!(!members.is_empty(), "genotype must have ploidy >= 1");
        members.sort();
        Genotype { members }
    }

    pub fn ploidy(&self) -> u32 {
        self.members.len() as u32
    }

    pub fn members(&self) -> &[T] {
        &self.members
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.members.iter()
    }

    pub fn contains(&self, member: &T) -> bool {
        self.members.binary_search(member).is_ok()
    }

    pub fn multiplicity(&self, member: &T) -> usize {
        self.members.iter().filter(|m| *m == member).count()
    }

    pub fn is_homozygous(&self) -> bool {
        self.members.iter().all(|m| *m == self.members[0])
    }

}

impl<T: Ord + Clone> Genotype<T> {
    /// Distinct members with their multiplicities, in member order.
    pub fn counts(&self) -> Vec<(T, usize)> {
        let mut result: Vec<(T, usize)> = Vec::new();
        for member in &self.members {
            match result.last_mut() {
                Some((last, count)) if last == member => *count += 1,
                _ => result.push((member.clone(), 1)),
            }
        }
        result
    }
}

/// Number of genotypes of the given ploidy over `n` haplotypes, i.e. the
/// number of multisets `C(n + ploidy - 1, ploidy)`.
pub fn num_genotypes(n: usize, ploidy: u32) -> usize {
    let mut result = 1usize;
    for i in 0..ploidy as usize {
        result = result.saturating_mul(n + i) / (i + 1);
    }
    result
}

/// Enumerate every genotype of the given ploidy over haplotype indices
/// `0..n`, in lexicographic order of the sorted index vectors.
pub fn generate_all_genotypes(n: usize, ploidy: u32) -> Vec<Genotype<HaplotypeId>> {
    assert!(n > 0);
    (0..n)
        .combinations_with_replacement(ploidy as usize)
        .map(Genotype::new)
        .collect()
}

/// For every haplotype, the (sorted, deduplicated) indices of the genotypes
/// containing it.
pub(crate) fn inverse_genotype_table(
    genotypes: &[Genotype<HaplotypeId>],
    n_haplotypes: usize,
) -> Vec<Vec<usize>> {
    let mut table = vec![Vec::new(); n_haplotypes];
    for (genotype_idx, genotype) in genotypes.iter().enumerate() {
        for &haplotype in genotype.iter() {
            let entry: &mut Vec<usize> = &mut table[haplotype];
            if entry.last() != Some(&genotype_idx) {
                entry.push(genotype_idx);
            }
        }
    }
    table
}

impl Genotype<HaplotypeId> {
    /// Project onto `region`, yielding the allele genotype this haplotype
    /// genotype implies there.
    pub fn project(&self, haplotypes: &[Haplotype], region: &GenomicRegion) -> Genotype<Allele> {
        Genotype::new(
            self.members
                .iter()
                .map(|&h| {
                    haplotypes[h]
                        .restriction(region)
                        .expect("bug: projection region outside haplotype window")
                })
                .collect(),
        )
    }

    pub fn is_homozygous_reference(&self, haplotypes: &[Haplotype]) -> bool {
        self.is_homozygous() && haplotypes[self.members[0]].is_reference()
    }

    /// Whether any haplotype of this genotype carries the given allele.
    pub fn contains_allele(&self, haplotypes: &[Haplotype], allele: &Allele) -> bool {
        self.members
            .iter()
            .any(|&h| haplotypes[h].contains_allele(allele))
    }
}

impl Genotype<Allele> {
    /// Map each allele back to the lowest-index haplotype implying it over
    /// the allele's region. Inverse of [`Genotype::project`] whenever the
    /// projection region covers the haplotype window.
    pub fn back_project(&self, haplotypes: &[Haplotype]) -> Option<Genotype<HaplotypeId>> {
        let members = self
            .members
            .iter()
            .map(|allele| {
                haplotypes.iter().position(|haplotype| {
                    haplotype
                        .restriction(allele.region())
                        .map_or(false, |observed| &observed == allele)
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Genotype::new(members))
    }

    /// Whether this allele genotype is consistent with the projection of the
    /// given haplotype genotype.
    pub fn agrees_with(
        &self,
        genotype: &Genotype<HaplotypeId>,
        haplotypes: &[Haplotype],
        region: &GenomicRegion,
    ) -> bool {
        &genotype.project(haplotypes, region) == self
    }
}

/// Find the homozygous-reference genotype by linear scan.
pub(crate) fn find_hom_ref_index(
    genotypes: &[Genotype<HaplotypeId>],
    haplotypes: &[Haplotype],
) -> Option<usize> {
    genotypes
        .iter()
        .position(|g| g.is_homozygous_reference(haplotypes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_genotypes() {
        assert_eq!(num_genotypes(2, 2), 3);
        assert_eq!(num_genotypes(4, 2), 10);
        assert_eq!(num_genotypes(3, 1), 3);
        assert_eq!(num_genotypes(2, 3), 4);
    }

    #[test]
    fn test_generate_all_genotypes() {
        let genotypes = generate_all_genotypes(2, 2);
        assert_eq!(genotypes.len(), 3);
        assert_eq!(genotypes[0].members(), &[0, 0]);
        assert_eq!(genotypes[1].members(), &[0, 1]);
        assert_eq!(genotypes[2].members(), &[1, 1]);
        for genotypes in [generate_all_genotypes(5, 2), generate_all_genotypes(3, 4)] {
            let expected = num_genotypes(
                genotypes.last().unwrap().members().last().unwrap() + 1,
                genotypes[0].ploidy(),
            );
            assert_eq!(genotypes.len(), expected);
        }
    }

    #[test]
    fn test_multiplicity_and_counts() {
        let genotype = Genotype::new(vec![1, 0, 1]);
        assert_eq!(genotype.members(), &[0, 1, 1]);
        assert_eq!(genotype.multiplicity(&1), 2);
        assert_eq!(genotype.counts(), vec![(0, 1), (1, 2)]);
        assert!(!genotype.is_homozygous());
        assert!(Genotype::new(vec![2, 2]).is_homozygous());
    }

    #[test]
    fn test_inverse_genotype_table() {
        let genotypes = generate_all_genotypes(2, 2);
        let table = inverse_genotype_table(&genotypes, 2);
        assert_eq!(table[0], vec![0, 1]);
        assert_eq!(table[1], vec![1, 2]);
    }
}
