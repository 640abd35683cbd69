// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Value types shared across the engine: genomic regions, alleles, variants,
//! haplotypes and aligned reads, plus the upstream contracts that deliver
//! them into a calling window.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;

use bio_types::genome::{AbstractInterval, Position};
use derive_new::new;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// A half-open genomic interval `[begin, end)` on a named contig.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenomicRegion {
    contig: String,
    range: Range<u64>,
}

impl GenomicRegion {
    pub fn new<C: Into<String>>(contig: C, begin: u64, end: u64) -> Self {
        assert!(begin <= end, "invalid region: begin {} > end {}", begin, end);
        GenomicRegion {
            contig: contig.into(),
            range: begin..end,
        }
    }

    pub fn contig(&self) -> &str {
        &self.contig
    }

    pub fn begin(&self) -> u64 {
        self.range.start
    }

    pub fn end(&self) -> u64 {
        self.range.end
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, other: &GenomicRegion) -> bool {
        self.contig == other.contig && self.begin() <= other.begin() && other.end() <= self.end()
    }

    pub fn contains_pos(&self, pos: u64) -> bool {
        self.range.contains(&pos)
    }

    pub fn overlaps(&self, other: &GenomicRegion) -> bool {
        self.contig == other.contig && self.begin() < other.end() && other.begin() < self.end()
    }

    pub fn intersect(&self, other: &GenomicRegion) -> Option<GenomicRegion> {
        if self.overlaps(other) {
            Some(GenomicRegion::new(
                self.contig.clone(),
                self.begin().max(other.begin()),
                self.end().min(other.end()),
            ))
        } else {
            None
        }
    }
}

impl AbstractInterval for GenomicRegion {
    fn contig(&self) -> &str {
        &self.contig
    }

    fn range(&self) -> Range<Position> {
        self.range.clone()
    }
}

impl fmt::Display for GenomicRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}-{}", self.contig, self.range.start, self.range.end)
    }
}

impl PartialOrd for GenomicRegion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GenomicRegion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.contig
            .cmp(&other.contig)
            .then(self.begin().cmp(&other.begin()))
            .then(self.end().cmp(&other.end()))
    }
}

/// A concrete sequence observed over a region. The replacement sequence may
/// differ in length from the reference span (indels).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Getters)]
pub struct Allele {
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get = "pub")]
    sequence: Vec<u8>,
}

impl Allele {
    pub fn new<S: Into<Vec<u8>>>(region: GenomicRegion, sequence: S) -> Self {
        Allele {
            region,
            sequence: sequence.into(),
        }
    }
}

/// A candidate variant: reference and alternative allele over a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct Variant {
    #[getset(get = "pub")]
    region: GenomicRegion,
    ref_allele: Vec<u8>,
    alt_allele: Vec<u8>,
}

impl Variant {
    pub fn new<R, A>(region: GenomicRegion, ref_allele: R, alt_allele: A) -> Self
    where
        R: Into<Vec<u8>>,
        A: Into<Vec<u8>>,
    {
        Variant {
            region,
            ref_allele: ref_allele.into(),
            alt_allele: alt_allele.into(),
        }
    }

    pub fn ref_allele(&self) -> Allele {
        Allele::new(self.region.clone(), self.ref_allele.clone())
    }

    pub fn alt_allele(&self) -> Allele {
        Allele::new(self.region.clone(), self.alt_allele.clone())
    }

    pub fn is_snv(&self) -> bool {
        self.ref_allele.len() == 1 && self.alt_allele.len() == 1
    }
}

/// One CIGAR operation of a read alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CigarOp {
    Match(u32),
    Ins(u32),
    Del(u32),
    SoftClip(u32),
    HardClip(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CigarString(pub Vec<CigarOp>);

impl CigarString {
    /// Number of reference bases consumed by this alignment.
    pub fn reference_span(&self) -> u64 {
        self.0
            .iter()
            .map(|op| match op {
                CigarOp::Match(n) | CigarOp::Del(n) => u64::from(*n),
                _ => 0,
            })
            .sum()
    }

    /// Number of read bases consumed by this alignment.
    pub fn read_span(&self) -> usize {
        self.0
            .iter()
            .map(|op| match op {
                CigarOp::Match(n) | CigarOp::Ins(n) | CigarOp::SoftClip(n) => *n as usize,
                _ => 0,
            })
            .sum()
    }
}

/// SAM-style flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u16);

impl Flags {
    const PAIRED: u16 = 0x1;
    const UNMAPPED: u16 = 0x4;
    const MATE_UNMAPPED: u16 = 0x8;
    const REVERSE: u16 = 0x10;
    const FIRST_IN_PAIR: u16 = 0x40;
    const SECONDARY: u16 = 0x100;
    const DUPLICATE: u16 = 0x400;
    const SUPPLEMENTARY: u16 = 0x800;

    pub fn is_paired(self) -> bool {
        self.0 & Self::PAIRED != 0
    }

    pub fn is_unmapped(self) -> bool {
        self.0 & Self::UNMAPPED != 0
    }

    pub fn is_mate_unmapped(self) -> bool {
        self.0 & Self::MATE_UNMAPPED != 0
    }

    pub fn is_reverse(self) -> bool {
        self.0 & Self::REVERSE != 0
    }

    pub fn is_first_in_pair(self) -> bool {
        self.0 & Self::FIRST_IN_PAIR != 0
    }

    pub fn is_secondary(self) -> bool {
        self.0 & Self::SECONDARY != 0
    }

    pub fn is_duplicate(self) -> bool {
        self.0 & Self::DUPLICATE != 0
    }

    pub fn is_supplementary(self) -> bool {
        self.0 & Self::SUPPLEMENTARY != 0
    }
}

/// Mapped location of a read's mate.
#[derive(new, Debug, Clone, PartialEq, Eq, Getters)]
pub struct MateSegment {
    #[getset(get = "pub")]
    region: GenomicRegion,
    reverse: bool,
}

impl MateSegment {
    pub fn is_reverse(&self) -> bool {
        self.reverse
    }
}

/// An aligned sequencing read. Immutable after construction; the sequence and
/// base quality vectors always have equal length.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct AlignedRead {
    #[getset(get = "pub")]
    name: String,
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get = "pub")]
    sequence: Vec<u8>,
    #[getset(get = "pub")]
    base_qualities: Vec<u8>,
    #[getset(get = "pub")]
    cigar: CigarString,
    #[getset(get_copy = "pub")]
    mapq: u8,
    #[getset(get_copy = "pub")]
    flags: Flags,
    #[getset(get = "pub")]
    mate: Option<MateSegment>,
}

impl AlignedRead {
    #[allow(clippy::too_many_arguments)]
    pub fn new<S, Q>(
        name: String,
        region: GenomicRegion,
        sequence: S,
        base_qualities: Q,
        cigar: CigarString,
        mapq: u8,
        flags: Flags,
        mate: Option<MateSegment>,
    ) -> Self
    where
        S: Into<Vec<u8>>,
        Q: Into<Vec<u8>>,
    {
        let sequence = sequence.into();
        let base_qualities = base_qualities.into();
        assert_eq!(
            sequence.len(),
            base_qualities.len(),
            "read {}: sequence and base qualities differ in length",
            name
        );
        AlignedRead {
            name,
            region,
            sequence,
            base_qualities,
            cigar,
            mapq,
            flags,
            mate,
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }
}

/// A reconstructed contiguous nucleotide sequence over a window, together
/// with the alleles it was derived from (empty for the reference haplotype).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Getters)]
pub struct Haplotype {
    #[getset(get = "pub")]
    region: GenomicRegion,
    #[getset(get = "pub")]
    sequence: Vec<u8>,
    #[getset(get = "pub")]
    derivation: Vec<Allele>,
}

impl Haplotype {
    /// Build a haplotype over `region` by substituting `alleles` into the
    /// reference sequence of the region. Alleles must be sorted and
    /// non-overlapping, and must be contained in `region`.
    pub fn from_alleles(region: GenomicRegion, reference: &[u8], alleles: Vec<Allele>) -> Self {
        assert_eq!(reference.len() as u64, region.len());
        let mut sequence = Vec::with_capacity(reference.len());
        let mut cursor = region.begin();
        for allele in &alleles {
            assert!(
                region.contains(allele.region()),
                "allele {} outside haplotype window {}",
                allele.region(),
                region
            );
            assert!(allele.region().begin() >= cursor, "overlapping alleles");
            let ref_offset = (cursor - region.begin()) as usize;
            let ref_until = (allele.region().begin() - region.begin()) as usize;
            sequence.extend_from_slice(&reference[ref_offset..ref_until]);
            sequence.extend_from_slice(allele.sequence());
            cursor = allele.region().end();
        }
        sequence.extend_from_slice(&reference[(cursor - region.begin()) as usize..]);
        Haplotype {
            region,
            sequence,
            derivation: alleles,
        }
    }

    /// The plain reference haplotype of a window.
    pub fn reference(region: GenomicRegion, reference: &[u8]) -> Self {
        Haplotype::from_alleles(region, reference, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    pub fn is_reference(&self) -> bool {
        self.derivation.is_empty()
    }

    /// Number of derivation alleles, i.e. mutations relative to the
    /// reference haplotype of the same window.
    pub fn n_mutations(&self) -> usize {
        self.derivation.len()
    }

    pub fn contains_allele(&self, allele: &Allele) -> bool {
        self.restriction(allele.region())
            .map_or(false, |observed| observed.sequence() == allele.sequence())
    }

    /// Extract the allele this haplotype implies over `target`. Derivation
    /// alleles intersecting the target contribute their full replacement
    /// sequence; reference segments are sliced exactly. Returns `None` if the
    /// target does not overlap the haplotype region.
    pub fn restriction(&self, target: &GenomicRegion) -> Option<Allele> {
        let target = self.region.intersect(target)?;
        let mut out = Vec::new();
        // Cursors over reference coordinates and haplotype sequence offsets.
        let mut ref_pos = self.region.begin();
        let mut seq_pos = 0usize;
        let mut copy_reference_segment = |from: u64, until: u64, seq_from: usize, out: &mut Vec<u8>| {
            let lo = from.max(target.begin());
            let hi = until.min(target.end());
            if lo < hi {
                let start = seq_from + (lo - from) as usize;
                let len = (hi - lo) as usize;
                out.extend_from_slice(&self.sequence[start..start + len]);
            }
        };
        for allele in &self.derivation {
            copy_reference_segment(ref_pos, allele.region().begin(), seq_pos, &mut out);
            seq_pos += (allele.region().begin() - ref_pos) as usize;
            if allele.region().overlaps(&target) || (allele.region().is_empty()
                && target.contains_pos(allele.region().begin()))
            {
                out.extend_from_slice(allele.sequence());
            }
            seq_pos += allele.sequence().len();
            ref_pos = allele.region().end();
        }
        copy_reference_segment(ref_pos, self.region.end(), seq_pos, &mut out);
        Some(Allele::new(target, out))
    }
}

/// Upstream contract: streams reads overlapping a region, grouped by sample.
pub trait ReadStream {
    fn reads_in(&self, region: &GenomicRegion, sample: &str) -> Result<Vec<AlignedRead>>;
}

/// Upstream contract: candidate haplotypes spanning a region, deduplicated
/// by sequence.
pub trait HaplotypeSource {
    fn haplotypes_in(&self, region: &GenomicRegion) -> Result<Vec<Haplotype>>;
}
