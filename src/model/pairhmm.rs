// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Banded affine-gap pair-HMM scoring a read against a haplotype around an
//! anchor offset. Emissions are driven by base qualities; gap-open costs are
//! position-specific (repeat-aware); bases inside the haplotype's flanks are
//! emitted freely so that candidate-free context does not penalise the score.

use bio::stats::{LogProb, PHREDProb, Prob};
use getset::CopyGetters;

use crate::errors::{Error, Result};

/// Width of the band around the anchor diagonal.
pub(crate) const BAND: usize = 8;

lazy_static! {
    static ref PROB_CONFUSION: LogProb = LogProb::from(Prob(1.0 / 3.0));
}

/// Fixed parameters of the alignment model: affine gap extension and the
/// flank sizes within which emission is free.
#[derive(Debug, Clone, Copy, Default, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct HmmModel {
    gap_extend: u8,
    lhs_flank: usize,
    rhs_flank: usize,
}

impl HmmModel {
    pub fn new(gap_extend: u8, lhs_flank: usize, rhs_flank: usize) -> Self {
        HmmModel {
            gap_extend,
            lhs_flank,
            rhs_flank,
        }
    }
}

#[inline]
fn phred_to_log_prob(penalty: u8) -> LogProb {
    LogProb::from(PHREDProb(f64::from(penalty)))
}

#[inline]
fn prob_base_miscall(quality: u8) -> LogProb {
    LogProb::from(PHREDProb(f64::from(quality)))
}

// LogProb wraps a plain f64 and is not `Ord`.
#[inline]
fn max2(a: LogProb, b: LogProb) -> LogProb {
    if a > b {
        a
    } else {
        b
    }
}

#[inline]
fn max3(a: LogProb, b: LogProb, c: LogProb) -> LogProb {
    max2(max2(a, b), c)
}

/// Log probability of the best alignment of `read` against `haplotype`,
/// banded around `offset`. Start and end gaps on the haplotype are free
/// (semiglobal); the read must be consumed completely.
///
/// Fails with `AlignmentImpossible` only if the read cannot fit the padded
/// haplotype at all, which upstream invariants rule out.
pub fn align_around_offset(
    haplotype: &[u8],
    read: &[u8],
    base_qualities: &[u8],
    gap_open: &[u8],
    offset: usize,
    model: &HmmModel,
) -> Result<LogProb> {
    assert_eq!(read.len(), base_qualities.len());
    assert_eq!(haplotype.len(), gap_open.len());
    if read.is_empty() || read.len() > haplotype.len() + BAND {
        return Err(Error::AlignmentImpossible {
            read_len: read.len(),
            haplotype_len: haplotype.len() + BAND,
        });
    }
    let window_end = haplotype.len().min(offset + read.len() + BAND);
    // Clamp so the window always spans enough haplotype for the read even if
    // the caller anchors past the end.
    let window_begin = offset
        .saturating_sub(BAND)
        .min(window_end.saturating_sub(read.len() + BAND));
    let width = window_end - window_begin;
    debug_assert!(width >= read.len().min(haplotype.len()));

    let gap_extend = phred_to_log_prob(model.gap_extend());
    let rhs_flank_begin = haplotype.len().saturating_sub(model.rhs_flank());
    let in_flank = |i: usize| i < model.lhs_flank() || i >= rhs_flank_begin;

    // DP over haplotype window positions (rows) and read prefix lengths
    // (columns). `match_`/`insert` include emission of read base j-1;
    // `delete` consumes haplotype base i-1 silently.
    let ninf = LogProb::ln_zero();
    let columns = read.len() + 1;
    let mut match_ = vec![ninf; (width + 1) * columns];
    let mut insert = vec![ninf; (width + 1) * columns];
    let mut delete = vec![ninf; (width + 1) * columns];
    let idx = |i: usize, j: usize| i * columns + j;

    for i in 0..=width {
        // Free start gap on the haplotype.
        match_[idx(i, 0)] = LogProb::ln_one();
    }
    for i in 1..=width {
        let hap_pos = window_begin + i - 1;
        let hap_base = haplotype[hap_pos].to_ascii_uppercase();
        let open = phred_to_log_prob(gap_open[hap_pos]);
        for j in 1..=read.len() {
            let miscall = prob_base_miscall(base_qualities[j - 1]);
            let emit = if in_flank(hap_pos) {
                LogProb::ln_one()
            } else if read[j - 1].to_ascii_uppercase() == hap_base {
                miscall.ln_one_minus_exp()
            } else {
                miscall + *PROB_CONFUSION
            };
            let diag = idx(i - 1, j - 1);
            match_[idx(i, j)] = emit + max3(match_[diag], insert[diag], delete[diag]);

            let up = idx(i, j - 1);
            let emit_ins = if in_flank(hap_pos) {
                LogProb::ln_one()
            } else {
                miscall
            };
            insert[idx(i, j)] = emit_ins + max2(match_[up] + open, insert[up] + gap_extend);

            let left = idx(i - 1, j);
            delete[idx(i, j)] = max2(match_[left] + open, delete[left] + gap_extend);
        }
    }

    let mut best = ninf;
    for i in 1..=width {
        // Free end gap on the haplotype: the read may end anywhere.
        best = max3(best, match_[idx(i, read.len())], insert[idx(i, read.len())]);
    }
    if *best == f64::NEG_INFINITY {
        return Err(Error::AlignmentImpossible {
            read_len: read.len(),
            haplotype_len: haplotype.len() + BAND,
        });
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model() -> HmmModel {
        HmmModel::new(3, 0, 0)
    }

    fn uniform_open(len: usize) -> Vec<u8> {
        vec![45; len]
    }

    #[test]
    fn test_perfect_match_scores_high() {
        let haplotype = b"ACGTACGTACGT";
        let read = b"TACG";
        let quals = vec![30u8; read.len()];
        let score =
            align_around_offset(haplotype, read, &quals, &uniform_open(12), 3, &model()).unwrap();
        // Four matched bases at Q30.
        let expected: LogProb = (0..4)
            .map(|_| LogProb::from(PHREDProb(30.0)).ln_one_minus_exp())
            .sum();
        assert_relative_eq!(*score, *expected, epsilon = 1e-9);
    }

    #[test]
    fn test_mismatch_penalised() {
        let haplotype = b"ACGTACGTACGT";
        let quals = vec![30u8; 4];
        let matched =
            align_around_offset(haplotype, b"TACG", &quals, &uniform_open(12), 3, &model()).unwrap();
        let mismatched =
            align_around_offset(haplotype, b"TACC", &quals, &uniform_open(12), 3, &model()).unwrap();
        assert!(matched > mismatched);
    }

    #[test]
    fn test_translation_equivariance() {
        let haplotype = b"GGGGACGTACGTGGGG";
        let read = b"ACGTACGT";
        let quals = vec![25u8; read.len()];
        let score = align_around_offset(
            haplotype,
            read,
            &quals,
            &uniform_open(haplotype.len()),
            4,
            &model(),
        )
        .unwrap();
        let mut shifted = b"TTTT".to_vec();
        shifted.extend_from_slice(haplotype);
        let shifted_score = align_around_offset(
            &shifted,
            read,
            &quals,
            &uniform_open(shifted.len()),
            8,
            &model(),
        )
        .unwrap();
        assert_relative_eq!(*score, *shifted_score, epsilon = 1e-9);
    }

    #[test]
    fn test_flank_masking_is_free() {
        let haplotype = b"ACGTACGTACGT";
        let read = b"TTTT";
        let quals = vec![30u8; 4];
        // Entire haplotype inside the left flank: all emissions free.
        let free_model = HmmModel::new(3, 12, 0);
        let score =
            align_around_offset(haplotype, read, &quals, &uniform_open(12), 0, &free_model)
                .unwrap();
        assert_relative_eq!(*score, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_read_longer_than_padded_haplotype() {
        let haplotype = b"ACGT";
        let read = vec![b'A'; 32];
        let quals = vec![30u8; 32];
        let err = align_around_offset(haplotype, &read, &quals, &uniform_open(4), 0, &model())
            .unwrap_err();
        assert!(matches!(err, Error::AlignmentImpossible { .. }));
    }

    #[test]
    fn test_deletion_cheaper_in_repeat_tract() {
        // Read lacks one repeat unit; with relaxed gap open inside the
        // tract the alignment must score better than with stiff penalties.
        let haplotype = b"ACGTAAAAAATGCA";
        let read = b"ACGTAAAAATGCA";
        let quals = vec![30u8; read.len()];
        let mut relaxed = uniform_open(haplotype.len());
        for slot in &mut relaxed[4..10] {
            *slot = 10;
        }
        let stiff =
            align_around_offset(haplotype, read, &quals, &uniform_open(14), 0, &model()).unwrap();
        let loose = align_around_offset(haplotype, read, &quals, &relaxed, 0, &model()).unwrap();
        assert!(loose > stiff);
    }
}
