// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bio::stats::LogProb;

use crate::errors::{Error, Result};

pub(crate) mod k_medoids;
pub(crate) mod select_top_k;
pub(crate) mod worker_pool;

/// Cooperative cancellation. Checked between windows, between EM/VB
/// iterations and between VB seeds; a cancelled window produces no output.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// `LogProb::ln_sum_exp` that tolerates an empty slice.
pub(crate) fn ln_sum_exp(probs: &[LogProb]) -> LogProb {
    if probs.is_empty() {
        LogProb::ln_zero()
    } else {
        LogProb::ln_sum_exp(probs)
    }
}

/// Normalise log probabilities in place and return the normalisation constant
/// (the log sum). `ln_sum_exp` is max-shifted already; a non-finite result
/// after shifting means the inputs themselves are degenerate.
pub(crate) fn normalise(probs: &mut [LogProb], context: &'static str) -> Result<LogProb> {
    let norm = LogProb::ln_sum_exp(probs);
    if norm.is_nan() {
        return Err(Error::NumericInstability { context });
    }
    if *norm == f64::NEG_INFINITY {
        // All hypotheses have zero probability; fall back to uniform rather
        // than emitting NaNs downstream.
        let uniform = LogProb((1.0 / probs.len() as f64).ln());
        probs.iter_mut().for_each(|p| *p = uniform);
        return Ok(norm);
    }
    probs.iter_mut().for_each(|p| *p = *p - norm);
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalise() {
        let mut probs = vec![LogProb(0.5f64.ln()), LogProb(0.5f64.ln())];
        normalise(&mut probs, "test").unwrap();
        assert_relative_eq!(probs[0].exp(), 0.5);
        assert_relative_eq!(probs.iter().map(|p| p.exp()).sum::<f64>(), 1.0);
    }

    #[test]
    fn test_normalise_degenerate() {
        let mut probs = vec![LogProb::ln_zero(); 4];
        normalise(&mut probs, "test").unwrap();
        assert_relative_eq!(probs[0].exp(), 0.25);
    }

    #[test]
    fn test_ln_sum_exp_empty() {
        assert_eq!(ln_sum_exp(&[]), LogProb::ln_zero());
    }
}
