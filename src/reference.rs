// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Read-only reference sequence access. The engine only ever fetches bytes by
//! region; how those bytes are materialised (indexed fasta, in-memory cache)
//! is the backend's concern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};
use crate::variants::GenomicRegion;

/// Upstream contract: fetch the reference sequence of a region.
pub trait Reference: Send + Sync {
    fn fetch_sequence(&self, region: &GenomicRegion) -> Result<Vec<u8>>;
}

/// A reference held fully in memory, keyed by contig name.
#[derive(Debug, Default)]
pub struct InMemoryReference {
    contigs: HashMap<String, Vec<u8>>,
}

impl InMemoryReference {
    pub fn new() -> Self {
        InMemoryReference::default()
    }

    pub fn with_contig<C: Into<String>, S: Into<Vec<u8>>>(mut self, name: C, sequence: S) -> Self {
        self.contigs.insert(name.into(), sequence.into());
        self
    }
}

impl Reference for InMemoryReference {
    fn fetch_sequence(&self, region: &GenomicRegion) -> Result<Vec<u8>> {
        let contig = self
            .contigs
            .get(region.contig())
            .ok_or_else(|| Error::UnknownContig {
                name: region.contig().to_owned(),
            })?;
        if region.end() > contig.len() as u64 {
            return Err(Error::RangeOutOfBounds {
                region: region.clone(),
                contig_len: contig.len() as u64,
            });
        }
        Ok(contig[region.begin() as usize..region.end() as usize].to_vec())
    }
}

/// Serialises access to a backend that is not thread-safe. Windows running on
/// worker threads share one buffer; fetches of identical regions are served
/// from a small cache without touching the backend again.
pub struct Buffer<R> {
    inner: Mutex<R>,
    sequences: Mutex<HashMap<GenomicRegion, Arc<Vec<u8>>>>,
}

impl<R: Reference> Buffer<R> {
    pub fn new(inner: R) -> Self {
        Buffer {
            inner: Mutex::new(inner),
            sequences: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Reference> Reference for Buffer<R> {
    fn fetch_sequence(&self, region: &GenomicRegion) -> Result<Vec<u8>> {
        if let Some(cached) = self.sequences.lock().unwrap().get(region) {
            return Ok(cached.as_ref().clone());
        }
        let sequence = self.inner.lock().unwrap().fetch_sequence(region)?;
        self.sequences
            .lock()
            .unwrap()
            .insert(region.clone(), Arc::new(sequence.clone()));
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_fetch() {
        let reference = InMemoryReference::new().with_contig("1", b"ACGTACGT".to_vec());
        let seq = reference
            .fetch_sequence(&GenomicRegion::new("1", 2, 6))
            .unwrap();
        assert_eq!(seq, b"GTAC");
    }

    #[test]
    fn test_unknown_contig() {
        let reference = InMemoryReference::new();
        let err = reference
            .fetch_sequence(&GenomicRegion::new("MT", 0, 1))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownContig { .. }));
    }

    #[test]
    fn test_out_of_bounds() {
        let reference = InMemoryReference::new().with_contig("1", b"ACGT".to_vec());
        let err = reference
            .fetch_sequence(&GenomicRegion::new("1", 2, 10))
            .unwrap_err();
        assert!(matches!(err, Error::RangeOutOfBounds { .. }));
    }
}
