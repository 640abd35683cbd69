use thiserror::Error;

use crate::variants::GenomicRegion;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("read of {read_len} bp cannot be aligned against padded haplotype of {haplotype_len} bp")]
    AlignmentImpossible {
        read_len: usize,
        haplotype_len: usize,
    },
    #[error("no candidate haplotypes or genotypes ({context})")]
    EmptyCandidates { context: &'static str },
    #[error("{feature} is not supported by the {model} model")]
    UnimplementedFeature {
        feature: String,
        model: &'static str,
    },
    #[error("normalisation of {context} produced a non-finite value")]
    NumericInstability { context: &'static str },
    #[error("unknown contig {name}")]
    UnknownContig { name: String },
    #[error("region {region} exceeds contig bounds (contig length {contig_len})")]
    RangeOutOfBounds {
        region: GenomicRegion,
        contig_len: u64,
    },
    #[error("upstream read stream failed for sample {sample}: {msg}")]
    ReadStreamFailed { sample: String, msg: String },
}

pub type Result<T> = std::result::Result<T, Error>;
