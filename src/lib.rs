// Copyright 2024 argonaut developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Core inference engine for germline, somatic and single-cell variant
//! calling. Given a reference window, a set of candidate haplotypes and
//! per-sample aligned reads, the engine computes posterior distributions over
//! sample genotypes and emits variant calls with quantified confidence.
//!
//! Reference access, read alignment, candidate discovery and VCF
//! serialisation are upstream/downstream collaborators; see the traits in
//! [`reference`] and [`variants`] for the contracts the engine consumes.

#[macro_use]
extern crate lazy_static;

pub mod calling;
pub mod config;
pub mod errors;
pub mod model;
pub mod reference;
pub mod utils;
pub mod variants;

pub use crate::calling::engine::{Engine, WindowResult};
pub use crate::config::Config;
pub use crate::errors::Error;
