#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod adapter;
pub mod builder;
pub mod config;
pub mod conform;
pub mod design;
pub mod display;
pub mod error;
pub mod labeled;
pub mod likelihood;
pub mod pipeline;
pub mod result;

#[path = "../solver/mod.rs"]
pub mod solver;

pub use config::{ConfigError, ScanConfig};
pub use error::QtlError;
pub use labeled::LabeledMatrix;
pub use likelihood::{Likelihood, LikelihoodDescriptor};
pub use pipeline::{CandidateIndex, ScanRequest, scan};
pub use result::{CandidateRecord, NullResult, ScanResult, VariantResult};
