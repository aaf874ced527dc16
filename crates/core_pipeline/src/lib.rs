//! Core pipeline for Roomie
//!
//! This crate provides the data model for one room-design submission
//! and the two pure stages of the pipeline: bounding the user's photo
//! to a submission budget, and validating the endpoint's response into
//! a typed `DesignResult`.

pub mod normalize;
pub mod types;
pub mod validate;

pub use normalize::{fit_within, normalize, NormalizeError, NormalizeOptions};
pub use types::*;
pub use validate::{validate, ValidationError};
