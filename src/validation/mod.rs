// src/validation/mod.rs
//! Golden reference validation for the streaming layer
//!
//! Simulated passes are compared bit-for-bit against a whole-map model of
//! the same arithmetic, for single directed vectors or parallel seed sweeps.

pub mod golden_reference;
pub mod seed_sweep;

pub use golden_reference::{
    check_pass, reference_conv, reference_layer, reference_quantize, reference_relu, GoldenReference, ReferenceData,
    ReferenceError, ValidationResult,
};
pub use seed_sweep::{run_seed_sweep, StimulusRange, SweepSummary};
