// src/layer/mod.rs
//! Cycle-accurate model of one streaming CNN layer
//!
//! Convolver -> Quantizer -> ReLU -> Pooler, each hop separated by one
//! pipeline register and sequenced by the top-level [`LayerController`].

pub mod clocked_unit;
pub mod line_buffer;
pub mod convolver;
pub mod pipeline;
pub mod pooler;
pub mod controller;

// Re-export core types for easy access
pub use clocked_unit::{ClockedUnit, Beat, LayerError};
pub use line_buffer::LineBuffer;

// Re-export the stages
pub use convolver::{Convolver, ConvState, ConvInputs, ConvOutputs};
pub use pipeline::PipelineRegisters;
pub use pooler::{Pooler, PoolState, PoolType, PoolInputs, PoolOutputs, UnknownPoolType};

// Re-export the top level
pub use controller::{
    LayerController, LayerState, LayerInputs, LayerOutputs, LayerStats, CycleTrace,
};
