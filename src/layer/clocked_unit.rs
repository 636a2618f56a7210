// src/layer/clocked_unit.rs
//! Core clocked-unit trait and supporting types for the layer pipeline

use serde::{Deserialize, Serialize};

use crate::fixed::{FixedFormat, Sample};

/// A data word paired with its one-cycle valid flag
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beat {
    pub data: Sample,
    pub valid: bool,
}

impl Beat {
    /// Cleared register: zero data, valid low
    pub const IDLE: Beat = Beat { data: 0, valid: false };

    pub fn valid(data: Sample) -> Self {
        Self { data, valid: true }
    }

    /// Same valid flag, data passed through a combinational function
    pub fn map(self, f: impl FnOnce(Sample) -> Sample) -> Self {
        Self {
            data: f(self.data),
            valid: self.valid,
        }
    }
}

/// Core trait that every synchronous unit of the layer implements.
///
/// All units share one clock. A parent reads every child's `outputs()`
/// before calling `clock()` on any of them, so each unit only ever sees
/// values registered on the previous edge.
pub trait ClockedUnit {
    type Input;
    type Output;

    /// Get the name of this unit
    fn name(&self) -> &'static str;

    /// Outputs visible during the current cycle (Moore: depend on state only)
    fn outputs(&self) -> Self::Output;

    /// Advance by one rising clock edge
    fn clock(&mut self, input: &Self::Input);

    /// Synchronous reset: clear every counter, buffer and register
    fn reset(&mut self);

    /// Label of the current controller state, for traces
    fn state_label(&self) -> &'static str;
}

/// Errors raised while preparing a pass; the datapath itself never fails
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayerError {
    #[error("expected {expected} kernel weights, got {actual}")]
    WeightCount { expected: usize, actual: usize },

    #[error("weight word is encoded as {actual}, layer samples are {expected}")]
    FormatMismatch {
        expected: FixedFormat,
        actual: FixedFormat,
    },
}
