// src/layer/pipeline.rs
//! Pipeline register chain between the convolver and the pooler
//!
//! Three (data, valid) registers shift once per edge with no stall input:
//! slot 0 feeds the quantizer, slot 1 feeds ReLU, slot 2 feeds the pooler.
//! Quantize and ReLU are combinational, applied on the hop into the next slot.

use crate::fixed::FixedFormat;
use crate::layer::{Beat, ClockedUnit};

/// Conv -> Quant, Quant -> ReLU, ReLU -> Pool
pub const PIPELINE_DEPTH: usize = 3;

#[derive(Clone, Debug)]
pub struct PipelineRegisters {
    format: FixedFormat,
    slots: [Beat; PIPELINE_DEPTH],
}

impl PipelineRegisters {
    pub fn new(format: FixedFormat) -> Self {
        Self {
            format,
            slots: [Beat::IDLE; PIPELINE_DEPTH],
        }
    }

    /// Register contents, index 0 closest to the convolver
    pub fn slot(&self, index: usize) -> Beat {
        self.slots[index]
    }

    /// Valid beats currently in flight
    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|b| b.valid).count()
    }
}

impl ClockedUnit for PipelineRegisters {
    type Input = Beat;
    type Output = Beat;

    fn name(&self) -> &'static str {
        "PIPE"
    }

    fn outputs(&self) -> Beat {
        self.slots[PIPELINE_DEPTH - 1]
    }

    fn clock(&mut self, input: &Beat) {
        let format = self.format;
        self.slots = [
            *input,
            self.slots[0].map(|x| format.quantize(x)),
            self.slots[1].map(|x| format.relu(x)),
        ];
    }

    fn reset(&mut self) {
        self.slots = [Beat::IDLE; PIPELINE_DEPTH];
    }

    fn state_label(&self) -> &'static str {
        if self.occupancy() > 0 {
            "BUSY"
        } else {
            "EMPTY"
        }
    }
}
