// src/layer/controller.rs
//! Top-level layer controller
//!
//! Sequences IDLE -> CONV -> POOL -> FINISH, gates the enables of the two
//! sub-controllers and owns the register chain between them. Every unit is
//! sampled before any of them is clocked, so all of them advance in lock-step
//! on the same edge.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, LayerConfig};
use crate::fixed::{FixedFormat, Sample, WeightWord};
use crate::layer::{
    Beat, ClockedUnit, ConvInputs, ConvState, Convolver, LayerError, PipelineRegisters,
    PoolInputs, PoolState, PoolType, Pooler,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerState {
    Idle,
    Conv,
    Pool,
    Finish,
}

/// Boundary inputs sampled on each rising edge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerInputs {
    /// Synchronous, level-sensitive reset
    pub rst: bool,
    pub en: bool,
    pub activation_in: Sample,
    pub pool_type: PoolType,
}

impl LayerInputs {
    pub fn idle(pool_type: PoolType) -> Self {
        Self {
            rst: false,
            en: false,
            activation_in: 0,
            pool_type,
        }
    }

    pub fn reset(pool_type: PoolType) -> Self {
        Self {
            rst: true,
            ..Self::idle(pool_type)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerOutputs {
    pub data_out: Sample,
    pub valid_out: bool,
    /// One-cycle pulse at the end of a pass
    pub done: bool,
}

/// Activity counters since the last reset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    pub cycles: u64,
    pub passes: u64,
    pub conv_results: u64,
    pub pool_results: u64,
    pub mac_operations: u64,
}

/// Snapshot of every state register during one cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleTrace {
    pub cycle: u64,
    pub layer: LayerState,
    pub conv: ConvState,
    pub pool: PoolState,
    pub conv_out: Beat,
    pub pool_in: Beat,
    pub outputs: LayerOutputs,
}

#[derive(Clone, Debug)]
pub struct LayerController {
    config: LayerConfig,
    state: LayerState,
    convolver: Convolver,
    pipeline: PipelineRegisters,
    pooler: Pooler,
    stats: LayerStats,
}

impl LayerController {
    /// Build a layer; structural configuration errors are rejected here
    pub fn new(config: LayerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            convolver: Convolver::new(&config),
            pipeline: PipelineRegisters::new(config.fixed_format()),
            pooler: Pooler::new(&config),
            state: LayerState::Idle,
            stats: LayerStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn format(&self) -> FixedFormat {
        self.config.fixed_format()
    }

    /// Latch the kernel word; weights flow only to the convolver
    pub fn load_weights(&mut self, word: &WeightWord) -> Result<(), LayerError> {
        self.convolver.load_weights(word)
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    pub fn convolver(&self) -> &Convolver {
        &self.convolver
    }

    pub fn pooler(&self) -> &Pooler {
        &self.pooler
    }

    pub fn pipeline(&self) -> &PipelineRegisters {
        &self.pipeline
    }

    pub fn stats(&self) -> &LayerStats {
        &self.stats
    }

    /// True on cycles where `activation_in` is consumed at the next edge
    pub fn accepting_input(&self) -> bool {
        self.convolver.accepting_input()
    }

    /// Raw convolver result register, before quantization
    pub fn conv_output(&self) -> Beat {
        self.convolver.outputs().beat
    }

    pub fn trace(&self) -> CycleTrace {
        CycleTrace {
            cycle: self.stats.cycles,
            layer: self.state,
            conv: self.convolver.state(),
            pool: self.pooler.state(),
            conv_out: self.conv_output(),
            pool_in: self.pipeline.outputs(),
            outputs: self.outputs(),
        }
    }
}

impl ClockedUnit for LayerController {
    type Input = LayerInputs;
    type Output = LayerOutputs;

    fn name(&self) -> &'static str {
        "LAYER"
    }

    fn outputs(&self) -> LayerOutputs {
        let pool = self.pooler.outputs();
        LayerOutputs {
            data_out: pool.beat.data,
            valid_out: pool.beat.valid,
            done: self.state == LayerState::Finish,
        }
    }

    fn clock(&mut self, inputs: &LayerInputs) {
        if inputs.rst {
            self.reset();
            return;
        }
        self.stats.cycles += 1;

        // Sample every registered output before anything moves
        let conv_out = self.convolver.outputs();
        let pool_out = self.pooler.outputs();
        let pool_in = self.pipeline.outputs();

        if conv_out.beat.valid {
            self.stats.conv_results += 1;
        }
        if pool_out.beat.valid {
            self.stats.pool_results += 1;
        }

        let conv_enable = inputs.en && self.state == LayerState::Conv;
        let pool_enable = inputs.en && matches!(self.state, LayerState::Conv | LayerState::Pool);

        let next = match self.state {
            LayerState::Idle if inputs.en => LayerState::Conv,
            LayerState::Conv if conv_out.done => LayerState::Pool,
            LayerState::Pool if pool_out.done => LayerState::Finish,
            LayerState::Finish => LayerState::Idle,
            held => held,
        };

        self.convolver.clock(&ConvInputs {
            enable: conv_enable,
            activation: inputs.activation_in,
        });
        self.pipeline.clock(&conv_out.beat);
        self.pooler.clock(&PoolInputs {
            enable: pool_enable,
            beat: pool_in,
            pool_type: inputs.pool_type,
        });
        self.stats.mac_operations = self.convolver.mac_operations();

        if next != self.state {
            debug!("layer: {:?} -> {:?} at cycle {}", self.state, next, self.stats.cycles);
            if next == LayerState::Finish {
                self.stats.passes += 1;
                info!(
                    "layer pass complete: {} conv results, {} pooled outputs, {} cycles",
                    self.stats.conv_results, self.stats.pool_results, self.stats.cycles
                );
            }
        }
        self.state = next;
    }

    fn reset(&mut self) {
        debug!("layer: synchronous reset from {:?}", self.state);
        self.state = LayerState::Idle;
        self.convolver.reset();
        self.pipeline.reset();
        self.pooler.reset();
        self.stats = LayerStats::default();
    }

    fn state_label(&self) -> &'static str {
        match self.state {
            LayerState::Idle => "IDLE",
            LayerState::Conv => "CONV",
            LayerState::Pool => "POOL",
            LayerState::Finish => "FINISH",
        }
    }
}
