// src/stimulus/mod.rs
//! Deterministic driver for the layer
//!
//! Generates seeded activation maps and kernels, then plays the role of the
//! external host: reset, enable handshake, one activation per accepting cycle,
//! and observation of `data_out` / `valid_out` / `done`.

use log::{debug, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, LayerConfig};
use crate::fixed::{Sample, WeightWord};
use crate::layer::{ClockedUnit, CycleTrace, LayerController, LayerError, LayerInputs, LayerState, LayerStats, PoolType};

/// Cycles the testbench keeps clocking after `done` to catch stray pulses
const DRAIN_CYCLES: u64 = 4;

/// One pass worth of input data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stimulus {
    pub seed: Option<u64>,
    /// n*n samples, row-major
    pub activations: Vec<Sample>,
    /// k*k samples, row-major
    pub weights: Vec<Sample>,
}

impl Stimulus {
    /// Values uniformly drawn from [-2.0, 2.0] in the layer's Q-format
    pub fn random(config: &LayerConfig, seed: u64) -> Self {
        let fmt = config.fixed_format();
        let magnitude = (2i64 << fmt.frac()).min(fmt.max_value() as i64) as Sample;
        Self::random_bounded(config, seed, magnitude)
    }

    /// Values uniformly drawn over the whole N-bit range
    pub fn random_full_range(config: &LayerConfig, seed: u64) -> Self {
        let fmt = config.fixed_format();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut draw = |count: usize| -> Vec<Sample> {
            (0..count)
                .map(|_| rng.gen_range(fmt.min_value()..=fmt.max_value()))
                .collect()
        };
        let activations = draw(config.input_samples());
        let weights = draw(config.kernel_taps());
        Self {
            seed: Some(seed),
            activations,
            weights,
        }
    }

    /// Values uniformly drawn from [-magnitude, magnitude]
    pub fn random_bounded(config: &LayerConfig, seed: u64, magnitude: Sample) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let magnitude = magnitude.abs();
        let mut draw = |count: usize| -> Vec<Sample> {
            (0..count).map(|_| rng.gen_range(-magnitude..=magnitude)).collect()
        };
        let activations = draw(config.input_samples());
        let weights = draw(config.kernel_taps());
        Self {
            seed: Some(seed),
            activations,
            weights,
        }
    }

    /// Every activation and every weight set to one value each
    pub fn constant(config: &LayerConfig, activation: Sample, weight: Sample) -> Self {
        Self {
            seed: None,
            activations: vec![activation; config.input_samples()],
            weights: vec![weight; config.kernel_taps()],
        }
    }

    pub fn weight_word(&self, config: &LayerConfig) -> WeightWord {
        WeightWord::pack(&self.weights, config.fixed_format())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("layer: {0}")]
    Layer(#[from] LayerError),

    #[error("expected {expected} activations, got {actual}")]
    ActivationCount { expected: usize, actual: usize },

    #[error("no done pulse within {cycles} cycles")]
    Timeout { cycles: u64 },
}

/// Everything observed at the layer boundary during one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub pool_type: PoolType,
    /// data_out on every valid_out cycle, in order
    pub outputs: Vec<Sample>,
    /// Raw convolver results, in order
    pub conv_outputs: Vec<Sample>,
    /// Cycles from the first enabled edge to the done pulse
    pub cycles: u64,
    pub done_pulses: usize,
    pub first_output_cycle: Option<u64>,
    /// Pass duration at the configured clock period
    pub elapsed_ns: f64,
    pub stats: LayerStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<CycleTrace>,
}

/// What the boundary showed after a reset was forced in the middle of a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortReport {
    /// Cycle at which rst was asserted
    pub reset_cycle: u64,
    /// Layer state right before the reset edge
    pub interrupted_state: LayerState,
    /// valid_out pulses observed after the reset
    pub stray_valid: usize,
    /// done pulses observed after the reset
    pub stray_done: usize,
    /// Every convolver and pooler counter read back zero after the reset
    pub counters_cleared: bool,
    pub final_state: LayerState,
}

/// Cycle-by-cycle host model around one [`LayerController`]
pub struct Testbench {
    layer: LayerController,
    cycle_budget: u64,
    capture_trace: bool,
}

impl Testbench {
    pub fn new(config: LayerConfig) -> Result<Self, SimError> {
        let cycle_budget = default_budget(&config);
        Ok(Self {
            layer: LayerController::new(config)?,
            cycle_budget,
            capture_trace: false,
        })
    }

    /// Upper bound on clock cycles for a single pass
    pub fn with_cycle_budget(mut self, cycles: u64) -> Self {
        self.cycle_budget = cycles;
        self
    }

    /// Record a [`CycleTrace`] for every cycle of the pass
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.capture_trace = enabled;
        self
    }

    pub fn layer(&self) -> &LayerController {
        &self.layer
    }

    fn prepare(&mut self, stimulus: &Stimulus) -> Result<(), SimError> {
        let expected = self.layer.config().input_samples();
        if stimulus.activations.len() != expected {
            return Err(SimError::ActivationCount {
                expected,
                actual: stimulus.activations.len(),
            });
        }
        let word = stimulus.weight_word(self.layer.config());
        self.layer.load_weights(&word)?;

        // One reset cycle before the handshake
        self.layer.clock(&LayerInputs::reset(PoolType::Max));
        Ok(())
    }

    /// Drive a full pass and collect everything seen at the boundary
    pub fn run(&mut self, stimulus: &Stimulus, pool_type: PoolType) -> Result<PassReport, SimError> {
        self.prepare(stimulus)?;

        let mut outputs = Vec::new();
        let mut conv_outputs = Vec::new();
        let mut trace_log = Vec::new();
        let mut first_output_cycle = None;
        let mut done_cycle = None;
        let mut done_pulses = 0;
        let mut next_input = 0;
        let mut cycle = 0u64;

        loop {
            if self.capture_trace {
                trace_log.push(self.layer.trace());
            }

            let out = self.layer.outputs();
            if out.valid_out {
                first_output_cycle.get_or_insert(cycle);
                trace!("cycle {}: data_out = {}", cycle, out.data_out);
                outputs.push(out.data_out);
            }
            if out.done {
                done_pulses += 1;
                done_cycle.get_or_insert(cycle);
            }
            let conv = self.layer.conv_output();
            if conv.valid {
                conv_outputs.push(conv.data);
            }

            if let Some(done_at) = done_cycle {
                if cycle >= done_at + DRAIN_CYCLES {
                    break;
                }
            }
            if cycle >= self.cycle_budget {
                warn!("pass exceeded {} cycles without done", self.cycle_budget);
                return Err(SimError::Timeout { cycles: self.cycle_budget });
            }

            // Present the next activation only on cycles the convolver samples it
            let activation_in = if self.layer.accepting_input() {
                next_input += 1;
                stimulus.activations[next_input - 1]
            } else {
                0
            };

            self.layer.clock(&LayerInputs {
                rst: false,
                en: done_cycle.is_none(),
                activation_in,
                pool_type,
            });
            cycle += 1;
        }

        let cycles = done_cycle.unwrap_or(cycle);
        debug!(
            "pass finished: {} outputs, done at cycle {}, {} inputs streamed",
            outputs.len(),
            cycles,
            next_input
        );

        Ok(PassReport {
            pool_type,
            outputs,
            conv_outputs,
            cycles,
            done_pulses,
            first_output_cycle,
            elapsed_ns: cycles as f64 * self.layer.config().clock.period_ns,
            stats: self.layer.stats().clone(),
            trace: trace_log,
        })
    }

    /// Start a pass, assert rst at `reset_cycle`, then hold enable low for `idle_cycles`
    pub fn run_with_reset(
        &mut self,
        stimulus: &Stimulus,
        pool_type: PoolType,
        reset_cycle: u64,
        idle_cycles: u64,
    ) -> Result<AbortReport, SimError> {
        self.prepare(stimulus)?;

        let mut next_input = 0;
        let mut done_seen = false;
        for _ in 0..reset_cycle {
            done_seen |= self.layer.outputs().done;
            // Once done has fired the host drops en, so no second pass starts
            let activation_in = if !done_seen && self.layer.accepting_input() {
                next_input += 1;
                stimulus.activations[next_input - 1]
            } else {
                0
            };
            self.layer.clock(&LayerInputs {
                rst: false,
                en: !done_seen,
                activation_in,
                pool_type,
            });
        }
        let interrupted_state = self.layer.state();

        debug!("forcing reset at cycle {} in {:?}", reset_cycle, interrupted_state);
        self.layer.clock(&LayerInputs::reset(pool_type));

        let conv = self.layer.convolver();
        let pool = self.layer.pooler();
        let counters_cleared = conv.input_count() == 0
            && conv.row_counter() == 0
            && conv.output_count() == 0
            && conv.buffered_samples() == 0
            && pool.blocks_done() == 0
            && pool.filled() == 0
            && self.layer.pipeline().occupancy() == 0;

        let mut stray_valid = 0;
        let mut stray_done = 0;
        for _ in 0..idle_cycles {
            let out = self.layer.outputs();
            stray_valid += out.valid_out as usize;
            stray_done += out.done as usize;
            self.layer.clock(&LayerInputs::idle(pool_type));
        }

        Ok(AbortReport {
            reset_cycle,
            interrupted_state,
            stray_valid,
            stray_done,
            counters_cleared,
            final_state: self.layer.state(),
        })
    }
}

fn default_budget(config: &LayerConfig) -> u64 {
    // Streaming takes n*n cycles; the controller and pipeline add a small constant
    4 * config.input_samples() as u64 + 64
}
