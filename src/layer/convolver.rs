// src/layer/convolver.rs
//! Sliding-window convolution engine
//!
//! Consumes the n x n activation map one sample per cycle in row-major order,
//! keeps only (k-1)*n + k samples in a [`LineBuffer`], and emits one
//! `Σ window[i] * weight[i] >> Q` result for every complete window, each
//! valid for exactly one cycle, followed by a `done` state.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::config::LayerConfig;
use crate::fixed::{FixedFormat, Sample, WeightWord};
use crate::layer::{Beat, ClockedUnit, LayerError, LineBuffer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvState {
    Idle,
    /// Shifting samples in, no complete window this cycle
    Load,
    /// A result is on the output register this cycle
    Compute,
    Done,
}

impl ConvState {
    /// Load <-> Compute hops happen every window and are not worth logging
    pub fn is_streaming_hop(self, next: ConvState) -> bool {
        matches!(
            (self, next),
            (ConvState::Load, ConvState::Compute) | (ConvState::Compute, ConvState::Load)
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConvInputs {
    pub enable: bool,
    pub activation: Sample,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConvOutputs {
    pub beat: Beat,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct Convolver {
    format: FixedFormat,
    image_size: usize,
    kernel_size: usize,
    stride: usize,
    mac_lanes: usize,
    /// Kernel, row-major, read-only during a pass
    weights: Vec<Sample>,
    line_buffer: LineBuffer,
    /// Scratch for the combinational window view
    window: Vec<Sample>,
    state: ConvState,
    input_count: usize,
    row_counter: usize,
    col_counter: usize,
    output_count: usize,
    out: Beat,
    mac_operations: u64,
}

impl Convolver {
    pub fn new(config: &LayerConfig) -> Self {
        let g = &config.geometry;
        Self {
            format: config.fixed_format(),
            image_size: g.image_size,
            kernel_size: g.kernel_size,
            stride: g.stride,
            mac_lanes: config.engine.mac_lanes,
            weights: vec![0; config.kernel_taps()],
            line_buffer: LineBuffer::for_window(g.image_size, g.kernel_size),
            window: Vec::with_capacity(config.kernel_taps()),
            state: ConvState::Idle,
            input_count: 0,
            row_counter: 0,
            col_counter: 0,
            output_count: 0,
            out: Beat::IDLE,
            mac_operations: 0,
        }
    }

    /// Latch the kernel word; expected to happen before streaming begins
    pub fn load_weights(&mut self, word: &WeightWord) -> Result<(), LayerError> {
        if word.format() != self.format {
            return Err(LayerError::FormatMismatch {
                expected: self.format,
                actual: word.format(),
            });
        }
        if word.count() != self.weights.len() {
            return Err(LayerError::WeightCount {
                expected: self.weights.len(),
                actual: word.count(),
            });
        }
        self.weights = word.unpack();
        Ok(())
    }

    pub fn weights(&self) -> &[Sample] {
        &self.weights
    }

    pub fn state(&self) -> ConvState {
        self.state
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn row_counter(&self) -> usize {
        self.row_counter
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    pub fn mac_operations(&self) -> u64 {
        self.mac_operations
    }

    pub fn buffered_samples(&self) -> usize {
        self.line_buffer.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.line_buffer.capacity()
    }

    /// True on cycles where `activation` is sampled at the next edge
    pub fn accepting_input(&self) -> bool {
        matches!(self.state, ConvState::Load | ConvState::Compute)
            && self.input_count < self.total_inputs()
    }

    pub fn total_inputs(&self) -> usize {
        self.image_size * self.image_size
    }

    pub fn total_outputs(&self) -> usize {
        let side = (self.image_size - self.kernel_size) / self.stride + 1;
        side * side
    }

    fn start_pass(&mut self) {
        self.line_buffer.clear();
        self.input_count = 0;
        self.row_counter = 0;
        self.col_counter = 0;
        self.output_count = 0;
        self.out = Beat::IDLE;
    }

    /// Whether the sample at (row, col) is the bottom-right corner of an output window
    fn completes_window(&self, row: usize, col: usize) -> bool {
        let edge = self.kernel_size - 1;
        row >= edge
            && col >= edge
            && (row - edge) % self.stride == 0
            && (col - edge) % self.stride == 0
    }

    fn compute_window(&mut self) -> Sample {
        self.line_buffer
            .window_into(self.kernel_size, self.image_size, &mut self.window);
        self.mac_operations += self.window.len() as u64;
        self.format.mac(&self.window, &self.weights, self.mac_lanes)
    }

    fn shift_in(&mut self, activation: Sample) {
        let (row, col) = (self.row_counter, self.col_counter);

        self.line_buffer.push(activation);
        self.input_count += 1;
        self.col_counter += 1;
        if self.col_counter == self.image_size {
            self.col_counter = 0;
            self.row_counter += 1;
        }

        if self.completes_window(row, col) {
            let value = self.compute_window();
            trace!("conv: window at ({}, {}) -> {}", row, col, value);
            self.out = Beat::valid(value);
            self.output_count += 1;
            self.state = ConvState::Compute;
        } else {
            self.out = Beat::IDLE;
            self.state = ConvState::Load;
        }
    }
}

impl ClockedUnit for Convolver {
    type Input = ConvInputs;
    type Output = ConvOutputs;

    fn name(&self) -> &'static str {
        "CONV"
    }

    fn outputs(&self) -> ConvOutputs {
        ConvOutputs {
            beat: self.out,
            done: self.state == ConvState::Done,
        }
    }

    fn clock(&mut self, input: &ConvInputs) {
        let previous = self.state;

        match self.state {
            ConvState::Idle => {
                self.out = Beat::IDLE;
                if input.enable {
                    self.start_pass();
                    self.state = ConvState::Load;
                }
            }
            ConvState::Load | ConvState::Compute => {
                if !input.enable {
                    // Parked: no timeout exists, the pass resumes when enable returns
                    self.out = Beat::IDLE;
                } else if self.input_count == self.total_inputs() {
                    self.out = Beat::IDLE;
                    self.state = ConvState::Done;
                } else {
                    self.shift_in(input.activation);
                }
            }
            ConvState::Done => {
                self.out = Beat::IDLE;
                if !input.enable {
                    self.state = ConvState::Idle;
                }
            }
        }

        if previous != self.state && !previous.is_streaming_hop(self.state) {
            debug!(
                "conv: {:?} -> {:?} ({} inputs, {} outputs)",
                previous, self.state, self.input_count, self.output_count
            );
        }
    }

    fn reset(&mut self) {
        self.start_pass();
        self.state = ConvState::Idle;
        self.mac_operations = 0;
    }

    fn state_label(&self) -> &'static str {
        match self.state {
            ConvState::Idle => "IDLE",
            ConvState::Load => "LOAD",
            ConvState::Compute => "COMPUTE",
            ConvState::Done => "DONE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> LayerConfig {
        let mut config = LayerConfig::with_format(16, 0);
        config.geometry.image_size = 4;
        config.geometry.kernel_size = 3;
        config.geometry.pool_size = 1;
        config.engine.mac_lanes = 3;
        config
    }

    fn enabled(activation: Sample) -> ConvInputs {
        ConvInputs { enable: true, activation }
    }

    #[test]
    fn test_streaming_hops() {
        assert!(ConvState::Load.is_streaming_hop(ConvState::Compute));
        assert!(ConvState::Compute.is_streaming_hop(ConvState::Load));
        assert!(!ConvState::Load.is_streaming_hop(ConvState::Done));
        assert!(!ConvState::Idle.is_streaming_hop(ConvState::Load));
    }

    /// Clock a full pass and collect every valid result
    fn stream(conv: &mut Convolver, image: &[Sample]) -> Vec<Sample> {
        let mut results = Vec::new();
        conv.clock(&enabled(0));
        assert_eq!(conv.state(), ConvState::Load);

        let mut next = 0;
        for _ in 0..(image.len() * 2) {
            let sample = if conv.accepting_input() {
                next += 1;
                image[next - 1]
            } else {
                0
            };
            conv.clock(&enabled(sample));
            let out = conv.outputs();
            if out.beat.valid {
                results.push(out.beat.data);
            }
            if out.done {
                break;
            }
        }
        results
    }

    #[test]
    fn test_convolver_creation() {
        let conv = Convolver::new(&small_config());
        assert_eq!(conv.name(), "CONV");
        assert_eq!(conv.state(), ConvState::Idle);
        assert_eq!(conv.buffer_capacity(), 2 * 4 + 3);
        assert_eq!(conv.total_outputs(), 4);
        assert!(!conv.accepting_input());
    }

    #[test]
    fn test_identity_kernel_picks_center() {
        let config = small_config();
        let fmt = config.fixed_format();
        let mut conv = Convolver::new(&config);

        let mut kernel = vec![0; 9];
        kernel[4] = 1;
        conv.load_weights(&WeightWord::pack(&kernel, fmt)).unwrap();

        let image: Vec<Sample> = (0..16).collect();
        let results = stream(&mut conv, &image);

        // Centers of the four 3x3 windows of a 4x4 map: (1,1) (1,2) (2,1) (2,2)
        assert_eq!(results, vec![5, 6, 9, 10]);
        assert_eq!(conv.output_count(), 4);
        assert_eq!(conv.mac_operations(), 36);
    }

    #[test]
    fn test_box_kernel_sums_window() {
        let config = small_config();
        let mut conv = Convolver::new(&config);
        conv.load_weights(&WeightWord::pack(&[1; 9], config.fixed_format())).unwrap();

        let image: Vec<Sample> = (0..16).collect();
        let results = stream(&mut conv, &image);

        // Window at (0,0): 0+1+2+4+5+6+8+9+10 = 45, each step right adds 3, down adds 12
        assert_eq!(results, vec![45, 54, 81, 90]);
    }

    #[test]
    fn test_q_shift_is_arithmetic() {
        let mut config = small_config();
        config.format.frac = 4;
        let fmt = config.fixed_format();
        let mut conv = Convolver::new(&config);

        // Single tap of -1.0 at the top-left corner
        let mut kernel = vec![0; 9];
        kernel[0] = -16;
        conv.load_weights(&WeightWord::pack(&kernel, fmt)).unwrap();

        let image = vec![1; 16];
        let results = stream(&mut conv, &image);

        // 1 * -16 >> 4 = -1 (floor), never 0
        assert_eq!(results, vec![-1; 4]);
    }

    #[test]
    fn test_stride_two() {
        let mut config = small_config();
        config.geometry.image_size = 5;
        config.geometry.stride = 2;
        let mut conv = Convolver::new(&config);

        let mut kernel = vec![0; 9];
        kernel[0] = 1;
        conv.load_weights(&WeightWord::pack(&kernel, config.fixed_format())).unwrap();

        let image: Vec<Sample> = (0..25).collect();
        let results = stream(&mut conv, &image);

        // Top-left corners at rows/cols 0 and 2
        assert_eq!(results, vec![0, 2, 10, 12]);
        assert_eq!(conv.total_outputs(), 4);
    }

    #[test]
    fn test_valid_is_single_cycle_pulse() {
        let config = small_config();
        let mut conv = Convolver::new(&config);
        conv.load_weights(&WeightWord::pack(&[1; 9], config.fixed_format())).unwrap();

        conv.clock(&enabled(0));
        let mut valid_cycles = Vec::new();
        for cycle in 0..20 {
            conv.clock(&enabled(1));
            if conv.outputs().beat.valid {
                valid_cycles.push(cycle);
            }
        }
        // Windows complete on inputs 10, 11, 14, 15 (0-based)
        assert_eq!(valid_cycles, vec![10, 11, 14, 15]);
    }

    #[test]
    fn test_done_then_idle_on_disable() {
        let config = small_config();
        let mut conv = Convolver::new(&config);
        let image = vec![0; 16];
        stream(&mut conv, &image);

        assert_eq!(conv.state(), ConvState::Done);
        assert!(conv.outputs().done);

        // Held while enabled
        conv.clock(&enabled(0));
        assert_eq!(conv.state(), ConvState::Done);

        conv.clock(&ConvInputs::default());
        assert_eq!(conv.state(), ConvState::Idle);
        assert!(!conv.outputs().done);
    }

    #[test]
    fn test_disable_parks_the_stream() {
        let config = small_config();
        let mut conv = Convolver::new(&config);
        conv.clock(&enabled(0));
        for _ in 0..5 {
            conv.clock(&enabled(3));
        }
        assert_eq!(conv.input_count(), 5);
        assert_eq!(conv.row_counter(), 1);

        for _ in 0..10 {
            conv.clock(&ConvInputs::default());
        }
        assert_eq!(conv.input_count(), 5);
        assert_eq!(conv.state(), ConvState::Load);
        assert!(!conv.outputs().beat.valid);
    }

    #[test]
    fn test_reset_clears_counters() {
        let config = small_config();
        let mut conv = Convolver::new(&config);
        conv.load_weights(&WeightWord::pack(&[1; 9], config.fixed_format())).unwrap();
        conv.clock(&enabled(0));
        for _ in 0..11 {
            conv.clock(&enabled(2));
        }
        assert_eq!(conv.state(), ConvState::Compute);

        conv.reset();
        assert_eq!(conv.state(), ConvState::Idle);
        assert_eq!(conv.input_count(), 0);
        assert_eq!(conv.row_counter(), 0);
        assert_eq!(conv.output_count(), 0);
        assert_eq!(conv.buffered_samples(), 0);
        assert_eq!(conv.outputs(), ConvOutputs::default());
        // Kernel survives reset
        assert_eq!(conv.weights(), &[1; 9]);
    }

    #[test]
    fn test_weight_word_checks() {
        let config = small_config();
        let mut conv = Convolver::new(&config);

        let short = WeightWord::pack(&[1; 4], config.fixed_format());
        assert_eq!(
            conv.load_weights(&short),
            Err(LayerError::WeightCount { expected: 9, actual: 4 })
        );

        let other = WeightWord::pack(&[1; 9], FixedFormat::new(8, 0));
        assert!(matches!(
            conv.load_weights(&other),
            Err(LayerError::FormatMismatch { .. })
        ));
    }
}
