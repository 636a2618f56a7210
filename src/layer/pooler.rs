// src/layer/pooler.rs
//! Windowed reduction over p x p blocks of the post-activation map
//!
//! Implements max, average, min and a pass-through fallback. Blocks are
//! either every p*p consecutive valid samples (`PoolOrder::Chunked`) or the
//! true p x p tiles of the row-major map (`PoolOrder::Spatial`).

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{LayerConfig, PoolOrder};
use crate::fixed::{FixedFormat, Sample};
use crate::layer::{Beat, ClockedUnit, LineBuffer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolState {
    Idle,
    /// Collecting samples of the current block
    Load,
    /// The reduced block is on the output this cycle
    Compute,
    Done,
}

impl PoolState {
    /// Load <-> Compute hops happen every block and are not worth logging
    pub fn is_streaming_hop(self, next: PoolState) -> bool {
        matches!(
            (self, next),
            (PoolState::Load, PoolState::Compute) | (PoolState::Compute, PoolState::Load)
        )
    }
}

/// Reduction selected by the 2-bit `pool_type` input
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolType {
    Max,     // 00
    Average, // 01
    Min,     // 10
    /// Code 11: not a pooling mode, forwards the first buffered sample
    PassThrough,
}

impl PoolType {
    /// Decode the low two bits of `code`
    pub fn from_code(code: u8) -> Self {
        match code & 0b11 {
            0b00 => PoolType::Max,
            0b01 => PoolType::Average,
            0b10 => PoolType::Min,
            _ => PoolType::PassThrough,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            PoolType::Max => 0b00,
            PoolType::Average => 0b01,
            PoolType::Min => 0b10,
            PoolType::PassThrough => 0b11,
        }
    }

    /// Reduce one full block
    pub fn reduce(&self, format: FixedFormat, block: &[Sample]) -> Sample {
        let first = block.first().copied().unwrap_or(0);
        match self {
            PoolType::Max => block
                .iter()
                .skip(1)
                .fold(first, |best, &x| if x > best { x } else { best }),
            PoolType::Min => block
                .iter()
                .skip(1)
                .fold(first, |best, &x| if x < best { x } else { best }),
            PoolType::Average => {
                let sum = block
                    .iter()
                    .fold(0i64, |acc, &x| format.wrap_accumulator(acc + x as i64));
                // Truncating division, no rounding
                format.wrap(sum / block.len().max(1) as i64)
            }
            PoolType::PassThrough => first,
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolType::Max => "max",
            PoolType::Average => "avg",
            PoolType::Min => "min",
            PoolType::PassThrough => "pass",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown pool type '{0}': use max, avg, min or pass")]
pub struct UnknownPoolType(pub String);

impl FromStr for PoolType {
    type Err = UnknownPoolType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" | "00" => Ok(PoolType::Max),
            "avg" | "average" | "01" => Ok(PoolType::Average),
            "min" | "10" => Ok(PoolType::Min),
            "pass" | "passthrough" | "11" => Ok(PoolType::PassThrough),
            other => Err(UnknownPoolType(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolInputs {
    pub enable: bool,
    pub beat: Beat,
    pub pool_type: PoolType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolOutputs {
    pub beat: Beat,
    pub done: bool,
}

#[derive(Clone, Debug)]
pub struct Pooler {
    format: FixedFormat,
    order: PoolOrder,
    pool_size: usize,
    /// Side of the incoming feature map
    map_side: usize,
    /// p*p window buffer
    block: Vec<Sample>,
    filled: usize,
    /// Row history for spatial grouping
    rows: LineBuffer,
    arrivals: usize,
    /// Latched at the start of a pass
    mode: PoolType,
    state: PoolState,
    blocks_done: usize,
    total_blocks: usize,
}

impl Pooler {
    pub fn new(config: &LayerConfig) -> Self {
        let p = config.geometry.pool_size;
        let m = config.output_side();
        Self {
            format: config.fixed_format(),
            order: config.engine.pool_order,
            pool_size: p,
            map_side: m,
            block: vec![0; p * p],
            filled: 0,
            rows: LineBuffer::for_window(m, p),
            arrivals: 0,
            mode: PoolType::Max,
            state: PoolState::Idle,
            blocks_done: 0,
            total_blocks: config.expected_outputs(),
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn blocks_done(&self) -> usize {
        self.blocks_done
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Samples held for the block being collected
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn mode(&self) -> PoolType {
        self.mode
    }

    fn window_slots(&self) -> usize {
        self.block.len()
    }

    fn block_ready(&self) -> bool {
        self.filled == self.window_slots()
    }

    fn start_pass(&mut self, mode: PoolType) {
        self.mode = mode;
        self.filled = 0;
        self.arrivals = 0;
        self.blocks_done = 0;
        self.rows.clear();
        self.block.iter_mut().for_each(|s| *s = 0);
    }

    fn accept(&mut self, sample: Sample) {
        match self.order {
            PoolOrder::Chunked => {
                self.block[self.filled] = sample;
                self.filled += 1;
            }
            PoolOrder::Spatial => {
                let (row, col) = (self.arrivals / self.map_side, self.arrivals % self.map_side);
                self.rows.push(sample);
                let p = self.pool_size;
                if row % p == p - 1 && col % p == p - 1 {
                    // Bottom-right corner of a tile: gather the whole block
                    for i in 0..p {
                        for j in 0..p {
                            let age = (p - 1 - i) * self.map_side + (p - 1 - j);
                            self.block[i * p + j] = self.rows.at_age(age);
                        }
                    }
                    self.filled = self.window_slots();
                }
            }
        }
        self.arrivals += 1;
    }
}

impl ClockedUnit for Pooler {
    type Input = PoolInputs;
    type Output = PoolOutputs;

    fn name(&self) -> &'static str {
        "POOL"
    }

    fn outputs(&self) -> PoolOutputs {
        let beat = if self.state == PoolState::Compute {
            Beat::valid(self.mode.reduce(self.format, &self.block))
        } else {
            Beat::IDLE
        };
        PoolOutputs {
            beat,
            done: self.state == PoolState::Done,
        }
    }

    fn clock(&mut self, input: &PoolInputs) {
        let previous = self.state;

        match self.state {
            PoolState::Idle => {
                if input.enable {
                    self.start_pass(input.pool_type);
                    self.state = PoolState::Load;
                }
            }
            PoolState::Load => {
                if input.enable {
                    if input.beat.valid {
                        self.accept(input.beat.data);
                    }
                    if self.block_ready() {
                        self.state = PoolState::Compute;
                    }
                }
            }
            PoolState::Compute => {
                if input.enable {
                    trace!(
                        "pool: block {} -> {}",
                        self.blocks_done,
                        self.mode.reduce(self.format, &self.block)
                    );
                    self.blocks_done += 1;
                    self.filled = 0;
                    // Back-to-back data: the beat arriving now opens the next block
                    if input.beat.valid {
                        self.accept(input.beat.data);
                    }
                    self.state = if self.blocks_done == self.total_blocks {
                        PoolState::Done
                    } else if self.block_ready() {
                        PoolState::Compute
                    } else {
                        PoolState::Load
                    };
                }
            }
            PoolState::Done => {
                if !input.enable {
                    self.state = PoolState::Idle;
                }
            }
        }

        if previous != self.state && !previous.is_streaming_hop(self.state) {
            debug!("pool: {:?} -> {:?} ({} blocks)", previous, self.state, self.blocks_done);
        }
    }

    fn reset(&mut self) {
        self.start_pass(PoolType::Max);
        self.state = PoolState::Idle;
    }

    fn state_label(&self) -> &'static str {
        match self.state {
            PoolState::Idle => "IDLE",
            PoolState::Load => "LOAD",
            PoolState::Compute => "COMPUTE",
            PoolState::Done => "DONE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config(order: PoolOrder) -> LayerConfig {
        // m = 4, p = 2 -> four blocks
        let mut config = LayerConfig::with_format(8, 0);
        config.engine.pool_order = order;
        config
    }

    fn enabled(beat: Beat, pool_type: PoolType) -> PoolInputs {
        PoolInputs { enable: true, beat, pool_type }
    }

    /// Feed `samples` as valid beats separated by `gap` idle cycles
    fn run(
        pooler: &mut Pooler,
        samples: &[Sample],
        gap: usize,
        pool_type: PoolType,
    ) -> Vec<Sample> {
        let mut results = Vec::new();
        pooler.clock(&enabled(Beat::IDLE, pool_type));

        let mut beats = Vec::new();
        for &s in samples {
            beats.push(Beat::valid(s));
            beats.extend(std::iter::repeat(Beat::IDLE).take(gap));
        }
        beats.extend(std::iter::repeat(Beat::IDLE).take(4));

        for beat in beats {
            pooler.clock(&enabled(beat, pool_type));
            let out = pooler.outputs();
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
    fn test_pool_type_codes() {
        assert_eq!(PoolType::from_code(0b00), PoolType::Max);
        assert_eq!(PoolType::from_code(0b01), PoolType::Average);
        assert_eq!(PoolType::from_code(0b10), PoolType::Min);
        assert_eq!(PoolType::from_code(0b11), PoolType::PassThrough);
        // Only two bits are wired
        assert_eq!(PoolType::from_code(0b101), PoolType::Average);
        for code in 0..4 {
            assert_eq!(PoolType::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_pool_type_parse() {
        assert_eq!("max".parse::<PoolType>(), Ok(PoolType::Max));
        assert_eq!("AVG".parse::<PoolType>(), Ok(PoolType::Average));
        assert_eq!("10".parse::<PoolType>(), Ok(PoolType::Min));
        assert_eq!("pass".parse::<PoolType>(), Ok(PoolType::PassThrough));
        assert_eq!(
            "median".parse::<PoolType>(),
            Err(UnknownPoolType("median".to_string()))
        );
    }

    #[test]
    fn test_streaming_hops() {
        assert!(PoolState::Load.is_streaming_hop(PoolState::Compute));
        assert!(PoolState::Compute.is_streaming_hop(PoolState::Load));
        assert!(!PoolState::Compute.is_streaming_hop(PoolState::Done));
        assert!(!PoolState::Idle.is_streaming_hop(PoolState::Load));
        assert_eq!(PoolType::Average.to_string(), "avg");
    }

    #[test]
    fn test_reductions() {
        let fmt = FixedFormat::new(8, 0);
        let block = [3, -7, 12, 5];
        assert_eq!(PoolType::Max.reduce(fmt, &block), 12);
        assert_eq!(PoolType::Min.reduce(fmt, &block), -7);
        // 13 / 4 truncates to 3
        assert_eq!(PoolType::Average.reduce(fmt, &block), 3);
        assert_eq!(PoolType::PassThrough.reduce(fmt, &block), 3);
        // Truncation is toward zero for negative sums
        assert_eq!(PoolType::Average.reduce(fmt, &[-1, -1, -1, 0]), 0);
    }

    #[test]
    fn test_average_does_not_wrap_in_range() {
        let fmt = FixedFormat::new(8, 0);
        assert_eq!(PoolType::Average.reduce(fmt, &[127, 127, 127, 127]), 127);
        assert_eq!(PoolType::Average.reduce(fmt, &[-128, -128, -128, -128]), -128);
    }

    #[test]
    fn test_membership_and_bounds() {
        let fmt = FixedFormat::new(12, 3);
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..500 {
            let block: Vec<Sample> = (0..9).map(|_| rng.gen_range(-2048..2048)).collect();
            let max = PoolType::Max.reduce(fmt, &block);
            let min = PoolType::Min.reduce(fmt, &block);
            let avg = PoolType::Average.reduce(fmt, &block);
            assert!(block.contains(&max));
            assert!(block.contains(&min));
            assert!(min <= avg && avg <= max);
        }
    }

    #[test]
    fn test_chunked_blocks() {
        let mut pooler = Pooler::new(&config(PoolOrder::Chunked));
        let samples: Vec<Sample> = (1..=16).collect();

        let results = run(&mut pooler, &samples, 1, PoolType::Max);
        assert_eq!(results, vec![4, 8, 12, 16]);
        assert_eq!(pooler.state(), PoolState::Done);
        assert_eq!(pooler.blocks_done(), 4);
    }

    #[test]
    fn test_back_to_back_input_is_not_dropped() {
        let mut pooler = Pooler::new(&config(PoolOrder::Chunked));
        let samples: Vec<Sample> = (1..=16).collect();

        let results = run(&mut pooler, &samples, 0, PoolType::Min);
        assert_eq!(results, vec![1, 5, 9, 13]);
    }

    #[test]
    fn test_spatial_blocks() {
        let mut pooler = Pooler::new(&config(PoolOrder::Spatial));
        // 4x4 map, value = row * 10 + col
        let samples: Vec<Sample> = (0..16).map(|i| (i / 4) * 10 + i % 4).collect();

        let results = run(&mut pooler, &samples, 0, PoolType::Max);
        assert_eq!(results, vec![11, 13, 31, 33]);

        let mut pooler = Pooler::new(&config(PoolOrder::Spatial));
        let results = run(&mut pooler, &samples, 2, PoolType::PassThrough);
        // First element of each tile is its top-left corner
        assert_eq!(results, vec![0, 2, 20, 22]);
    }

    #[test]
    fn test_unit_pool_streams_every_cycle() {
        let mut config = config(PoolOrder::Chunked);
        config.geometry.pool_size = 1;
        let mut pooler = Pooler::new(&config);
        let samples: Vec<Sample> = (0..16).collect();

        let results = run(&mut pooler, &samples, 0, PoolType::Average);
        assert_eq!(results, samples);
    }

    #[test]
    fn test_disable_parks_and_done_releases() {
        let mut pooler = Pooler::new(&config(PoolOrder::Chunked));
        pooler.clock(&enabled(Beat::IDLE, PoolType::Max));
        pooler.clock(&enabled(Beat::valid(1), PoolType::Max));

        let disabled = PoolInputs { enable: false, beat: Beat::valid(2), pool_type: PoolType::Max };
        pooler.clock(&disabled);
        assert_eq!(pooler.filled(), 1);
        assert_eq!(pooler.state(), PoolState::Load);

        pooler.reset();
        assert_eq!(pooler.state(), PoolState::Idle);
        assert_eq!(pooler.filled(), 0);

        let samples = vec![0; 16];
        run(&mut pooler, &samples, 0, PoolType::Max);
        assert!(pooler.outputs().done);
        pooler.clock(&disabled);
        assert_eq!(pooler.state(), PoolState::Idle);
    }

    #[test]
    fn test_mode_latched_at_start() {
        let mut pooler = Pooler::new(&config(PoolOrder::Chunked));
        pooler.clock(&enabled(Beat::IDLE, PoolType::Min));
        for x in [4, 9, 2, 7] {
            pooler.clock(&enabled(Beat::valid(x), PoolType::Max));
        }
        assert_eq!(pooler.mode(), PoolType::Min);
        assert_eq!(pooler.outputs().beat, Beat::valid(2));
    }
}
