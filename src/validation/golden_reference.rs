// src/validation/golden_reference.rs
//! Golden reference validation framework
//!
//! An independent, non-streaming model of the layer: the whole map is held
//! in memory and every sum is computed exactly in i128 before truncation.
//! Simulator passes are checked against it bit-for-bit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::{LayerConfig, PoolOrder};
use crate::fixed::Sample;
use crate::layer::PoolType;
use crate::stimulus::{PassReport, Stimulus};

/// Keep the low `bits` of an exact value, sign-extended
fn truncate(value: i128, bits: u32) -> i64 {
    let shift = 128 - bits;
    ((value << shift) >> shift) as i64
}

/// Convolution output map, row-major, (n-k)/s + 1 on a side
pub fn reference_conv(config: &LayerConfig, activations: &[Sample], weights: &[Sample]) -> Vec<Sample> {
    let g = &config.geometry;
    let (n, k, s) = (g.image_size, g.kernel_size, g.stride);
    let m = config.output_side();
    let (width, frac) = (config.format.width, config.format.frac);

    let mut out = Vec::with_capacity(m * m);
    for r in 0..m {
        for c in 0..m {
            let mut acc: i128 = 0;
            for i in 0..k {
                for j in 0..k {
                    let x = activations[(r * s + i) * n + c * s + j] as i128;
                    acc += x * weights[i * k + j] as i128;
                }
            }
            out.push(truncate(acc >> frac, width) as Sample);
        }
    }
    out
}

/// Floor the value to a multiple of 2^(Q-1)
pub fn reference_quantize(config: &LayerConfig, x: Sample) -> Sample {
    let frac = config.format.frac;
    if frac <= 1 {
        return x;
    }
    let step = 1i64 << (frac - 1);
    (x as i64 - (x as i64).rem_euclid(step)) as Sample
}

pub fn reference_relu(x: Sample) -> Sample {
    x.max(0)
}

/// Split the post-activation map into pooling blocks in emission order
fn pool_blocks(config: &LayerConfig, map: &[Sample]) -> Vec<Vec<Sample>> {
    let p = config.geometry.pool_size;
    let m = config.output_side();
    match config.engine.pool_order {
        PoolOrder::Chunked => map
            .chunks(p * p)
            .filter(|chunk| chunk.len() == p * p)
            .map(|chunk| chunk.to_vec())
            .collect(),
        PoolOrder::Spatial => {
            let mut blocks = Vec::new();
            for br in 0..m / p {
                for bc in 0..m / p {
                    let block = (0..p)
                        .flat_map(|i| (0..p).map(move |j| (br * p + i) * m + bc * p + j))
                        .map(|idx| map[idx])
                        .collect();
                    blocks.push(block);
                }
            }
            blocks
        }
    }
}

fn reference_reduce(config: &LayerConfig, pool_type: PoolType, block: &[Sample]) -> Sample {
    let width = config.format.width;
    match pool_type {
        PoolType::Max => block.iter().copied().max().unwrap_or(0),
        PoolType::Min => block.iter().copied().min().unwrap_or(0),
        PoolType::Average => {
            let exact: i128 = block.iter().map(|&x| x as i128).sum();
            let sum = truncate(exact, 2 * width) as i128;
            truncate(sum / block.len() as i128, width) as Sample
        }
        PoolType::PassThrough => block.first().copied().unwrap_or(0),
    }
}

/// Quantize, ReLU and pool a convolution map
fn reference_pool(config: &LayerConfig, conv: &[Sample], pool_type: PoolType) -> Vec<Sample> {
    let activated: Vec<Sample> = conv
        .iter()
        .map(|&x| reference_relu(reference_quantize(config, x)))
        .collect();
    pool_blocks(config, &activated)
        .iter()
        .map(|block| reference_reduce(config, pool_type, block))
        .collect()
}

/// Pooled layer outputs in the order the hardware emits them
pub fn reference_layer(
    config: &LayerConfig,
    activations: &[Sample],
    weights: &[Sample],
    pool_type: PoolType,
) -> Vec<Sample> {
    reference_pool(config, &reference_conv(config, activations, weights), pool_type)
}

/// Expected results of one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceData {
    pub description: String,
    pub stimulus: Stimulus,
    pub pool_type: PoolType,
    pub expected_conv: Vec<Sample>,
    pub expected_output: Vec<Sample>,
}

impl ReferenceData {
    /// Run the golden model over a stimulus
    pub fn compute(config: &LayerConfig, stimulus: Stimulus, pool_type: PoolType, description: &str) -> Self {
        let expected_conv = reference_conv(config, &stimulus.activations, &stimulus.weights);
        let expected_output = reference_pool(config, &expected_conv, pool_type);

        Self {
            description: description.to_string(),
            stimulus,
            pool_type,
            expected_conv,
            expected_output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub test_name: String,
    pub passed: bool,
    pub output_match: bool,
    pub conv_match: bool,
    pub done_match: bool,
    /// Indices of pooled outputs that differ from the reference
    pub mismatches: Vec<usize>,
    pub expected_output: Vec<Sample>,
    pub actual_output: Vec<Sample>,
    pub actual_cycles: u64,
    pub error_message: Option<String>,
}

impl ValidationResult {
    pub fn failure(test_name: String, error: String) -> Self {
        Self {
            test_name,
            passed: false,
            output_match: false,
            conv_match: false,
            done_match: false,
            mismatches: Vec::new(),
            expected_output: Vec::new(),
            actual_output: Vec::new(),
            actual_cycles: 0,
            error_message: Some(error),
        }
    }
}

/// Compare a simulated pass with the golden model, bit-for-bit
pub fn check_pass(test_name: &str, reference: &ReferenceData, report: &PassReport) -> ValidationResult {
    let expected = &reference.expected_output;
    let actual = &report.outputs;

    let mismatches: Vec<usize> = (0..expected.len().max(actual.len()))
        .filter(|&i| expected.get(i) != actual.get(i))
        .collect();
    let output_match = mismatches.is_empty();
    let conv_match = report.conv_outputs == reference.expected_conv;
    let done_match = report.done_pulses == 1;

    let error_message = if !output_match {
        Some(format!(
            "Output mismatch at {:?}. Expected: {:?}, Got: {:?}",
            mismatches, expected, actual
        ))
    } else if !conv_match {
        Some("Convolution results differ from the reference".to_string())
    } else if !done_match {
        Some(format!("Expected one done pulse, saw {}", report.done_pulses))
    } else {
        None
    };

    ValidationResult {
        test_name: test_name.to_string(),
        passed: output_match && conv_match && done_match,
        output_match,
        conv_match,
        done_match,
        mismatches,
        expected_output: expected.clone(),
        actual_output: actual.clone(),
        actual_cycles: report.cycles,
        error_message,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Named reference vectors for one layer configuration
pub struct GoldenReference {
    config: LayerConfig,
    references: BTreeMap<String, ReferenceData>,
}

impl GoldenReference {
    pub fn new(config: LayerConfig) -> Self {
        Self {
            config,
            references: BTreeMap::new(),
        }
    }

    /// Directed vectors plus a few seeded random passes for every pool mode
    pub fn with_default_vectors(config: LayerConfig) -> Self {
        let mut reference = Self::new(config);
        reference.add_default_references();
        reference
    }

    fn add_default_references(&mut self) {
        let config = self.config.clone();

        self.add_stimulus(
            "all_zero",
            Stimulus::constant(&config, 0, 0),
            PoolType::Max,
            "All-zero activations and weights",
        );

        // All-ones bit pattern is -1 in two's complement
        self.add_stimulus(
            "all_ones_avg",
            Stimulus::constant(&config, -1, -1),
            PoolType::Average,
            "All-ones activations and weights, average pooling",
        );

        let modes = [PoolType::Max, PoolType::Average, PoolType::Min, PoolType::PassThrough];
        for (seed, mode) in modes.iter().enumerate() {
            let seed = seed as u64 + 1;
            self.add_stimulus(
                &format!("random_{}_{}", mode, seed),
                Stimulus::random(&config, seed),
                *mode,
                &format!("Seeded random map, {} pooling", mode),
            );
        }
    }

    pub fn add_stimulus(&mut self, name: &str, stimulus: Stimulus, pool_type: PoolType, description: &str) {
        let data = ReferenceData::compute(&self.config, stimulus, pool_type, description);
        self.add_reference(name, data);
    }

    pub fn add_reference(&mut self, name: &str, reference: ReferenceData) {
        self.references.insert(name.to_string(), reference);
    }

    pub fn get_reference(&self, name: &str) -> Option<&ReferenceData> {
        self.references.get(name)
    }

    pub fn list_available_tests(&self) -> Vec<String> {
        self.references.keys().cloned().collect()
    }

    pub fn validate_output(&self, test_name: &str, report: &PassReport) -> ValidationResult {
        match self.get_reference(test_name) {
            Some(reference) => check_pass(test_name, reference, report),
            None => ValidationResult::failure(
                test_name.to_string(),
                format!("No reference data found for test: {}", test_name),
            ),
        }
    }

    pub fn export_references<P: AsRef<Path>>(&self, path: P) -> Result<(), ReferenceError> {
        let json = serde_json::to_string_pretty(&self.references)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn import_references<P: AsRef<Path>>(&mut self, path: P) -> Result<usize, ReferenceError> {
        let content = std::fs::read_to_string(path)?;
        let references: BTreeMap<String, ReferenceData> = serde_json::from_str(&content)?;
        let count = references.len();
        self.references.extend(references);
        Ok(count)
    }
}
