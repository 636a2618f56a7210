// src/validation/seed_sweep.rs
//! Parallel seed sweeps against the golden reference

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::golden_reference::{check_pass, ReferenceData, ReferenceError, ValidationResult};
use crate::config::LayerConfig;
use crate::layer::PoolType;
use crate::stimulus::{Stimulus, Testbench};

/// How sweep stimuli are drawn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StimulusRange {
    /// [-2.0, 2.0] in the configured Q-format
    Nominal,
    /// Anywhere in the N-bit range, exercising wrap-around
    FullRange,
}

impl StimulusRange {
    fn draw(&self, config: &LayerConfig, seed: u64) -> Stimulus {
        match self {
            StimulusRange::Nominal => Stimulus::random(config, seed),
            StimulusRange::FullRange => Stimulus::random_full_range(config, seed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub pool_type: PoolType,
    pub range: StimulusRange,
    pub total: usize,
    pub passed: usize,
    pub failed_seeds: Vec<u64>,
    pub total_cycles: u64,
    pub results: Vec<ValidationResult>,
}

impl SweepSummary {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.passed as f64 / self.total as f64
    }

    pub fn export<P: AsRef<Path>>(&self, path: P) -> Result<(), ReferenceError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn run_seed(config: &LayerConfig, seed: u64, pool_type: PoolType, range: StimulusRange) -> ValidationResult {
    let name = format!("seed_{}_{}", seed, pool_type);
    let stimulus = range.draw(config, seed);
    let reference = ReferenceData::compute(config, stimulus.clone(), pool_type, &name);

    let report = Testbench::new(config.clone()).and_then(|mut tb| tb.run(&stimulus, pool_type));
    match report {
        Ok(report) => check_pass(&name, &reference, &report),
        Err(e) => ValidationResult::failure(name, e.to_string()),
    }
}

/// Simulate one pass per seed, each on its own layer instance, and check them all
pub fn run_seed_sweep(
    config: &LayerConfig,
    seeds: &[u64],
    pool_type: PoolType,
    range: StimulusRange,
) -> SweepSummary {
    let results: Vec<ValidationResult> = seeds
        .par_iter()
        .map(|&seed| run_seed(config, seed, pool_type, range))
        .collect();

    let failed_seeds: Vec<u64> = seeds
        .iter()
        .zip(&results)
        .filter(|(_, r)| !r.passed)
        .map(|(&seed, _)| seed)
        .collect();
    let passed = results.len() - failed_seeds.len();
    let total_cycles = results.iter().map(|r| r.actual_cycles).sum();

    if failed_seeds.is_empty() {
        info!("sweep: {}/{} seeds match the reference ({} pooling)", passed, seeds.len(), pool_type);
    } else {
        warn!("sweep: {} seeds diverge from the reference: {:?}", failed_seeds.len(), failed_seeds);
    }

    SweepSummary {
        pool_type,
        range,
        total: results.len(),
        passed,
        failed_seeds,
        total_cycles,
        results,
    }
}
