// src/config/mod.rs
//! Layer configuration system
//! Handles TOML parsing and validation of the construction-time constants

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::fixed::FixedFormat;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub format: FormatConfig,
    pub geometry: GeometryConfig,
    pub engine: EngineConfig,
    pub clock: ClockConfig,
}

/// Sample encoding shared by activations, weights and every stage output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatConfig {
    /// Total bit width N
    pub width: u32,
    /// Fractional bit count Q
    pub frac: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryConfig {
    /// Side n of the square input activation map
    pub image_size: usize,
    /// Side k of the square weight kernel
    pub kernel_size: usize,
    /// Side p of the square pooling window
    pub pool_size: usize,
    /// Convolution stride s
    pub stride: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Parallel partial sums in the MAC reduction
    pub mac_lanes: usize,
    #[serde(default)]
    pub pool_order: PoolOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    pub period_ns: f64,
}

/// How the pooler groups its input stream into blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolOrder {
    /// Every p*p consecutive valid samples form one block
    #[default]
    Chunked,
    /// Blocks are the p x p tiles of the row-major conv output map
    Spatial,
}

impl LayerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LayerConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reference configuration: 16-bit Q8 samples, 6x6 map, 3x3 kernel, 2x2 pool
    pub fn default_reference() -> Self {
        Self {
            format: FormatConfig { width: 16, frac: 8 },
            geometry: GeometryConfig {
                image_size: 6,
                kernel_size: 3,
                pool_size: 2,
                stride: 1,
            },
            engine: EngineConfig {
                mac_lanes: 9,
                pool_order: PoolOrder::Chunked,
            },
            clock: ClockConfig { period_ns: 10.0 },
        }
    }

    /// Reference configuration with a different sample encoding
    pub fn with_format(width: u32, frac: u32) -> Self {
        let mut config = Self::default_reference();
        config.format = FormatConfig { width, frac };
        config
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let FormatConfig { width, frac } = self.format;
        if !(2..=32).contains(&width) {
            return Err(ConfigError::Validation(format!(
                "Sample width must be in 2..=32, got {}",
                width
            )));
        }
        if frac >= width {
            return Err(ConfigError::Validation(format!(
                "Fractional bits ({}) must be less than width ({})",
                frac, width
            )));
        }

        let g = &self.geometry;
        if g.kernel_size == 0 {
            return Err(ConfigError::Validation("Kernel size must be > 0".to_string()));
        }
        if g.kernel_size > g.image_size {
            return Err(ConfigError::Validation(format!(
                "Kernel size ({}) exceeds image size ({})",
                g.kernel_size, g.image_size
            )));
        }
        if g.stride == 0 {
            return Err(ConfigError::Validation("Stride must be > 0".to_string()));
        }
        if g.pool_size == 0 {
            return Err(ConfigError::Validation("Pool size must be > 0".to_string()));
        }

        let m = self.output_side();
        if g.pool_size > m || m % g.pool_size != 0 {
            return Err(ConfigError::Validation(format!(
                "Pool size ({}) must divide the convolution output side ({})",
                g.pool_size, m
            )));
        }

        let taps = self.kernel_taps();
        if self.engine.mac_lanes == 0 || self.engine.mac_lanes > taps {
            return Err(ConfigError::Validation(format!(
                "MAC lanes must be in 1..={}, got {}",
                taps, self.engine.mac_lanes
            )));
        }

        if !(self.clock.period_ns > 0.0) {
            return Err(ConfigError::Validation(
                "Clock period must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn fixed_format(&self) -> FixedFormat {
        FixedFormat::new(self.format.width, self.format.frac)
    }

    /// Number of input samples per pass (n*n)
    pub fn input_samples(&self) -> usize {
        self.geometry.image_size * self.geometry.image_size
    }

    /// Number of kernel weights (k*k)
    pub fn kernel_taps(&self) -> usize {
        self.geometry.kernel_size * self.geometry.kernel_size
    }

    /// Side m of the convolution output map: (n-k)/s + 1
    pub fn output_side(&self) -> usize {
        let g = &self.geometry;
        (g.image_size - g.kernel_size) / g.stride + 1
    }

    /// Number of convolution results per pass
    pub fn conv_outputs(&self) -> usize {
        self.output_side() * self.output_side()
    }

    /// Side of the pooled output map: m/p
    pub fn pooled_side(&self) -> usize {
        self.output_side() / self.geometry.pool_size
    }

    /// Number of valid_out pulses per pass
    pub fn expected_outputs(&self) -> usize {
        self.pooled_side() * self.pooled_side()
    }

    /// Slots retained by the convolver line buffer: (k-1)*n + k
    pub fn line_buffer_slots(&self) -> usize {
        let g = &self.geometry;
        (g.kernel_size - 1) * g.image_size + g.kernel_size
    }

    /// Export configuration to TOML string
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let toml_str = self.to_toml_string()?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path.as_ref(), toml_str)?;
        Ok(())
    }
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self::default_reference()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialize(String),
}
