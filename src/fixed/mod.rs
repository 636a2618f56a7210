// src/fixed/mod.rs
//! Signed Q-format arithmetic shared by every stage of the layer
//!
//! A [`Sample`] always holds a sign-extended N-bit two's complement value.
//! Anything that widens (products, accumulators, sums) is reduced back to
//! N bits with [`FixedFormat::wrap`], so overflow wraps exactly like a
//! fixed-width register would.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One fixed-point value on the datapath
pub type Sample = i32;

/// Bit width and fractional bit count of a [`Sample`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FixedFormat {
    width: u32,
    frac: u32,
}

impl FixedFormat {
    /// Width must lie in 2..=32 and frac below width; `LayerConfig::validate` enforces this
    pub fn new(width: u32, frac: u32) -> Self {
        debug_assert!((2..=32).contains(&width) && frac < width);
        Self { width, frac }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn frac(&self) -> u32 {
        self.frac
    }

    /// Width of the MAC and average accumulators
    pub fn accumulator_width(&self) -> u32 {
        2 * self.width
    }

    pub fn min_value(&self) -> Sample {
        (-(1i64 << (self.width - 1))) as Sample
    }

    pub fn max_value(&self) -> Sample {
        ((1i64 << (self.width - 1)) - 1) as Sample
    }

    /// Truncate to N bits and sign-extend
    pub fn wrap(&self, value: i64) -> Sample {
        sign_extend(value, self.width) as Sample
    }

    /// Truncate to the 2N-bit accumulator width and sign-extend
    pub fn wrap_accumulator(&self, value: i64) -> i64 {
        sign_extend(value, self.accumulator_width())
    }

    /// Fixed-point multiply: signed product, arithmetic shift right by Q
    pub fn mul_shift(&self, a: Sample, b: Sample) -> Sample {
        self.wrap((a as i64 * b as i64) >> self.frac)
    }

    /// Sum of element-wise products, rescaled by Q in one step.
    ///
    /// Products are spread over `lanes` partial accumulators and then folded;
    /// every accumulator wraps at 2N bits, which never changes the low bits
    /// that survive the final shift, so the lane count is unobservable.
    pub fn mac(&self, window: &[Sample], weights: &[Sample], lanes: usize) -> Sample {
        debug_assert_eq!(window.len(), weights.len());
        let lanes = lanes.max(1);

        let mut partial = vec![0i64; lanes];
        for (i, (&x, &w)) in window.iter().zip(weights.iter()).enumerate() {
            let slot = &mut partial[i % lanes];
            *slot = self.wrap_accumulator(slot.wrapping_add(x as i64 * w as i64));
        }

        let total = partial
            .iter()
            .fold(0i64, |acc, &p| self.wrap_accumulator(acc.wrapping_add(p)));

        self.wrap(total >> self.frac)
    }

    /// Clear the bottom Q-1 bits; sign and upper bits pass through untouched
    pub fn quantize(&self, x: Sample) -> Sample {
        if self.frac <= 1 {
            return x;
        }
        let mask = !((1i32 << (self.frac - 1)) - 1);
        x & mask
    }

    /// Clamp negative values to zero
    pub fn relu(&self, x: Sample) -> Sample {
        if self.is_negative(x) {
            0
        } else {
            x
        }
    }

    pub fn is_negative(&self, x: Sample) -> bool {
        x < 0
    }

    /// Raw N-bit pattern of a sample
    pub fn to_bits(&self, x: Sample) -> u64 {
        (x as i64 as u64) & self.bit_mask()
    }

    /// Interpret the low N bits of `bits` as a sample
    pub fn from_bits(&self, bits: u64) -> Sample {
        self.wrap((bits & self.bit_mask()) as i64)
    }

    /// Real value represented by a sample, for reports only
    pub fn to_real(&self, x: Sample) -> f64 {
        x as f64 / (1u64 << self.frac) as f64
    }

    fn bit_mask(&self) -> u64 {
        (1u64 << self.width) - 1
    }
}

impl fmt::Display for FixedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}.{}", self.width - self.frac, self.frac)
    }
}

fn sign_extend(value: i64, bits: u32) -> i64 {
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    (value << shift) >> shift
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum WordError {
    #[error("invalid hex digit '{0}'")]
    InvalidHex(char),

    #[error("word has bits set above bit {bits}")]
    TooWide { bits: usize },
}

/// The k*k kernel packed into a single k*k*N-bit word.
///
/// Weight `i` (row-major) occupies bits `[i*N, (i+1)*N)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightWord {
    limbs: Vec<u64>,
    count: usize,
    format: FixedFormat,
}

impl WeightWord {
    pub fn pack(weights: &[Sample], format: FixedFormat) -> Self {
        let mut word = Self::zeroed(weights.len(), format);
        let width = format.width() as usize;
        for (i, &w) in weights.iter().enumerate() {
            let bits = format.to_bits(w);
            for b in 0..width {
                if (bits >> b) & 1 == 1 {
                    word.set_bit(i * width + b);
                }
            }
        }
        word
    }

    pub fn unpack(&self) -> Vec<Sample> {
        let width = self.format.width() as usize;
        (0..self.count)
            .map(|i| {
                let bits = (0..width).fold(0u64, |acc, b| {
                    acc | ((self.bit(i * width + b) as u64) << b)
                });
                self.format.from_bits(bits)
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn format(&self) -> FixedFormat {
        self.format
    }

    pub fn bit_len(&self) -> usize {
        self.count * self.format.width() as usize
    }

    /// Most significant nibble first, zero padded to the full word
    pub fn to_hex(&self) -> String {
        let nibbles = (self.bit_len() + 3) / 4;
        (0..nibbles)
            .rev()
            .map(|n| {
                let v = (0..4).fold(0u32, |acc, b| acc | ((self.bit(n * 4 + b) as u32) << b));
                std::char::from_digit(v, 16).unwrap_or('0')
            })
            .collect()
    }

    /// Parse a hex word (optional `0x` prefix, `_` separators allowed)
    pub fn from_hex(text: &str, count: usize, format: FixedFormat) -> Result<Self, WordError> {
        let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
        let mut word = Self::zeroed(count, format);
        let bit_len = word.bit_len();

        let nibbles = digits.chars().rev().filter(|&c| c != '_');
        for (n, c) in nibbles.enumerate() {
            let v = c.to_digit(16).ok_or(WordError::InvalidHex(c))?;
            for b in 0..4 {
                if (v >> b) & 1 == 1 {
                    let pos = n * 4 + b;
                    if pos >= bit_len {
                        return Err(WordError::TooWide { bits: bit_len });
                    }
                    word.set_bit(pos);
                }
            }
        }
        Ok(word)
    }

    fn zeroed(count: usize, format: FixedFormat) -> Self {
        let bits = count * format.width() as usize;
        Self {
            limbs: vec![0; (bits + 63) / 64],
            count,
            format,
        }
    }

    fn bit(&self, pos: usize) -> bool {
        self.limbs
            .get(pos / 64)
            .map_or(false, |limb| (limb >> (pos % 64)) & 1 == 1)
    }

    fn set_bit(&mut self, pos: usize) {
        self.limbs[pos / 64] |= 1u64 << (pos % 64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn q8() -> FixedFormat {
        FixedFormat::new(16, 8)
    }

    #[test]
    fn test_wrap_sign_extends() {
        let fmt = FixedFormat::new(8, 2);
        assert_eq!(fmt.wrap(127), 127);
        assert_eq!(fmt.wrap(128), -128);
        assert_eq!(fmt.wrap(255), -1);
        assert_eq!(fmt.wrap(256), 0);
        assert_eq!(fmt.wrap(-129), 127);
        assert_eq!(fmt.min_value(), -128);
        assert_eq!(fmt.max_value(), 127);
    }

    #[test]
    fn test_wrap_full_width() {
        let fmt = FixedFormat::new(32, 16);
        assert_eq!(fmt.wrap(i32::MAX as i64 + 1), i32::MIN);
        assert_eq!(fmt.min_value(), i32::MIN);
        assert_eq!(fmt.max_value(), i32::MAX);
    }

    #[test]
    fn test_mul_shift() {
        let fmt = q8();
        // 1.5 * 2.0 = 3.0
        assert_eq!(fmt.mul_shift(384, 512), 768);
        // -0.5 * 0.00390625 -> -0.001953125 rounds toward -inf
        assert_eq!(fmt.mul_shift(-128, 1), -1);
        assert_eq!(fmt.mul_shift(128, 1), 0);
    }

    #[test]
    fn test_mac_matches_exact_formula() {
        let fmt = q8();
        let window = [256, -512, 100, 7];
        let weights = [256, 256, -3, 9];
        let exact: i64 = window
            .iter()
            .zip(weights.iter())
            .map(|(&a, &b)| a as i64 * b as i64)
            .sum();
        assert_eq!(fmt.mac(&window, &weights, 1), fmt.wrap(exact >> 8));
    }

    #[test]
    fn test_mac_lane_count_is_unobservable() {
        let fmt = FixedFormat::new(8, 3);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let window: Vec<Sample> = (0..9).map(|_| rng.gen_range(-128..128)).collect();
            let weights: Vec<Sample> = (0..9).map(|_| rng.gen_range(-128..128)).collect();
            let single = fmt.mac(&window, &weights, 1);
            for lanes in 2..=9 {
                assert_eq!(fmt.mac(&window, &weights, lanes), single);
            }
        }
    }

    #[test]
    fn test_mac_wraps_on_overflow() {
        let fmt = FixedFormat::new(4, 0);
        // 7*7 + 7*7 = 98 -> low 4 bits 0b0010
        assert_eq!(fmt.mac(&[7, 7], &[7, 7], 1), 2);
    }

    #[test]
    fn test_quantize_clears_low_bits() {
        let fmt = q8();
        // Q=8 clears the bottom 7 bits
        assert_eq!(fmt.quantize(0x00FF), 0x0080);
        assert_eq!(fmt.quantize(0x017F), 0x0100);
        assert_eq!(fmt.quantize(-1), -128);
        assert_eq!(fmt.quantize(0), 0);
    }

    #[test]
    fn test_quantize_identity_for_small_q() {
        let q1 = FixedFormat::new(8, 1);
        let q0 = FixedFormat::new(8, 0);
        for x in -128..128 {
            assert_eq!(q1.quantize(x), x);
            assert_eq!(q0.quantize(x), x);
        }
    }

    #[test]
    fn test_quantize_is_idempotent() {
        let fmt = FixedFormat::new(12, 5);
        for x in fmt.min_value()..=fmt.max_value() {
            let once = fmt.quantize(x);
            assert_eq!(fmt.quantize(once), once);
            assert!(once <= x);
            assert_eq!(fmt.wrap(once as i64), once);
        }
    }

    #[test]
    fn test_relu_properties() {
        let fmt = FixedFormat::new(8, 4);
        for x in -128..128 {
            let r = fmt.relu(x);
            assert_eq!(fmt.relu(r), r);
            assert!(r >= 0);
            for y in -128..=x {
                assert!(fmt.relu(x) >= fmt.relu(y));
            }
        }
        assert_eq!(fmt.relu(-1), 0);
        assert_eq!(fmt.relu(5), 5);
    }

    #[test]
    fn test_bits_roundtrip_negative() {
        let fmt = FixedFormat::new(8, 0);
        assert_eq!(fmt.to_bits(-1), 0xFF);
        assert_eq!(fmt.from_bits(0xFF), -1);
        assert_eq!(fmt.from_bits(0x1FF), -1);
    }

    #[test]
    fn test_to_real() {
        let fmt = q8();
        assert_eq!(fmt.to_real(384), 1.5);
        assert_eq!(fmt.to_real(-64), -0.25);
        assert_eq!(format!("{}", fmt), "Q8.8");
    }

    #[test]
    fn test_weight_word_layout() {
        let fmt = FixedFormat::new(8, 0);
        let word = WeightWord::pack(&[1, -1, 0x12], fmt);
        assert_eq!(word.bit_len(), 24);
        // weight 0 in the least significant byte
        assert_eq!(word.to_hex(), "12ff01");
        assert_eq!(word.unpack(), vec![1, -1, 0x12]);
    }

    #[test]
    fn test_weight_word_spans_limbs() {
        let fmt = FixedFormat::new(30, 10);
        let weights: Vec<Sample> = (0..9).map(|i| (i as Sample - 4) * 123_457).collect();
        let word = WeightWord::pack(&weights, fmt);
        assert_eq!(word.bit_len(), 270);
        assert_eq!(word.unpack(), weights);

        let parsed = WeightWord::from_hex(&word.to_hex(), 9, fmt).unwrap();
        assert_eq!(parsed, word);
    }

    #[test]
    fn test_weight_word_hex_errors() {
        let fmt = FixedFormat::new(8, 0);
        assert_eq!(
            WeightWord::from_hex("0xzz", 2, fmt),
            Err(WordError::InvalidHex('z'))
        );
        assert_eq!(
            WeightWord::from_hex("1_0000", 2, fmt),
            Err(WordError::TooWide { bits: 16 })
        );
        let word = WeightWord::from_hex("0x80_7f", 2, fmt).unwrap();
        assert_eq!(word.unpack(), vec![127, -128]);
    }
}
