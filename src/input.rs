//! Input generation and shaping.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Element count used by the driver when none is given.
pub const DEFAULT_AMOUNT: usize = 256 * 2560;

/// Threshold used by the driver when none is given.
pub const DEFAULT_LIMIT: f32 = 0.9;

/// Padding value appended by [`pad_to_block`]. NaN compares false against
/// every limit, so padded slots are never selected.
pub const PAD_VALUE: f32 = f32::NAN;

/// Seeded source of uniform `f32` inputs in `[0, 1)`.
pub struct InputGenerator {
    rng: StdRng,
}

impl InputGenerator {
    /// Generator with a fixed seed; the same seed yields the same inputs.
    pub fn new(seed: u64) -> Self {
        InputGenerator {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Generator seeded from the operating system.
    pub fn from_entropy() -> Self {
        InputGenerator {
            rng: StdRng::from_entropy(),
        }
    }

    /// `n` uniform values in `[0, 1)`.
    pub fn uniform_f32(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.rng.gen::<f32>()).collect()
    }
}

/// Extend `input` to the next multiple of `block_size` with [`PAD_VALUE`].
///
/// Returns the input unchanged when it is already aligned. A zero block
/// size leaves the input as is; the launch rejects it later.
pub fn pad_to_block(input: &[f32], block_size: usize) -> Vec<f32> {
    let mut padded = input.to_vec();
    if block_size == 0 {
        return padded;
    }
    let rem = input.len() % block_size;
    if rem != 0 {
        padded.resize(input.len() + block_size - rem, PAD_VALUE);
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_is_reproducible() {
        let a = InputGenerator::new(7).uniform_f32(1000);
        let b = InputGenerator::new(7).uniform_f32(1000);
        let c = InputGenerator::new(8).uniform_f32(1000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_uniform_range() {
        let v = InputGenerator::new(1).uniform_f32(10_000);
        assert_eq!(v.len(), 10_000);
        assert!(v.iter().all(|&x| (0.0..1.0).contains(&x)));
        // Roughly a tenth should clear the default limit.
        let hits = v.iter().filter(|&&x| x >= DEFAULT_LIMIT).count();
        assert!((800..1200).contains(&hits), "{hits}");
    }

    #[test]
    fn test_from_entropy_range() {
        let v = InputGenerator::from_entropy().uniform_f32(64);
        assert!(v.iter().all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn test_pad_to_block() {
        let input = vec![0.5f32; 1000];
        let padded = pad_to_block(&input, 512);
        assert_eq!(padded.len(), 1024);
        assert_eq!(&padded[..1000], input.as_slice());
        assert!(padded[1000..].iter().all(|x| x.is_nan()));

        assert_eq!(pad_to_block(&input[..512], 512).len(), 512);
        assert!(pad_to_block(&[], 512).is_empty());
        assert_eq!(pad_to_block(&input, 0).len(), 1000);
    }

    #[test]
    fn test_padding_never_qualifies() {
        let padded = pad_to_block(&[1.0, 2.0, 3.0], 8);
        for limit in [f32::NEG_INFINITY, -1e30, 0.0, 1.0, f32::INFINITY] {
            assert_eq!(padded[3..].iter().filter(|&&x| x >= limit).count(), 0);
        }
    }
}
