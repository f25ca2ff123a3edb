//! Soft limiter - last stage of the master chain
//!
//!   deck sum → master volume → **soft limiter** → output
//!
//! A static `tanh` curve instead of a lookahead limiter: no state, no
//! latency, and the output magnitude can never reach 1.0 however many
//! stems pile up.
//!
//! ```text
//! y = tanh(x · DRIVE) · CEILING
//! ```
//!
//! Near zero the curve is almost linear (slope DRIVE · CEILING ≈ 0.9), so
//! quiet material passes with a fixed small gain change and no distortion.

use crate::types::StereoBuffer;

// ═══════════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════════

/// Input drive into the tanh curve
pub const DRIVE: f32 = 0.95;

/// Output ceiling (linear amplitude)
pub const CEILING: f32 = 0.95;

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Limit a single sample value
#[inline]
pub fn soft_limit(x: f32) -> f32 {
    (x * DRIVE).tanh() * CEILING
}

/// Limit a whole block in place
pub fn process(buffer: &mut StereoBuffer) {
    for sample in buffer.as_mut_slice() {
        sample.left = soft_limit(sample.left);
        sample.right = soft_limit(sample.right);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    #[test]
    fn test_silence_passes_through() {
        assert_eq!(soft_limit(0.0), 0.0);
    }

    #[test]
    fn test_never_exceeds_ceiling() {
        for x in [1.0, 2.0, 5.0, 50.0, -50.0] {
            assert!(soft_limit(x).abs() <= CEILING, "x={}", x);
        }
    }

    #[test]
    fn test_monotonic_and_odd() {
        let mut previous = soft_limit(-4.0);
        let mut x = -4.0;
        while x < 4.0 {
            x += 0.01;
            let y = soft_limit(x);
            assert!(y >= previous);
            assert!((soft_limit(-x) + y).abs() < 1e-6);
            previous = y;
        }
    }

    #[test]
    fn test_quiet_signal_is_near_linear() {
        let y = soft_limit(0.01);
        assert!((y - 0.01 * DRIVE * CEILING).abs() < 1e-5);
    }

    #[test]
    fn test_process_block() {
        let mut buffer = StereoBuffer::from_vec(vec![StereoSample::new(3.0, -3.0); 32]);
        process(&mut buffer);
        assert!(buffer.peak() < CEILING);
        assert!(buffer[0].left > 0.9);
        assert!(buffer[0].right < -0.9);
    }
}
