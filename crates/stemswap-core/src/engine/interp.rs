//! Fractional-position sample reads for variable-rate playback
//!
//! - **Linear**: 2-point, cheapest.
//! - **Cubic**: 4-point Catmull-Rom spline, passes through every sample and
//!   keeps the first derivative continuous.

use crate::types::StereoSample;
use serde::{Deserialize, Serialize};

/// Interpolation method used by stem voices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationMethod {
    Linear,
    #[default]
    Cubic,
}

#[inline]
fn lerp_sample(s0: StereoSample, s1: StereoSample, t: f32) -> StereoSample {
    StereoSample {
        left: s0.left + (s1.left - s0.left) * t,
        right: s0.right + (s1.right - s0.right) * t,
    }
}

#[inline]
fn cubic_interpolate(s0: StereoSample, s1: StereoSample, s2: StereoSample, s3: StereoSample, t: f32) -> StereoSample {
    let t2 = t * t;
    let t3 = t2 * t;

    let c0 = -0.5 * t3 + t2 - 0.5 * t;
    let c1 = 1.5 * t3 - 2.5 * t2 + 1.0;
    let c2 = -1.5 * t3 + 2.0 * t2 + 0.5 * t;
    let c3 = 0.5 * t3 - 0.5 * t2;

    StereoSample {
        left: s0.left * c0 + s1.left * c1 + s2.left * c2 + s3.left * c3,
        right: s0.right * c0 + s1.right * c1 + s2.right * c2 + s3.right * c3,
    }
}

/// Frame range a voice reads from, and what happens past its edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWindow {
    pub start: usize,
    pub end: usize,
    /// Wrap neighbours around the window instead of holding the edge frame
    pub looping: bool,
}

impl ReadWindow {
    pub fn new(start: usize, end: usize, looping: bool) -> Self {
        Self { start, end, looping }
    }

    /// Map a raw frame index to one inside the window
    #[inline]
    fn resolve(&self, index: i64) -> Option<usize> {
        if self.end <= self.start {
            return None;
        }
        let start = self.start as i64;
        let end = self.end as i64;
        let index = if self.looping {
            start + (index - start).rem_euclid(end - start)
        } else {
            index.clamp(start, end - 1)
        };
        Some(index as usize)
    }
}

/// Read `data` at a fractional position, neighbours confined to `window`
///
/// A looping window reads the frames after its end from its start, so a
/// cursor that wraps mid-interpolation stays continuous. A one-shot window
/// holds its edge frame.
pub fn read_in_window(
    data: &[StereoSample],
    position: f64,
    window: ReadWindow,
    method: InterpolationMethod,
) -> StereoSample {
    interpolate(
        |index| match window.resolve(index) {
            Some(i) if i < data.len() => data[i],
            _ => StereoSample::silence(),
        },
        position,
        method,
    )
}

/// Read `data` at a fractional frame position, silence outside the data
pub fn read_interpolated(data: &[StereoSample], position: f64, method: InterpolationMethod) -> StereoSample {
    if data.is_empty() {
        return StereoSample::silence();
    }
    interpolate(
        |index| {
            if index < 0 || index >= data.len() as i64 {
                StereoSample::silence()
            } else {
                data[index as usize]
            }
        },
        position,
        method,
    )
}

#[inline]
fn interpolate(sample_at: impl Fn(i64) -> StereoSample, position: f64, method: InterpolationMethod) -> StereoSample {
    let index = position.floor() as i64;
    let frac = (position - position.floor()) as f32;

    if frac == 0.0 {
        return sample_at(index);
    }

    match method {
        InterpolationMethod::Linear => lerp_sample(sample_at(index), sample_at(index + 1), frac),
        InterpolationMethod::Cubic => cubic_interpolate(
            sample_at(index - 1),
            sample_at(index),
            sample_at(index + 1),
            sample_at(index + 2),
            frac,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<StereoSample> {
        (0..len).map(|i| StereoSample::mono(i as f32)).collect()
    }

    #[test]
    fn test_linear_midpoint() {
        let mid = lerp_sample(StereoSample::mono(0.0), StereoSample::mono(1.0), 0.5);
        assert!((mid.left - 0.5).abs() < 1e-6);
        assert!((mid.right - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_integer_positions_are_exact() {
        let data = ramp(8);
        for method in [InterpolationMethod::Linear, InterpolationMethod::Cubic] {
            assert_eq!(read_interpolated(&data, 3.0, method), StereoSample::mono(3.0));
        }
    }

    #[test]
    fn test_cubic_reproduces_linear_ramp() {
        // Catmull-Rom is exact on straight lines away from the edges
        let data = ramp(16);
        let value = read_interpolated(&data, 5.25, InterpolationMethod::Cubic);
        assert!((value.left - 5.25).abs() < 1e-4, "got {}", value.left);
    }

    #[test]
    fn test_out_of_range_is_silence() {
        let data = ramp(4);
        assert_eq!(read_interpolated(&data, 10.5, InterpolationMethod::Linear), StereoSample::silence());
        assert_eq!(read_interpolated(&[], 0.0, InterpolationMethod::Cubic), StereoSample::silence());
    }

    #[test]
    fn test_looping_window_wraps_neighbours() {
        let data = ramp(20);
        let window = ReadWindow::new(10, 14, true);

        // Between the last window frame and the first one
        let value = read_in_window(&data, 13.5, window, InterpolationMethod::Linear);
        assert!((value.left - 11.5).abs() < 1e-6, "got {}", value.left);

        // Frame 14 belongs to the next section and must not leak in
        let cubic = read_in_window(&data, 12.5, window, InterpolationMethod::Cubic);
        let expected = cubic_interpolate(data[11], data[12], data[13], data[10], 0.5);
        assert_eq!(cubic, expected);
    }

    #[test]
    fn test_one_shot_window_holds_edge() {
        let data = vec![StereoSample::mono(0.5); 8];
        let window = ReadWindow::new(0, 8, false);
        for method in [InterpolationMethod::Linear, InterpolationMethod::Cubic] {
            let value = read_in_window(&data, 7.4, window, method);
            assert!((value.left - 0.5).abs() < 1e-6, "{:?} got {}", method, value.left);
        }
        assert_eq!(
            read_in_window(&data, 3.0, ReadWindow::new(4, 4, false), InterpolationMethod::Linear),
            StereoSample::silence()
        );
    }
}
