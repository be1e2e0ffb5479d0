//! Peak normalization applied to both sides of every correlation.
//!
//! `normalize` produces an owned copy and is used for per-chunk candidates.
//! `NormalizedView` applies the identical scaling lazily, for the shared
//! reference that must not be copied on every chunk.

use crate::analysis::waveform::Waveform;

/// Scale a waveform so its largest absolute sample becomes 1.0.
///
/// An all-zero or empty waveform is returned unchanged, so no division by zero
/// can happen. Pure and deterministic.
pub fn normalize(waveform: &Waveform) -> Waveform {
    let view = NormalizedView::new(waveform);
    Waveform::new((0..view.len()).map(|i| view.sample(i)).collect())
}

/// Divisor both paths apply: the peak magnitude, or 1.0 when the peak is zero.
fn normalization_peak(waveform: &Waveform) -> f32 {
    let peak = waveform.peak();
    if peak > 0.0 {
        peak
    } else {
        1.0
    }
}

/// Peak-normalized, read-only view over a waveform's samples.
///
/// `view.sample(i)` is bit-identical to `normalize(waveform).samples()[i]`.
pub struct NormalizedView<'a> {
    samples: &'a [f32],
    peak: f32,
}

impl<'a> NormalizedView<'a> {
    pub fn new(waveform: &'a Waveform) -> Self {
        Self {
            samples: waveform.samples(),
            peak: normalization_peak(waveform),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn sample(&self, index: usize) -> f32 {
        self.samples[index] / self.peak
    }

    /// Euclidean norm of the normalized samples, accumulated in f64.
    pub fn l2_norm(&self) -> f64 {
        (0..self.len())
            .map(|i| {
                let v = self.sample(i) as f64;
                v * v
            })
            .sum::<f64>()
            .sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_becomes_one() {
        let waveform = Waveform::new(vec![0.1, -0.25, 0.2]);
        let normalized = normalize(&waveform);

        assert!((normalized.peak() - 1.0).abs() < 1e-6);
        assert!((normalized.samples()[1] + 1.0).abs() < 1e-6);
        assert!((normalized.samples()[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_quiet_pcm_is_boosted() {
        let waveform = Waveform::new(vec![0.001; 16]);
        assert!((normalize(&waveform).peak() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_and_empty_unchanged() {
        let zeros = Waveform::new(vec![0.0; 8]);
        assert_eq!(normalize(&zeros), zeros);

        let empty = Waveform::default();
        assert_eq!(normalize(&empty), empty);
        assert_eq!(normalization_peak(&zeros), 1.0);
    }

    #[test]
    fn test_view_matches_owned_normalization() {
        let waveform = Waveform::new(vec![0.3, -0.7, 0.05, 0.699, -0.0001]);
        let owned = normalize(&waveform);
        let view = NormalizedView::new(&waveform);

        assert_eq!(view.len(), owned.len());
        for (i, &expected) in owned.samples().iter().enumerate() {
            assert_eq!(view.sample(i).to_bits(), expected.to_bits());
        }
        assert_eq!(view.l2_norm().to_bits(), owned.l2_norm().to_bits());
    }

    #[test]
    fn test_normalizing_twice_is_identity() {
        let once = normalize(&Waveform::new(vec![0.2, -0.9, 0.45]));
        assert_eq!(normalize(&once), once);
    }
}
