//! # Correlation Engine
//!
//! Measures how closely a candidate waveform matches the reference waveform.
//!
//! ## Algorithm:
//! 1. **Normalize** both inputs by their own peak (see `normalize`)
//! 2. **Full cross-correlation** `c` of length `N + M - 1`:
//!    `c[k] = Σ_i candidate[i] * reference[i - k + M - 1]`, zero outside the inputs
//! 3. **Best alignment** `idx_max` = index of the largest `|c[k]|`; the first
//!    occurrence wins on ties
//! 4. **Lag** = `idx_max - (M - 1)`; positive means the candidate is delayed
//!    relative to the reference, negative means it is advanced
//! 5. **Coefficient** = `c[idx_max] / (‖candidate‖ · ‖reference‖)` over the
//!    normalized inputs, or 0.0 when either norm is zero
//!
//! ## Cost:
//! The direct sum is O(N·M). Above `DIRECT_WORK_LIMIT` multiply-adds the same
//! sequence is computed as an FFT convolution, O((N+M) log(N+M)). Both produce
//! the same values up to floating-point rounding.
//!
//! The candidate is normalized into its own per-chunk copy. The reference is
//! only read through a `NormalizedView`, so the shared signal is never copied
//! or mutated while correlating.

use crate::analysis::normalize::{normalize, NormalizedView};
use crate::analysis::waveform::Waveform;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::Serialize;

/// Largest `N·M` still computed by direct summation.
const DIRECT_WORK_LIMIT: usize = 1 << 22;

/// Outcome of correlating one candidate against the reference. Immutable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CorrelationResult {
    /// Similarity at the best lag; in [-1, 1] in theory, not clamped
    pub coefficient: f64,

    /// Sample offset of the best alignment
    pub lag: i64,
}

/// Correlate `candidate` against `reference`.
///
/// An empty input on either side has no alignment to report and yields
/// `{ coefficient: 0.0, lag: 0 }`.
pub fn correlate(candidate: &Waveform, reference: &Waveform) -> CorrelationResult {
    if candidate.is_empty() || reference.is_empty() {
        return CorrelationResult { coefficient: 0.0, lag: 0 };
    }

    let a = normalize(candidate);
    let b = NormalizedView::new(reference);

    let sequence = if a.len().saturating_mul(b.len()) <= DIRECT_WORK_LIMIT {
        full_correlation_direct(a.samples(), &b)
    } else {
        full_correlation_fft(a.samples(), &b)
    };

    let idx_max = argmax_abs(&sequence);
    let lag = idx_max as i64 - (b.len() as i64 - 1);

    let denominator = a.l2_norm() * b.l2_norm();
    let coefficient = if denominator == 0.0 {
        0.0
    } else {
        sequence[idx_max] / denominator
    };

    CorrelationResult { coefficient, lag }
}

/// Index of the largest magnitude. Strict comparison keeps the first of equal peaks.
fn argmax_abs(sequence: &[f64]) -> usize {
    let mut best_index = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (index, value) in sequence.iter().enumerate() {
        let magnitude = value.abs();
        if magnitude > best_value {
            best_value = magnitude;
            best_index = index;
        }
    }
    best_index
}

fn full_correlation_direct(a: &[f32], b: &NormalizedView) -> Vec<f64> {
    let (n, m) = (a.len(), b.len());
    let mut out = vec![0.0f64; n + m - 1];

    for (k, slot) in out.iter_mut().enumerate() {
        // i ranges over candidate indices whose reference partner i + m - 1 - k is in bounds
        let start = (k + 1).saturating_sub(m);
        let end = n.min(k + 1);
        let mut acc = 0.0;
        for i in start..end {
            acc += a[i] as f64 * b.sample(i + m - 1 - k) as f64;
        }
        *slot = acc;
    }

    out
}

/// Full correlation as the linear convolution of the candidate with the
/// time-reversed reference, zero-padded to a power of two.
fn full_correlation_fft(a: &[f32], b: &NormalizedView) -> Vec<f64> {
    let (n, m) = (a.len(), b.len());
    let len = n + m - 1;
    let size = len.next_power_of_two();

    let mut spectrum_a: Vec<Complex<f64>> = (0..size)
        .map(|i| Complex::new(if i < n { a[i] as f64 } else { 0.0 }, 0.0))
        .collect();
    let mut spectrum_b: Vec<Complex<f64>> = (0..size)
        .map(|i| Complex::new(if i < m { b.sample(m - 1 - i) as f64 } else { 0.0 }, 0.0))
        .collect();

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(size);
    forward.process(&mut spectrum_a);
    forward.process(&mut spectrum_b);

    for (x, y) in spectrum_a.iter_mut().zip(spectrum_b.iter()) {
        *x = *x * *y;
    }

    planner.plan_fft_inverse(size).process(&mut spectrum_a);

    // rustfft does not normalize the inverse transform
    let scale = size as f64;
    spectrum_a[..len].iter().map(|c| c.re / scale).collect()
}
