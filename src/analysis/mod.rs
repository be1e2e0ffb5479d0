//! # Correlation Analysis
//!
//! Measures how closely each sensor chunk matches the fixed reference signal.
//!
//! ## Key Components:
//! - **waveform**: Floating-point sample container
//! - **normalize**: Peak normalization (Signal Normalizer)
//! - **correlation**: Cross-correlation, lag and coefficient (Correlation Engine)
//! - **orchestrator**: Decode → correlate → package, one chunk at a time

pub mod correlation;
pub mod normalize;
pub mod orchestrator;
pub mod waveform;
