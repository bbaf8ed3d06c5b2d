//! Probability distributions built on the operation catalog.
//!
//! Sampling and density evaluation only use public tensor operations, so a distribution
//! behaves the same inside a compiled region as it does eagerly.

mod uniform;

pub use uniform::Uniform;

/// Value reported by `log_prob` in place of `log(0)` outside a distribution's support.
pub const LOG_ZERO_VALUE: f64 = -1e7;
