/// Exponentially growing delays with positive jitter.
pub mod exponential;

/// Constant delays.
pub mod fixed;
