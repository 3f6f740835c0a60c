//! Validated numeric domain types shared across the engine.
//!
//! These wrappers keep configuration numbers inside sane ranges at
//! construction time instead of spreading range checks through the
//! pipelines.

use nutype::nutype;

/// Number of queue workers attached by `start_queue`.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 256),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4
)]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// Gets the value as usize.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }

    /// One worker per available CPU, clamped into the valid range.
    #[must_use]
    pub fn per_cpu() -> Self {
        Self::try_new(num_cpus::get().clamp(1, 256)).unwrap_or_default()
    }
}

/// Maximum delivery attempts before a task is handed to the
/// permanent-failure handler.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct MaxAttempts(u32);

impl MaxAttempts {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Multiplier applied to the retry delay after each failed attempt.
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 10.0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2.0
)]
pub struct BackoffFactor(f64);

impl BackoffFactor {
    /// Gets the value as f64.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}
