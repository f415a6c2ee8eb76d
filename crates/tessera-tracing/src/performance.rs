//! Timing of primitive creation and pipeline steps.
//!
//! Step timing is off unless [`configure`] enables it, which
//! [`crate::init_global_tracing`] does from the active [`crate::TracingConfig`].
//!
//! ```rust
//! use tessera_tracing::performance::{self, record_scratchpad, PerformanceSpan};
//!
//! performance::configure(true, Some(100));
//! let span = PerformanceSpan::step("ncsp:fwd/compute");
//! // ... run the sub-primitive ...
//! drop(span); // logged only if it took at least 100us
//!
//! record_scratchpad("ncsp:fwd", 4096, 3);
//! # performance::configure(false, None);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(false);
// 0 means no threshold
static THRESHOLD_US: AtomicU64 = AtomicU64::new(0);

/// Turn step timing on or off and set the minimum duration worth logging.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD_US.store(threshold_us.unwrap_or(0), Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn threshold_us() -> Option<u64> {
    match THRESHOLD_US.load(Ordering::Relaxed) {
        0 => None,
        us => Some(us),
    }
}

/// Measures its own lifetime and reports it on drop.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start: Instant,
    span: tracing::Span,
    scope: Option<tracing::span::EnteredSpan>,
}

impl PerformanceSpan {
    /// Span that always reports, subject only to `threshold_us`.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        Self {
            span: tracing::debug_span!("perf", step = %name),
            name,
            threshold_us,
            start: Instant::now(),
            scope: None,
        }
    }

    /// Keep `span` entered for as long as this step runs.
    pub fn scoped(mut self, span: tracing::Span) -> Self {
        self.scope = Some(span.entered());
        self
    }

    /// Span governed by the process-wide settings from [`configure`].
    /// Reports nothing while step timing is disabled.
    pub fn step(name: impl Into<String>) -> Self {
        let mut span = Self::new(name, threshold_us());
        if !is_enabled() {
            span.threshold_us = Some(u64::MAX);
        }
        span
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_some_and(|t| elapsed_us < t) {
            return;
        }
        let _entered = self.span.enter();
        tracing::debug!(step = %self.name, duration_us = elapsed_us, "step_complete");
    }
}

/// Scratchpad requirement computed for a primitive descriptor.
///
/// `entries` counts top-level bookings; `size_bytes` includes nested ones.
pub fn record_scratchpad(primitive: &str, size_bytes: usize, entries: usize) {
    tracing::debug!(primitive, size_bytes, entries, "scratchpad_booked");
}

/// One completed primitive execution of `steps` sub-primitive calls.
pub fn record_execution(primitive: &str, steps: usize, duration_us: u64) {
    tracing::debug!(primitive, steps, duration_us, "primitive_executed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::new("sleep", None);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(span.elapsed_us() >= 2_000);
    }

    #[test]
    #[serial]
    fn step_follows_global_settings() {
        configure(true, Some(250));
        assert!(is_enabled());
        assert_eq!(PerformanceSpan::step("compute").threshold_us, Some(250));

        configure(false, None);
        assert_eq!(threshold_us(), None);
        assert_eq!(PerformanceSpan::step("compute").threshold_us, Some(u64::MAX));
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_scratchpad("ncsp:fwd", 2048, 4);
        record_execution("ncsp:fwd", 4, 12);
    }
}
