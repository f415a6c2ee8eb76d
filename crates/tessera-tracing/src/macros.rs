//! Macros for timing pipeline steps.
//!
//! They expand to `$crate` paths, so callers only need a dependency on
//! `tessera-tracing`.

#[doc(hidden)]
pub use tracing as __tracing;

/// Time the enclosing scope as one pipeline step.
///
/// With fields, the step also opens a debug span carrying them, so events
/// emitted by the step (reorders, nested kernels) are attributed to it.
///
/// ```rust
/// use tessera_tracing::perf_span;
///
/// {
///     let _span = perf_span!("src_reorder", composite = "ncsp:fwd");
///     // ... step ...
/// } // duration reported here when step timing is enabled
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {
        $crate::performance::PerformanceSpan::step($name)
    };
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::performance::PerformanceSpan::step($name)
            .scoped($crate::macros::__tracing::debug_span!("step", name = $name, $($field = $value),+))
    };
}

/// Debug event tagged with a step or decision name.
///
/// ```rust
/// use tessera_tracing::perf_event;
///
/// perf_event!("negotiated", candidates = 3, selected = "ref:nspc_conv");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::macros::__tracing::debug!(event = $name, $($field = $value),+)
    };
}
