//! Compile-time gated debug logging for hot runtime paths.

/// Emit frame-walk and word-level traces only when the `fiber_debug_logs`
/// Cargo feature is enabled.
///
/// With the feature disabled (default), this macro compiles to a no-op while
/// still type-checking format arguments. Enabled, it forwards to
/// `log::trace!`.
#[macro_export]
macro_rules! fiber_debug_log {
    ($($arg:tt)*) => {{
        #[cfg(feature = "fiber_debug_logs")]
        {
            log::trace!($($arg)*);
        }
        #[cfg(not(feature = "fiber_debug_logs"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
