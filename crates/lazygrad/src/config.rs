//! Per-thread engine configuration.

use std::cell::Cell;

/// Switches read by the graph engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    /// Scan every forward output for NaN and fail with `NanDetected`.
    pub check_nan: bool,
    /// Evaluate operations whose inputs are all constants immediately,
    /// producing a constant leaf instead of a graph node.
    pub eager_constants: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            check_nan: cfg!(debug_assertions),
            eager_constants: true,
        }
    }
}

thread_local! {
    static CONFIG: Cell<GraphConfig> = Cell::new(GraphConfig::default());
}

/// Configuration active on this thread.
pub fn config() -> GraphConfig {
    CONFIG.with(Cell::get)
}

/// Replace the configuration of this thread, returning the previous one.
pub fn set_config(config: GraphConfig) -> GraphConfig {
    CONFIG.with(|c| c.replace(config))
}

/// Run `f` with `config` active, restoring the previous configuration after.
///
/// # Example
///
/// ```
/// use lazygrad::config::{GraphConfig, config, with_config};
///
/// let relaxed = GraphConfig { check_nan: false, ..config() };
/// with_config(relaxed, || assert!(!config().check_nan));
/// ```
pub fn with_config<R>(config: GraphConfig, f: impl FnOnce() -> R) -> R {
    struct Restore(GraphConfig);
    impl Drop for Restore {
        fn drop(&mut self) {
            set_config(self.0);
        }
    }
    let _restore = Restore(set_config(config));
    f()
}
