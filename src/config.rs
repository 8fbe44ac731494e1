//! Compiler configuration

use std::env;
use std::str::FromStr;

/// Default split threshold for method weight
pub const DEFAULT_SPLIT_THRESHOLD: u64 = 32 * 1024;

/// Largest program point id that fits the call site flag encoding
pub const MAX_PROGRAM_POINT_VALUE: u32 = (1 << 21) - 1;

/// Configuration for one compiler instance
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConfig {
    /// Weight at which a compile unit is full and a function body splits
    pub split_threshold: u64,
    /// Largest program point id a function may use
    pub max_program_point: u32,
    /// Emit speculative narrow-typed operations
    pub optimistic_types: bool,
    /// Calls of one scope name before they go through a shared helper
    pub shared_scope_call_threshold: u32,
    /// Reads of one scope name before they go through a shared helper
    pub shared_scope_get_threshold: u32,
    /// Name prefix of compile units
    pub unit_prefix: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_program_point: MAX_PROGRAM_POINT_VALUE,
            optimistic_types: true,
            shared_scope_call_threshold: 4,
            shared_scope_get_threshold: 200,
            unit_prefix: "Script".to_string(),
        }
    }
}

impl CompilerConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `QUENCH_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_value("QUENCH_SPLIT_THRESHOLD") {
            config.split_threshold = v;
        }
        if let Some(v) = env_value("QUENCH_MAX_PROGRAM_POINT") {
            config.max_program_point = v;
        }
        if let Some(v) = env_value("QUENCH_OPTIMISTIC_TYPES") {
            config.optimistic_types = v;
        }
        config
    }

    pub fn with_split_threshold(mut self, threshold: u64) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn with_max_program_point(mut self, max: u32) -> Self {
        self.max_program_point = max;
        self
    }

    pub fn with_optimistic_types(mut self, enabled: bool) -> Self {
        self.optimistic_types = enabled;
        self
    }

    pub fn with_shared_scope_thresholds(mut self, calls: u32, gets: u32) -> Self {
        self.shared_scope_call_threshold = calls;
        self.shared_scope_get_threshold = gets;
        self
    }

    pub fn with_unit_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.unit_prefix = prefix.into();
        self
    }
}

fn env_value<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable configuration override");
            None
        }
    }
}
