//! Compiler configuration.

/// Default separator between namespace and class name in table names.
pub const DEFAULT_NAMESPACE_SEPARATOR: &str = "_";

/// Default separator between key values in composite item ids.
pub const DEFAULT_KEY_SEPARATOR: &str = "@";

/// Default number of reference hops followed by free-text search.
pub const DEFAULT_SEARCH_DEPTH: usize = 1;

/// Default suffix of join size probes.
pub const DEFAULT_SIZE_SUFFIX: &str = "_size";

/// Default name of the total-count output field.
pub const DEFAULT_COUNT_FIELD: &str = "total";

/// Query compiler configuration.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Separator between namespace and class name in table names.
    pub namespace_separator: String,

    /// Separator between key values in composite item ids.
    pub key_separator: String,

    /// Reference hops followed by free-text search when the request sets none.
    pub search_depth: usize,

    /// Whether free-text search adds a whole-document full-text clause.
    pub full_text: bool,

    /// Suffix appended to a join alias to name its size probe.
    pub size_suffix: String,

    /// Output field of the total-count pipeline.
    pub count_field: String,
}

impl CompilerConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self {
            namespace_separator: DEFAULT_NAMESPACE_SEPARATOR.to_string(),
            key_separator: DEFAULT_KEY_SEPARATOR.to_string(),
            search_depth: DEFAULT_SEARCH_DEPTH,
            full_text: true,
            size_suffix: DEFAULT_SIZE_SUFFIX.to_string(),
            count_field: DEFAULT_COUNT_FIELD.to_string(),
        }
    }

    /// Set the namespace separator.
    pub fn with_namespace_separator(mut self, separator: impl Into<String>) -> Self {
        self.namespace_separator = separator.into();
        self
    }

    /// Set the composite key separator.
    pub fn with_key_separator(mut self, separator: impl Into<String>) -> Self {
        self.key_separator = separator.into();
        self
    }

    /// Set the default free-text search depth.
    pub fn with_search_depth(mut self, depth: usize) -> Self {
        self.search_depth = depth;
        self
    }

    /// Enable or disable the full-text clause of free-text search.
    pub fn with_full_text(mut self, enabled: bool) -> Self {
        self.full_text = enabled;
        self
    }

    /// Set the size probe suffix.
    pub fn with_size_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.size_suffix = suffix.into();
        self
    }

    /// Set the total-count output field.
    pub fn with_count_field(mut self, field: impl Into<String>) -> Self {
        self.count_field = field.into();
        self
    }
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self::new()
    }
}
