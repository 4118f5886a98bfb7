//! Runtime tunables for the streaming core.

/// Configuration for the streaming and caching subsystems.
///
/// All fields can be retuned at runtime through the owning subsystem's
/// setters; a change is a single fully-applied state transition and never
/// partially observed by in-flight operations.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Global cap on concurrently executing fetch operations.
    pub concurrency: usize,
    /// Fraction of capacity nominally reserved for high-priority work.
    ///
    /// Clamped to `0.05..=0.95`; the remainder is the guaranteed floor for
    /// low-priority throughput under a permanent high-priority backlog.
    pub high_share: f64,
    /// Byte budget for the uploaded-resource LRU cache.
    pub mesh_budget_bytes: usize,
    /// Namespace version for the durable byte cache. Bumping this string
    /// invalidates all previously cached bytes.
    pub cache_version: String,
    /// Emit a debug log line for every mesh-cache eviction.
    pub log_evictions: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            concurrency: 6,
            high_share: 0.7,
            mesh_budget_bytes: 256 * 1024 * 1024,
            cache_version: "v1".to_string(),
            log_evictions: false,
        }
    }
}

impl StreamingConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global concurrency cap (minimum 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the high-priority capacity share, clamped to `0.05..=0.95`.
    #[must_use]
    pub fn with_high_share(mut self, high_share: f64) -> Self {
        self.high_share = clamp_share(high_share);
        self
    }

    /// Set the mesh-cache byte budget.
    #[must_use]
    pub fn with_mesh_budget_bytes(mut self, bytes: usize) -> Self {
        self.mesh_budget_bytes = bytes;
        self
    }

    /// Set the durable-cache namespace version.
    #[must_use]
    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    /// Toggle eviction debug logging.
    #[must_use]
    pub fn with_log_evictions(mut self, enabled: bool) -> Self {
        self.log_evictions = enabled;
        self
    }
}

/// Clamp a capacity share to the supported range.
pub(crate) fn clamp_share(share: f64) -> f64 {
    share.clamp(0.05, 0.95)
}
