use serde::{Deserialize, Serialize};

use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{GbpError, Result};

/// Default work collector used for crash cleanup when the caller supplies none.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Run cleanup inside `open`, before it returns.
    #[default]
    Immediate,
    /// Run cleanup on a dedicated thread.
    Background,
    /// Queue cleanup until the caller runs it.
    Deferred,
}

/// Configuration knobs for a tree handle.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GbpTreeOptions {
    /// Page size in bytes; a power of two.
    pub page_size: u32,
    /// Optional cap on entries per node, mostly for exercising deep trees.
    pub max_key_count: Option<usize>,
    /// Open without advancing generations; all mutations fail.
    pub read_only: bool,
    /// Create an empty tree when the file is empty or missing.
    pub create_if_missing: bool,
    /// Collector used for crash cleanup by [`super::GbpTree::open`].
    pub cleanup: CleanupMode,
    /// Emit statistics through tracing after every checkpoint.
    pub emit_stats_on_checkpoint: bool,
}

impl Default for GbpTreeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_key_count: None,
            read_only: false,
            create_if_missing: true,
            cleanup: CleanupMode::Immediate,
            emit_stats_on_checkpoint: false,
        }
    }
}

impl GbpTreeOptions {
    /// Parses options from TOML, filling omitted fields with defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let options: Self =
            toml::from_str(input).map_err(|err| GbpError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Rejects values the tree cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            return Err(GbpError::Invariant("page size must be a power of two"));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(GbpError::Config(format!(
                "page size {} outside [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]",
                self.page_size
            )));
        }
        if matches!(self.max_key_count, Some(max) if max < 2) {
            return Err(GbpError::Config(
                "max_key_count must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns a copy with a different page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Returns a copy capped at `max` entries per node.
    pub fn with_max_key_count(mut self, max: usize) -> Self {
        self.max_key_count = Some(max);
        self
    }

    /// Returns a copy using the given cleanup mode.
    pub fn with_cleanup(mut self, cleanup: CleanupMode) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Returns a read-only copy.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}
