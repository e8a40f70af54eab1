//! Configuration for docshard stores
//!
//! This module provides the configuration system for document stores,
//! including parameter validation and builder pattern implementation.
//! One `StoreConfig` covers an unsharded store, the sharded store, and
//! the offline index builder (which shares the token bounds).

use crate::error::DocshardError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of candidates matched per exhaustive-scan page
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 10_000;

/// Default minimum length for a search-index token
pub const DEFAULT_MIN_TOKEN_LEN: usize = 3;

/// Default maximum length for a search-index token
pub const DEFAULT_MAX_TOKEN_LEN: usize = 40;

/// Configuration for a document store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the store's files (or all shard files)
    pub directory_path: PathBuf,
    /// File name of an unsharded store's document array
    pub store_name: String,
    /// Turn access-guard violations into errors instead of warnings
    pub strict_guard: bool,
    /// Candidates examined per page of an exhaustive scan before yielding
    pub scan_page_size: usize,
    /// Minimum token length retained by the search-index builder
    pub min_token_len: usize,
    /// Maximum token length retained by the search-index builder
    pub max_token_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory_path: PathBuf::from("./docshard"),
            store_name: "store".to_string(),
            strict_guard: false,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            min_token_len: DEFAULT_MIN_TOKEN_LEN,
            max_token_len: DEFAULT_MAX_TOKEN_LEN,
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory path for store files
    pub fn directory_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory_path = path.into();
        self
    }

    /// Set the file name of an unsharded store
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Enable or disable strict guard mode
    pub fn strict_guard(mut self, strict: bool) -> Self {
        self.strict_guard = strict;
        self
    }

    /// Set the exhaustive-scan page size
    pub fn scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    /// Set the minimum search token length
    pub fn min_token_len(mut self, len: usize) -> Self {
        self.min_token_len = len;
        self
    }

    /// Set the maximum search token length
    pub fn max_token_len(mut self, len: usize) -> Self {
        self.max_token_len = len;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), DocshardError> {
        if self.store_name.is_empty() {
            return Err(DocshardError::config_error(
                "store_name",
                "must not be empty",
            ));
        }
        if self.store_name.contains(std::path::is_separator) {
            return Err(DocshardError::config_error(
                "store_name",
                "must be a bare file name, not a path",
            ));
        }
        if self.scan_page_size == 0 {
            return Err(DocshardError::config_error(
                "scan_page_size",
                "must be greater than 0",
            ));
        }
        if self.min_token_len == 0 {
            return Err(DocshardError::config_error(
                "min_token_len",
                "must be greater than 0",
            ));
        }
        if self.min_token_len > self.max_token_len {
            return Err(DocshardError::config_error(
                "min_token_len",
                format!(
                    "value {} cannot exceed max_token_len ({})",
                    self.min_token_len, self.max_token_len
                ),
            ));
        }
        Ok(())
    }

    /// Validate and return the configuration, builder-style
    pub fn build(self) -> Result<Self, DocshardError> {
        self.validate()?;
        Ok(self)
    }
}
