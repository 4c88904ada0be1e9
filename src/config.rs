//! Configuration options for the h5nav navigation engine.

use serde::{Deserialize, Serialize};

/// Configuration options for opening a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Maximum number of decoded structures kept in the decode cache.
    /// Set to 0 to disable caching.
    /// Default: 1024
    pub cache_capacity: usize,

    /// Verify lookup3 checksums on metadata structures that carry one.
    /// Default: true
    pub verify_checksums: bool,

    /// Maximum number of chunks (first chunk plus continuations) one object
    /// header may span before decoding is aborted as corrupt.
    /// Default: 4096
    pub max_continuation_chunks: usize,

    /// Maximum nesting of shared-message resolution through other object
    /// headers.
    /// Default: 16
    pub max_shared_depth: usize,

    /// Fail on every unknown message type, not only on those flagged
    /// fail-on-unknown.
    /// Default: false
    pub strict_unknown_messages: bool,

    /// Highest file offset at which the superblock signature is searched.
    /// Default: 64KB
    pub superblock_search_limit: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            verify_checksums: true,
            max_continuation_chunks: 4096,
            max_shared_depth: 16,
            strict_unknown_messages: false,
            superblock_search_limit: 64 * 1024, // 64KB
        }
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from a JSON document; missing fields keep defaults.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let options: Options = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the decode cache capacity.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Enables or disables metadata checksum verification.
    pub fn verify_checksums(mut self, value: bool) -> Self {
        self.verify_checksums = value;
        self
    }

    /// Sets the maximum number of chunks per object header.
    pub fn max_continuation_chunks(mut self, value: usize) -> Self {
        self.max_continuation_chunks = value;
        self
    }

    /// Sets the maximum shared-message resolution depth.
    pub fn max_shared_depth(mut self, value: usize) -> Self {
        self.max_shared_depth = value;
        self
    }

    /// Enables or disables strict handling of unknown message types.
    pub fn strict_unknown_messages(mut self, value: bool) -> Self {
        self.strict_unknown_messages = value;
        self
    }

    /// Sets the superblock signature search limit.
    pub fn superblock_search_limit(mut self, value: u64) -> Self {
        self.superblock_search_limit = value;
        self
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_continuation_chunks == 0 {
            return Err(crate::Error::invalid_argument("max_continuation_chunks must be > 0"));
        }
        if self.max_shared_depth == 0 {
            return Err(crate::Error::invalid_argument("max_shared_depth must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.cache_capacity, 1024);
        assert!(opts.verify_checksums);
        assert!(!opts.strict_unknown_messages);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let opts = Options::new()
            .cache_capacity(0)
            .verify_checksums(false)
            .max_shared_depth(4)
            .strict_unknown_messages(true);

        assert_eq!(opts.cache_capacity, 0);
        assert!(!opts.verify_checksums);
        assert_eq!(opts.max_shared_depth, 4);
        assert!(opts.strict_unknown_messages);
    }

    #[test]
    fn test_validation() {
        let opts = Options::default().max_continuation_chunks(0);
        assert!(opts.validate().is_err());

        let opts = Options::default().max_shared_depth(0);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let opts = Options::from_json(r#"{"cache_capacity": 16, "verify_checksums": false}"#)
            .unwrap();
        assert_eq!(opts.cache_capacity, 16);
        assert!(!opts.verify_checksums);
        assert_eq!(opts.max_shared_depth, Options::default().max_shared_depth);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(Options::from_json(r#"{"max_shared_depth": 0}"#).is_err());
        assert!(Options::from_json("not json").is_err());
    }
}
