//! Shared test utilities for the stream crates
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: deterministic stream, group and payload names (always available)
//!
//! # Redis Testing
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_stream_test() {
//!     let redis = TestRedis::new().await;
//!     let data = TestDataBuilder::from_test_name("my_stream_test");
//!
//!     let stream = data.stream_key("requests");
//!     let group = data.group_name("workers");
//!     // connect to redis.connection_string() ...
//! }
//! ```

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic names
///
/// Tests sharing one Redis instance stay isolated by deriving their keys from
/// the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_steal_idle_entries");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    /// Generate a unique name for testing
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.name("stream", "main"), "test-stream-7-main");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }

    /// Stream key, e.g. `test:7:requests`
    pub fn stream_key(&self, suffix: &str) -> String {
        format!("test:{}:{}", self.seed, suffix)
    }

    /// Consumer group name
    pub fn group_name(&self, suffix: &str) -> String {
        self.name("group", suffix)
    }

    /// JSON payloads `{"seq": 0}`, `{"seq": 1}`, ...
    pub fn payloads(&self, count: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| format!("{{\"seed\":{},\"seq\":{}}}", self.seed, i).into_bytes())
            .collect()
    }
}
