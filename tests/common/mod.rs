//! Common utilities for integration tests
//!
//! All integration suites run against a live Redis named by `REDIS_URL`
//! (default `redis://127.0.0.1:6379`). Keys are uniquified per test so suites
//! can run concurrently against one server.

#![allow(dead_code)] // each integration binary uses a different subset

use redis::aio::ConnectionManager;

/// Get Redis URL from environment or use default
pub fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Opt-in test logging, driven by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Open a connection manager against the test server
pub async fn connection() -> ConnectionManager {
    init_tracing();
    let client = redis::Client::open(redis_url())
        .unwrap_or_else(|_| panic!("Failed to create Redis client"));
    ConnectionManager::new(client)
        .await
        .unwrap_or_else(|_| panic!("Failed to connect to Redis (is it running?)"))
}

/// Create a test key with unique suffix to avoid conflicts between tests
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Remove keys left behind by a test
pub async fn cleanup_keys(keys: &[String]) {
    let mut conn = connection().await;
    for key in keys {
        let _: Result<(), _> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
    }
}

/// Generate test data of various types
pub mod test_data {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Payload {
        pub value: String,
    }

    impl Payload {
        pub fn new(value: impl Into<String>) -> Self {
            Self {
                value: value.into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("lock");
        let key2 = test_key("lock");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("test_lock_"));
    }
}
