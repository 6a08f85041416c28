use std::env;

/// Broker and queue configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: String,
    pub request_queue: String,
    pub response_queue: String,
    pub request_prefetch: usize,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            redis_url: lookup("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            request_queue: lookup("REQUEST_QUEUE")
                .unwrap_or_else(|| "code-execution-request".to_string()),
            response_queue: lookup("RESPONSE_QUEUE")
                .unwrap_or_else(|| "code-execution-response".to_string()),
            request_prefetch: lookup("REQUEST_PREFETCH")
                .and_then(|v| v.parse().ok())
                .filter(|prefetch| *prefetch > 0)
                .unwrap_or(1),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
