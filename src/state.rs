//! The process-wide singletons: created once in `main`, shared into
//! every connection task as cloned handles — never as hidden mutable
//! globals.

use std::sync::Arc;

use crate::cache::Cache;
use crate::config::Config;
use crate::observer::Metrics;
use crate::policy::Policy;

#[derive(Clone)]
pub struct AppState {
    pub policy: Arc<Policy>,
    pub cache: Arc<Cache>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            policy: Arc::new(Policy::load(&config.blocklist_path)),
            cache: Arc::new(Cache::new(
                config.max_entries,
                config.max_size_bytes,
                config.default_ttl_secs,
            )),
            metrics: Arc::new(Metrics::new()),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            policy: Arc::new(Policy::load("/nonexistent/blocklist.txt")),
            cache: Arc::new(Cache::new(
                crate::config::DEFAULT_MAX_ENTRIES,
                crate::config::DEFAULT_MAX_SIZE_BYTES,
                crate::config::DEFAULT_TTL_SECS,
            )),
            metrics: Arc::new(Metrics::new()),
        }
    }
}
