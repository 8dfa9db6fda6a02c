//! E2E test harness for plandoc.
//!
//! This module contains test infrastructure with builders and assertion
//! variants that not every scenario uses.

#![allow(dead_code)]

pub mod assertions;
pub mod runner;
pub mod steps;
pub mod workspace;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

// Re-export commonly used types
pub use assertions::{Assertion, ErrorMatch};
pub use scenario::Scenario;

/// Installs a test-writer subscriber once; `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
