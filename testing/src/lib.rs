//! # Marksign Testing
//!
//! Testing utilities for the marksign workspace.
//!
//! This crate provides:
//! - A fixed clock
//! - In-memory implementations of every storage and transport seam
//! - A latency-injecting sign store for concurrency tests
//! - Fixtures for users, products and codes
//! - proptest strategies for GS1 marking codes
//!
//! ## Example
//!
//! ```
//! use marksign_testing::{InMemorySignStore, Tenant, test_clock};
//!
//! let store = InMemorySignStore::new();
//! let tenant = Tenant::new();
//! let registration = tenant.registration("(01)04600000000000(21)ABC123");
//! assert!(store.is_empty());
//! # let _ = (registration, test_clock());
//! ```

pub mod bus_mocks;
pub mod fixtures;
pub mod latency;
pub mod store_mocks;

use chrono::{DateTime, Utc};
use marksign_core::environment::Clock;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use marksign_testing::mocks::FixedClock;
    /// use marksign_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers.
pub mod helpers {
    /// Install a test-writer tracing subscriber honouring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// proptest strategies for GS1 marking codes.
pub mod properties {
    use proptest::prelude::*;

    /// 14-digit GTIN.
    pub fn gtin() -> impl Strategy<Value = String> {
        "[0-9]{14}"
    }

    /// Serial: 1..=20 characters, alphanumeric plus a few GS1 punctuation marks.
    pub fn serial() -> impl Strategy<Value = String> {
        "[A-Za-z0-9!%&*+,./:;<=>?_-]{1,20}"
    }

    /// Verification key id (AI 91).
    pub fn verification_key() -> impl Strategy<Value = String> {
        "[A-Za-z0-9]{1,4}"
    }

    /// Verification code (AI 92), base64-like.
    pub fn verification_code() -> impl Strategy<Value = String> {
        "[A-Za-z0-9+/=]{1,88}"
    }

    /// Bracketed code with mandatory fields and optional crypto fields.
    pub fn bracketed_code() -> impl Strategy<Value = String> {
        (
            gtin(),
            serial(),
            proptest::option::of(verification_key()),
            proptest::option::of(verification_code()),
        )
            .prop_map(|(gtin, serial, key, code)| {
                let mut out = format!("(01){gtin}(21){serial}");
                if let Some(key) = key {
                    out.push_str(&format!("(91){key}"));
                }
                if let Some(code) = code {
                    out.push_str(&format!("(92){code}"));
                }
                out
            })
    }
}

// Re-export commonly used items
pub use bus_mocks::{Dispatched, InMemoryMessageBus};
pub use fixtures::{Tenant, numbered_code, SCENARIO_CODE};
pub use latency::LatencySignStore;
pub use mocks::{FixedClock, test_clock};
pub use store_mocks::{InMemoryDedupStore, InMemorySignStore};
