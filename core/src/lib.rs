//! # Marksign Core
//!
//! Domain types and seams for tracking the lifecycle of product-marking codes
//! ("signs").
//!
//! ## Core Concepts
//!
//! - **Sign**: a unique marking code plus a pointer to its current event
//! - **SignEvent**: an immutable version of the sign's state; every status
//!   change appends one and repoints the sign
//! - **Status machine**: a closed [`SignStatus`](status::SignStatus) enum with
//!   a fixed legal-transition table
//! - **Planner**: the pure function [`transition::plan`] that turns a command
//!   into a validated [`Transition`](transition::Transition)
//! - **Seams**: [`SignStore`](store::SignStore), [`DedupStore`](dedup::DedupStore),
//!   [`MessageBus`](bus::MessageBus), [`DeadLetterSink`](dead_letter::DeadLetterSink)
//!
//! ## Architecture Principles
//!
//! - Functional core (this crate, no I/O), imperative shell (`marksign-runtime`)
//! - Optimistic concurrency on the current-event pointer
//! - At-least-once messaging with idempotent handlers
//!
//! ## Example
//!
//! ```
//! use chrono::Utc;
//! use marksign_core::ids::*;
//! use marksign_core::sign::{ProductKey, SignInvariable, SignRegistration};
//! use marksign_core::status::SignStatus;
//! use marksign_core::transition::{admit, plan, SignCommand};
//!
//! let registration = SignRegistration {
//!     code: "(01)04600000000000(21)ABC123".to_string(),
//!     invariable: SignInvariable::new(
//!         UserId::new(),
//!         ProfileId::new(),
//!         ProductKey::new(ProductId::new()),
//!     ),
//!     comment: None,
//! };
//! let (_sign, event) = admit(registration, SignId::new(), SignEventId::new(), Utc::now()).unwrap();
//!
//! let command = SignCommand::process(OrderId::new(), ProductItemId::new(), PartId::new());
//! let transition = plan(&event, command, SignEventId::new(), Utc::now()).unwrap();
//! assert_eq!(transition.event.status, SignStatus::Process);
//! assert_eq!(transition.expected, event.id);
//! ```

pub mod bus;
pub mod dead_letter;
pub mod dedup;
pub mod error;
pub mod gs1;
pub mod ids;
pub mod message;
pub mod sign;
pub mod status;
pub mod store;
pub mod transition;

pub use chrono::{DateTime, Utc};
pub use error::{SignError, StoreError};
pub use status::SignStatus;

/// Environment traits.
///
/// External dependencies the shell needs to be deterministic under test.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use marksign_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
