//! # zonesync testkit
//!
//! Test utilities for zonesync.
//!
//! This crate provides:
//! - A Group/Item schema and devices that share one in-memory remote zone
//! - Temporary journal locations for persistence tests
//! - Property-based generators for mutation sequences across devices
//! - A harness that syncs devices until quiescent and compares their state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zonesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn two_devices_agree() {
//!     let cloud = SharedCloud::new();
//!     let phone = cloud.device("phone");
//!     let laptop = cloud.device("laptop");
//!     phone.setup().await;
//!     laptop.setup().await;
//!
//!     phone.create_group("Inbox");
//!     assert_converged(&cloud, &[&phone, &laptop]).await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
