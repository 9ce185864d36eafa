//! # zonesync records
//!
//! Data types exchanged between the sync engine and a remote record store.
//!
//! This crate provides:
//! - [`RemoteRecord`] with scalar fields and single-valued references
//! - [`ChangeCursor`] and [`ChangeBatch`] for the incremental change feed
//! - [`ModifyOutcome`] and [`RecordFailure`] for batch saves and deletes
//! - [`Freshness`] for last-writer-wins decisions
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod freshness;
mod modify;
mod record;
mod value;

pub use change::{ChangeBatch, ChangeCursor};
pub use error::{RecordError, RecordResult};
pub use freshness::Freshness;
pub use modify::{FailureKind, ModifyOutcome, RecordFailure, SavePolicy};
pub use record::{RecordId, RemoteRecord, ZoneId};
pub use value::{FieldKind, FieldValue};
