//! # gardien-store
//!
//! Sealed Storage for the Gardien trust core: a single SQLite database
//! holding pickled Olm accounts and sessions, the outbound/inbound P2P
//! message queues, and an opaque blob store with optimistic-concurrency
//! writes. The whole database can be exported as a byte snapshot for
//! encrypted persistence and backup restore.
//!
//! The crate exposes a synchronous [`Database`] handle; serialization of
//! concurrent callers is the job of the engine layer, which owns exactly
//! one handle.

pub mod database;
pub mod inbound;
pub mod kv;
pub mod migrations;
pub mod models;
pub mod olm;
pub mod outbound;
pub mod snapshot;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
