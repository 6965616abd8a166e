//! ciao-datastore — tenant, network pool, workload and storage state for
//! the Ciao controller.
//!
//! # Architecture
//!
//! Two tiers:
//!
//! - [`DurableStore`], backed by [redb](https://docs.rs/redb), is the source
//!   of truth. Domain types are JSON-serialized into `&[u8]` value columns.
//! - One repository per entity domain ([`repo`]) caches that domain in
//!   memory behind its own `RwLock`. Mutations write through to the durable
//!   tier first and touch the cache only once the write has succeeded.
//!
//! [`Datastore`] ties the repositories together and implements the
//! operations that span several domains.

pub mod datastore;
pub mod error;
pub mod network;
pub mod repo;
pub mod store;
pub mod tables;
pub mod types;

pub use datastore::{CnciWorkloadSpec, Datastore};
pub use error::{DatastoreError, DatastoreResult};
pub use store::DurableStore;
pub use types::*;
