//! Infrastructure layer for Nodeflow.
//!
//! Contains implementations of the storage ports defined in `nodeflow-core`
//! (the durable file checkpoint store) and the configuration loader.

pub mod checkpoint_store;
pub mod config;

pub use checkpoint_store::FileCheckpointStore;
