//! Shared domain types for Nodeflow.
//!
//! This crate contains the serializable vocabulary shared by the engine and
//! its storage backends: workflow definitions, messages, node-instance
//! records, checkpoints, lifecycle events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod compensation;
pub mod config;
pub mod definition;
pub mod event;
pub mod instance;
pub mod message;
pub mod status;
