//! Business logic for Nodeflow: the workflow engine and its building blocks.
//!
//! This crate defines the node contract and the checkpoint storage port that
//! embedders and the infrastructure layer implement. It depends only on
//! `nodeflow-types` -- never on `nodeflow-infra` or any filesystem crate.

pub mod event;
pub mod node;
pub mod workflow;
