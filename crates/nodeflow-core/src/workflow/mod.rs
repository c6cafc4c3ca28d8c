//! Workflow engine core: queueing, routing, scheduling and durable checkpointing.
//!
//! - `queue` -- per-node lease queue with Ready/InFlight slots
//! - `dead_letter` -- bounded dead-letter queue
//! - `dag` -- graph view of a definition: cycle check, ancestors, descendants
//! - `definition` -- structural validation of workflow definitions
//! - `router` -- connection matching, join gating, cancel cascade
//! - `context` -- per-instance runtime state and checkpoint snapshots
//! - `retry` -- retry policy evaluation and the retry wrapper
//! - `circuit_breaker` -- per-node circuit breaker
//! - `compensation` -- saga compensation on terminal failure
//! - `checkpoint` -- checkpoint storage port and the in-memory store
//! - `engine` -- instance lifecycle and the dispatch loop

pub mod checkpoint;
pub mod circuit_breaker;
pub mod compensation;
pub mod context;
pub mod dag;
pub mod dead_letter;
pub mod definition;
pub mod engine;
pub mod queue;
pub mod retry;
pub mod router;
