//! Lifecycle event distribution.

pub mod bus;
