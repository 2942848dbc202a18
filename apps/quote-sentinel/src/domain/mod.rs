//! Core business logic, independent of transport and storage concerns.

pub mod hotset;
pub mod market;
pub mod signal;
