//! Durable State
//!
//! Database-backed implementation of the state store port.

pub mod turso;

pub use self::turso::TursoStateStore;
