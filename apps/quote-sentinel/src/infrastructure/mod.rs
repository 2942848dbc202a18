//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// KIS Open API adapters (REST transport, streaming client, auth, codec).
pub mod kis;

/// Configuration loaded from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Webhook alert delivery.
pub mod notify;

/// Durable state on a local Turso database.
pub mod store;

/// Tracing subscriber setup.
pub mod telemetry;
